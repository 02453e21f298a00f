//! CLI entry point for domain-adapt-rs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use domain_adapt_rs::checkpoint::ResumeKind;
use domain_adapt_rs::trainer::select_device;
use domain_adapt_rs::{AdaptConfig, Result, SafetensorsProvider, Trainer, TrainingContext};

#[derive(Parser)]
#[command(name = "domain-adapt")]
#[command(about = "Adversarial domain adaptation trainer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a .ckpt checkpoint or .safetensors weights
        #[arg(long)]
        resume: Option<String>,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (cwru, smoke)
        #[arg(long, default_value = "cwru")]
        preset: String,
    },
}

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        // setup errors exit 2, run errors exit 1
        if e.is_setup_error() {
            eprintln!("✗ Setup failed: {e}");
            std::process::exit(2);
        }
        eprintln!("✗ Run failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = AdaptConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Task: {} -> {}", config.data.source, config.data.target);
            println!(
                "  Epochs: {} (adversarial from {})",
                config.training.max_epoch, config.training.middle_epoch
            );
            println!(
                "  Optimizer: {} (lr {}, schedule {})",
                config.training.opt, config.training.lr, config.training.lr_scheduler
            );
        }
        Commands::Train {
            config,
            resume,
            no_progress,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = AdaptConfig::from_file(&config)?;
            config.validate()?;
            let resume = resume.map(PathBuf::from);
            if let Some(path) = &resume {
                ResumeKind::from_path(path)?;
            }

            let save_dir = run_dir(&config);
            std::fs::create_dir_all(&save_dir)?;
            config.to_file(save_dir.join("config.yaml"))?;
            tracing::info!("Run directory: {}", save_dir.display());

            let device = select_device();
            let mut ctx = TrainingContext::setup(config, &SafetensorsProvider, &save_dir, &device)?;
            if let Some(path) = resume {
                ctx.resume(&path)?;
            }

            let mut trainer = Trainer::new(ctx).with_progress(!no_progress);
            let history = trainer.train()?;
            history.save_json(save_dir.join("history.json"))?;
            println!("✓ Training complete, best target accuracy {:.4}", history.best_accuracy);
            println!("  Outputs: {}", save_dir.display());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = AdaptConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}

/// `{output_dir}/{run_name}_{MMDD-HHMMSS}`
fn run_dir(config: &AdaptConfig) -> PathBuf {
    let stamp = chrono::Local::now().format("%m%d-%H%M%S");
    Path::new(&config.output_dir).join(format!("{}_{stamp}", config.run_name))
}
