//! # domain-adapt-rs
//!
//! YAML-driven adversarial domain adaptation trainer built on candle.
//!
//! A shared feature extractor is trained so that a classifier performs well
//! on labeled source-domain data while a domain discriminator, behind a
//! gradient-reversal layer, fails to tell source features from target
//! features. A multi-kernel MMD term further aligns the two feature
//! distributions.
//!
//! ## Features
//!
//! - **Staged schedule** - classification-only warm-up, then adversarial training
//! - **Stream pairing** - every source batch is paired with a cycled target batch
//! - **Composite loss** - cross-entropy + λ·(discriminator BCE + MK-MMD), λ ramped or constant
//! - **Checkpoints** - rotating resumable checkpoints plus append-only best models
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! domain-adapt init config.yaml --preset cwru
//!
//! # Validate it
//! domain-adapt validate config.yaml
//!
//! # Train, optionally resuming
//! domain-adapt train config.yaml --resume ./checkpoint/mlp_0101-120000/41_checkpoint.ckpt
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use domain_adapt_rs::{AdaptConfig, SafetensorsProvider, Trainer, TrainingContext};
//! use std::path::Path;
//!
//! # fn main() -> domain_adapt_rs::Result<()> {
//! let config = AdaptConfig::from_file("config.yaml")?;
//! let device = domain_adapt_rs::trainer::select_device();
//! let ctx = TrainingContext::setup(config, &SafetensorsProvider, Path::new("./run"), &device)?;
//! Trainer::new(ctx).train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use domain_adapt_rs::AdaptConfig;
//!
//! # fn main() -> domain_adapt_rs::Result<()> {
//! let mut config = AdaptConfig::from_preset("cwru")?;
//! config.training.max_epoch = 100;
//! config.training.middle_epoch = 20;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod sync;
pub mod trainer;

pub use checkpoint::{CheckpointManager, ResumeKind};
pub use config::{AdaptConfig, DataConfig, ModelConfig, TrainingConfig};
pub use dataset::{Batch, BatchSource, DatasetProvider, SafetensorsProvider, TensorDataset};
pub use error::{AdaptError, Result};
pub use loss::{LossComposer, MultiKernelMmd, StructuralLoss, TradeOff};
pub use model::{AdaptationModel, DomainDiscriminator, FeatureExtractor, ModelProvider};
pub use trainer::{Phase, Trainer, TrainingContext, TrainingHistory, TrainingState};
