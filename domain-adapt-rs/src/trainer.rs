//! Epoch/phase driver.
//!
//! Each epoch applies the learning-rate schedule, then visits
//! [`Phase::SourceTrain`], [`Phase::SourceVal`] and [`Phase::TargetVal`] in
//! that order. After the target-validation phase a checkpoint is always
//! written and a best-model record when the gating rule allows it.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, CheckpointManager, RestoredState};
use crate::config::AdaptConfig;
use crate::dataset::{BatchSource, DatasetProvider, DomainDatasets};
use crate::error::{AdaptError, Result};
use crate::loss::{correct_predictions, LossComposer, Stage};
use crate::metrics::{IntervalMeter, PhaseMetrics, PhaseSummary};
use crate::model::{AdaptationModel, MlpProvider, ModelProvider};
use crate::optimizer::{build_param_groups, GroupedOptimizer, OptimizerKind};
use crate::scheduler::LrSchedule;
use crate::sync::TargetCycler;

/// One pass over a data split within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Gradient updates on the labeled source split
    SourceTrain,
    /// Evaluation on the source validation split
    SourceVal,
    /// Evaluation on the target validation split
    TargetVal,
}

impl Phase {
    /// Phases in the order they run every epoch.
    pub const ALL: [Phase; 3] = [Phase::SourceTrain, Phase::SourceVal, Phase::TargetVal];

    /// Whether the phase updates parameters (and enables dropout).
    #[must_use]
    pub fn is_train(self) -> bool {
        self == Phase::SourceTrain
    }

    /// Name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::SourceTrain => "source_train",
            Phase::SourceVal => "source_val",
            Phase::TargetVal => "target_val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters owned by the driver and persisted in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainingState {
    /// Last finished (or current) epoch
    pub epoch: usize,
    /// Global source-train step counter
    pub step: usize,
    /// Running best target accuracy
    pub best_accuracy: f64,
}

/// Best-model gating.
///
/// Tracking starts once the adversarial phase has begun
/// (`epoch >= middle_epoch`); from then on a record is written when accuracy
/// improves, and always in the final epoch (`epoch >= max_epoch - 1`).
#[must_use]
pub fn should_save_best(
    accuracy: f64,
    best_accuracy: f64,
    epoch: usize,
    middle_epoch: usize,
    max_epoch: usize,
) -> bool {
    (accuracy > best_accuracy || epoch + 2 > max_epoch) && epoch + 1 > middle_epoch
}

/// Pick the training device.
///
/// CUDA is used when the crate is built with the `cuda` feature and a device
/// is available. `ADAPT_FORCE_CPU=1` forces the CPU and `ADAPT_CUDA_DEVICE`
/// selects the ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("ADAPT_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("ADAPT_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via ADAPT_FORCE_CPU");
        } else {
            tracing::info!("Training device: CPU (build with --features cuda for GPU)");
        }
        Device::Cpu
    }
}

/// Everything a run needs, assembled and validated before the first epoch.
pub struct TrainingContext {
    /// Resolved configuration
    pub config: AdaptConfig,
    /// The four data streams
    pub datasets: DomainDatasets,
    /// The model
    pub model: AdaptationModel,
    /// Optimizer over the model's parameter groups
    pub optimizer: GroupedOptimizer,
    /// Learning-rate schedule
    pub schedule: LrSchedule,
    /// Loss composer
    pub composer: LossComposer,
    /// Checkpoint writer for the run directory
    pub checkpoints: CheckpointManager,
    /// Driver counters
    pub state: TrainingState,
    /// First epoch to run
    pub start_epoch: usize,
}

impl TrainingContext {
    /// Build the context with the reference MLP model and MK-MMD loss.
    ///
    /// # Errors
    ///
    /// Configuration and device errors are returned before any data is
    /// read; dataset, model and checkpoint-directory errors follow.
    pub fn setup(
        config: AdaptConfig,
        data: &dyn DatasetProvider,
        save_dir: &Path,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let composer = LossComposer::from_training_config(&config.training)?;
        let datasets = data.load(&config, device)?;
        let provider = MlpProvider::new(datasets.input_dim, config.model.hidden_dims.clone());
        Self::assemble(config, datasets, &provider, composer, save_dir, device)
    }

    /// Build the context from already loaded parts.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, model construction or the checkpoint
    /// directory fails.
    pub fn assemble(
        config: AdaptConfig,
        datasets: DomainDatasets,
        provider: &dyn ModelProvider,
        composer: LossComposer,
        save_dir: &Path,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let training = &config.training;

        let max_iter =
            datasets.source_train.num_batches() * (training.max_epoch - training.middle_epoch);
        let mut model = AdaptationModel::build(
            provider,
            config.model.feature_head(),
            config.model.adaptation_mode(),
            datasets.num_classes,
            max_iter,
            device,
        )?;
        if let Some(pretrained) = &config.model.pretrained {
            model.load_pretrained(pretrained)?;
        }

        let kind = OptimizerKind::from_training_config(training)?;
        let optimizer = GroupedOptimizer::new(kind, build_param_groups(&model, training.lr)?)?;
        tracing::info!(
            "Initialized {} optimizer with lr={}, {} parameter groups, {} trainable params",
            optimizer.kind().name(),
            training.lr,
            optimizer.groups().len(),
            optimizer.param_count()
        );
        let schedule = LrSchedule::from_training_config(training)?;
        let checkpoints = CheckpointManager::new(save_dir, training.max_model_num)?;

        if training.devices > 1 {
            tracing::info!(
                "Batch of {} split over {} devices ({} per device)",
                training.batch_size,
                training.devices,
                training.batch_size / training.devices
            );
        }

        Ok(Self {
            config,
            datasets,
            model,
            optimizer,
            schedule,
            composer,
            checkpoints,
            state: TrainingState::default(),
            start_epoch: 0,
        })
    }

    /// Restore from a `.ckpt` or `.safetensors` file.
    ///
    /// # Errors
    ///
    /// See [`checkpoint::restore`].
    pub fn resume(&mut self, path: &Path) -> Result<RestoredState> {
        let restored = checkpoint::restore(path, &mut self.model, &mut self.optimizer)?;
        self.start_epoch = restored.start_epoch;
        self.state = TrainingState {
            epoch: restored.start_epoch.saturating_sub(1),
            step: restored.step,
            best_accuracy: restored.best_accuracy,
        };
        Ok(restored)
    }
}

/// Per-epoch record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch index
    pub epoch: usize,
    /// Learning rate of each parameter group
    pub learning_rates: Vec<f64>,
    /// Adversarial weight, once the adversarial phase has started
    pub lambda: Option<f64>,
    /// Phase summaries in run order
    pub phases: Vec<PhaseSummary>,
    /// Checkpoint written after the epoch
    pub checkpoint: PathBuf,
    /// Best-model record written after the epoch, if any
    pub best_model: Option<PathBuf>,
}

/// What a call to [`Trainer::train`] did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// One record per epoch run
    pub epochs: Vec<EpochRecord>,
    /// Best target accuracy at the end
    pub best_accuracy: f64,
    /// Global step counter at the end
    pub steps: usize,
}

impl TrainingHistory {
    /// Write the history as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use domain_adapt_rs::{AdaptConfig, SafetensorsProvider, Trainer, TrainingContext};
/// use std::path::Path;
///
/// # fn main() -> domain_adapt_rs::Result<()> {
/// let config = AdaptConfig::from_file("config.yaml")?;
/// let device = domain_adapt_rs::trainer::select_device();
/// let ctx = TrainingContext::setup(config, &SafetensorsProvider, Path::new("./run"), &device)?;
/// let history = Trainer::new(ctx).train()?;
/// println!("best target accuracy {:.4}", history.best_accuracy);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    ctx: TrainingContext,
    show_progress: bool,
}

impl Trainer {
    /// Wrap a prepared context.
    #[must_use]
    pub fn new(ctx: TrainingContext) -> Self {
        Self {
            ctx,
            show_progress: true,
        }
    }

    /// Enable or disable the progress bar.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// The training context.
    pub fn context(&self) -> &TrainingContext {
        &self.ctx
    }

    /// Give back the context (e.g. to inspect the trained model).
    pub fn into_context(self) -> TrainingContext {
        self.ctx
    }

    /// Run epochs `[start_epoch, max_epoch)`.
    ///
    /// # Errors
    ///
    /// Any failure ends the run; the last checkpoint written is the
    /// recovery point.
    pub fn train(&mut self) -> Result<TrainingHistory> {
        let training = self.ctx.config.training.clone();
        tracing::info!("Starting training");
        tracing::info!(
            "  Task: {} -> {}",
            self.ctx.config.data.source,
            self.ctx.config.data.target
        );
        tracing::info!(
            "  Epochs: {} (adversarial from {}), start at {}",
            training.max_epoch,
            training.middle_epoch,
            self.ctx.start_epoch
        );
        tracing::info!(
            "  Adversarial weight: {:?}",
            self.ctx.composer.trade_off()
        );
        tracing::info!(
            "  Source/target train batches: {}/{}",
            self.ctx.datasets.source_train.num_batches(),
            self.ctx.datasets.target_train.num_batches()
        );

        let mut history = TrainingHistory::default();
        let mut meter = IntervalMeter::new(training.print_step);

        for epoch in self.ctx.start_epoch..training.max_epoch {
            tracing::info!("-----Epoch {}/{}-----", epoch, training.max_epoch - 1);
            let learning_rates = self.ctx.schedule.apply(&mut self.ctx.optimizer, epoch);
            tracing::info!("current lr: {:?}", learning_rates);

            let mut phases = Vec::with_capacity(Phase::ALL.len());
            for phase in Phase::ALL {
                phases.push(self.run_phase(epoch, phase, &mut meter)?);
            }
            let target_accuracy = phases
                .last()
                .map_or(0.0, |summary| summary.accuracy);

            self.ctx.state.epoch = epoch;
            let best_model = if should_save_best(
                target_accuracy,
                self.ctx.state.best_accuracy,
                epoch,
                training.middle_epoch,
                training.max_epoch,
            ) {
                self.ctx.state.best_accuracy = target_accuracy;
                Some(
                    self.ctx
                        .checkpoints
                        .save_best(epoch, target_accuracy, &self.ctx.model)?,
                )
            } else {
                None
            };
            let checkpoint = self.ctx.checkpoints.save_checkpoint(
                &self.ctx.state,
                &self.ctx.model,
                &self.ctx.optimizer,
            )?;

            history.epochs.push(EpochRecord {
                epoch,
                learning_rates,
                lambda: (epoch >= training.middle_epoch).then(|| self.ctx.composer.lambda(epoch)),
                phases,
                checkpoint,
                best_model,
            });
        }

        history.best_accuracy = self.ctx.state.best_accuracy;
        history.steps = self.ctx.state.step;
        tracing::info!(
            "Training complete: {} steps, best target acc {:.4}",
            history.steps,
            history.best_accuracy
        );
        Ok(history)
    }

    fn run_phase(
        &mut self,
        epoch: usize,
        phase: Phase,
        meter: &mut IntervalMeter,
    ) -> Result<PhaseSummary> {
        let TrainingContext {
            datasets,
            model,
            optimizer,
            composer,
            state,
            ..
        } = &mut self.ctx;

        let source: &dyn BatchSource = match phase {
            Phase::SourceTrain => datasets.source_train.as_ref(),
            Phase::SourceVal => datasets.source_val.as_ref(),
            Phase::TargetVal => datasets.target_val.as_ref(),
        };
        let mut cycler = match composer.stage(phase, epoch) {
            Stage::Adversarial => Some(TargetCycler::new(datasets.target_train.as_ref())?),
            Stage::Classification => None,
        };

        let pb = if phase.is_train() && self.show_progress {
            let pb = ProgressBar::new(source.num_batches() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut metrics = PhaseMetrics::start(phase);
        for (batch_idx, batch) in source.batches()?.enumerate() {
            let batch = batch?;
            let target = match cycler.as_mut() {
                Some(cycler) => Some(cycler.next_batch()?),
                None => None,
            };

            let output = composer.compute(model, phase, epoch, &batch, target.as_ref())?;
            let loss = output.loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            let correct = correct_predictions(&output.logits, &output.labels)?;
            metrics.record(loss, correct, output.label_count);

            if !phase.is_train() {
                continue;
            }
            if !loss.is_finite() {
                return Err(AdaptError::Training(format!(
                    "non-finite loss {loss} at epoch {epoch}, step {}",
                    state.step
                )));
            }
            optimizer.backward_step(&output.loss)?;

            if let Some(report) = meter.record(state.step, loss, correct, output.label_count) {
                tracing::info!(
                    "Epoch: {} [{}/{}], Train Loss: {:.4} Train Acc: {:.4}, {:.1} samples/sec {:.2} sec/batch",
                    epoch,
                    batch_idx * output.label_count,
                    source.num_samples(),
                    report.loss,
                    report.accuracy,
                    report.samples_per_sec,
                    report.sec_per_batch
                );
            }
            if let Some(cycler) = cycler.as_mut() {
                cycler.after_step(state.step);
            }
            state.step += 1;
            pb.set_message(format!("loss {loss:.4}"));
            pb.inc(1);
        }
        pb.finish_and_clear();

        if let Some(cycler) = &cycler {
            tracing::debug!(
                "Epoch {} target stream restarts: {}",
                epoch,
                cycler.restarts()
            );
        }

        let summary = metrics.finish();
        tracing::info!(
            "Epoch: {} {}-Loss: {:.4} {}-Acc: {:.4}, Cost {:.1} sec",
            epoch,
            phase,
            summary.loss,
            phase,
            summary.accuracy,
            summary.elapsed_secs
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_modes() {
        assert_eq!(
            Phase::ALL,
            [Phase::SourceTrain, Phase::SourceVal, Phase::TargetVal]
        );
        assert!(Phase::SourceTrain.is_train());
        assert!(!Phase::SourceVal.is_train());
        assert!(!Phase::TargetVal.is_train());
        assert_eq!(Phase::TargetVal.to_string(), "target_val");
    }

    #[test]
    fn test_best_model_gating_scenario() {
        let (middle, max) = (5, 10);
        let records = [(6, 0.1), (7, 0.2), (8, 0.05), (8, 0.9), (9, 0.3)];
        let mut best = 0.0;
        let mut saved = Vec::new();
        for (epoch, accuracy) in records {
            let save = should_save_best(accuracy, best, epoch, middle, max);
            if save {
                best = accuracy;
            }
            saved.push(save);
        }
        assert_eq!(saved, vec![true, true, false, true, true]);
        // the forced final save still moves the running best
        assert_eq!(best, 0.3);
    }

    #[test]
    fn test_no_best_model_during_warmup() {
        assert!(!should_save_best(0.99, 0.0, 3, 5, 10));
        assert!(!should_save_best(0.99, 0.0, 4, 5, 10));
        assert!(should_save_best(0.99, 0.0, 5, 5, 10));
    }

    #[test]
    fn test_final_epoch_always_qualifies() {
        assert!(should_save_best(0.1, 0.9, 9, 5, 10));
        assert!(!should_save_best(0.1, 0.9, 8, 5, 10));
    }

    #[test]
    fn test_history_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let history = TrainingHistory {
            epochs: vec![EpochRecord {
                epoch: 0,
                learning_rates: vec![0.1],
                lambda: None,
                phases: vec![PhaseMetrics::start(Phase::SourceTrain).finish()],
                checkpoint: PathBuf::from("0_checkpoint.ckpt"),
                best_model: None,
            }],
            best_accuracy: 0.0,
            steps: 4,
        };
        let path = dir.path().join("history.json");
        history.save_json(&path).unwrap();
        let loaded: TrainingHistory =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.steps, 4);
        assert_eq!(loaded.epochs[0].phases[0].phase, Phase::SourceTrain);
    }
}
