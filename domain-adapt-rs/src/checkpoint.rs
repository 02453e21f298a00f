//! Checkpoint persistence and resume.
//!
//! Two record kinds live in the run directory:
//!
//! - **Resumable** checkpoints `{epoch}_checkpoint.ckpt`: a safetensors
//!   container with the model (`model.*`), the optimizer (`optim.*`) and the
//!   training counters (`state.epoch`, `state.step`, `state.best_accuracy`).
//!   Only the most recent `max_keep` are retained.
//! - **Best-model** records `{epoch}-{accuracy:.4}-best_model.safetensors`:
//!   bare model weights, never rotated.
//!
//! On resume the file extension selects what is restored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{AdaptError, Result};
use crate::model::AdaptationModel;
use crate::optimizer::GroupedOptimizer;
use crate::trainer::TrainingState;

const CHECKPOINT_SUFFIX: &str = "_checkpoint.ckpt";
const BEST_SUFFIX: &str = "-best_model.safetensors";
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";
const STATE_EPOCH: &str = "state.epoch";
const STATE_STEP: &str = "state.step";
const STATE_BEST: &str = "state.best_accuracy";

/// What a resume file contains, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    /// `.ckpt`: model, optimizer and counters
    Resumable,
    /// `.safetensors`: model weights only
    WeightsOnly,
}

impl ResumeKind {
    /// Classify a resume path.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for any other extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("ckpt") => Ok(Self::Resumable),
            Some("safetensors") => Ok(Self::WeightsOnly),
            _ => Err(AdaptError::Config(format!(
                "cannot resume from {}: expected a .ckpt or .safetensors file",
                path.display()
            ))),
        }
    }
}

/// Counters recovered from a resume file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoredState {
    /// Kind of file that was loaded
    pub kind: ResumeKind,
    /// First epoch to run
    pub start_epoch: usize,
    /// Global step counter
    pub step: usize,
    /// Best target accuracy seen so far
    pub best_accuracy: f64,
}

/// Writes checkpoint and best-model records and rotates old checkpoints.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_keep: usize,
    /// Checkpoint files, oldest first
    checkpoints: Vec<PathBuf>,
    best: Vec<PathBuf>,
}

impl CheckpointManager {
    /// Create a manager for `dir`, adopting checkpoints already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read.
    pub fn new(dir: impl AsRef<Path>, max_keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            AdaptError::Checkpoint(format!(
                "failed to create checkpoint directory {}: {e}",
                dir.display()
            ))
        })?;
        let checkpoints = Self::scan_checkpoints(&dir)?;

        Ok(Self {
            dir,
            max_keep: max_keep.max(1),
            checkpoints,
            best: Vec::new(),
        })
    }

    /// Directory the records are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retained checkpoint files, oldest first.
    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// Best-model files written by this manager.
    pub fn best_models(&self) -> &[PathBuf] {
        &self.best
    }

    /// Write `{epoch}_checkpoint.ckpt` and evict the oldest beyond `max_keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, the write or an eviction fails.
    pub fn save_checkpoint(
        &mut self,
        state: &TrainingState,
        model: &AdaptationModel,
        optimizer: &GroupedOptimizer,
    ) -> Result<PathBuf> {
        let mut tensors = HashMap::new();
        for (name, tensor) in model.state_dict()? {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), tensor);
        }
        for (name, tensor) in optimizer.state_dict()? {
            tensors.insert(format!("{OPTIM_PREFIX}{name}"), tensor);
        }
        tensors.insert(
            STATE_EPOCH.to_string(),
            Tensor::new(state.epoch as i64, &Device::Cpu)?,
        );
        tensors.insert(
            STATE_STEP.to_string(),
            Tensor::new(state.step as i64, &Device::Cpu)?,
        );
        tensors.insert(
            STATE_BEST.to_string(),
            Tensor::new(state.best_accuracy, &Device::Cpu)?,
        );

        let path = self.dir.join(format!("{}{CHECKPOINT_SUFFIX}", state.epoch));
        write_tensors(&tensors, &path)?;
        tracing::info!("Saved checkpoint {}", path.display());

        self.checkpoints.retain(|p| p != &path);
        self.checkpoints.push(path.clone());
        self.rotate_checkpoints()?;
        Ok(path)
    }

    /// Write a best-model record. These are never evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_best(
        &mut self,
        epoch: usize,
        accuracy: f64,
        model: &AdaptationModel,
    ) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("{epoch}-{accuracy:.4}{BEST_SUFFIX}"));
        write_tensors(&model.state_dict()?, &path)?;
        tracing::info!(
            "Saved best model (epoch {}, acc {:.4}) to {}",
            epoch,
            accuracy,
            path.display()
        );
        self.best.push(path.clone());
        Ok(path)
    }

    fn scan_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut checkpoints: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_suffix(CHECKPOINT_SUFFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(epoch) = epoch {
                checkpoints.push((epoch, path));
            }
        }
        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints.into_iter().map(|(_, p)| p).collect())
    }

    fn rotate_checkpoints(&mut self) -> Result<()> {
        while self.checkpoints.len() > self.max_keep {
            let old = self.checkpoints.remove(0);
            std::fs::remove_file(&old).map_err(|e| {
                AdaptError::Checkpoint(format!(
                    "failed to delete old checkpoint {}: {e}",
                    old.display()
                ))
            })?;
            tracing::debug!("Evicted checkpoint {}", old.display());
        }
        Ok(())
    }
}

/// Restore model (and, for `.ckpt`, optimizer and counters) from `path`.
///
/// # Errors
///
/// Returns [`AdaptError::Config`] for an unsupported extension and
/// [`AdaptError::Checkpoint`] for unreadable or incomplete files.
pub fn restore(
    path: &Path,
    model: &mut AdaptationModel,
    optimizer: &mut GroupedOptimizer,
) -> Result<RestoredState> {
    let kind = ResumeKind::from_path(path)?;
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
        AdaptError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;

    match kind {
        ResumeKind::WeightsOnly => {
            model.load_state_dict(&tensors)?;
            tracing::info!("Loaded model weights from {}", path.display());
            Ok(RestoredState {
                kind,
                start_epoch: 0,
                step: 0,
                best_accuracy: 0.0,
            })
        }
        ResumeKind::Resumable => {
            let mut model_state = HashMap::new();
            let mut optim_state = HashMap::new();
            for (name, tensor) in &tensors {
                if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                    model_state.insert(rest.to_string(), tensor.clone());
                } else if let Some(rest) = name.strip_prefix(OPTIM_PREFIX) {
                    optim_state.insert(rest.to_string(), tensor.clone());
                }
            }
            model.load_state_dict(&model_state)?;
            optimizer.load_state_dict(&optim_state)?;

            let epoch = read_i64(&tensors, STATE_EPOCH, path)?;
            let step = read_i64(&tensors, STATE_STEP, path)?;
            let best_accuracy = tensors
                .get(STATE_BEST)
                .ok_or_else(|| missing(STATE_BEST, path))?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            tracing::info!(
                "Resumed from {} (epoch {}, step {}, best acc {:.4})",
                path.display(),
                epoch,
                step,
                best_accuracy
            );
            Ok(RestoredState {
                kind,
                start_epoch: epoch as usize + 1,
                step: step as usize,
                best_accuracy,
            })
        }
    }
}

fn read_i64(tensors: &HashMap<String, Tensor>, key: &str, path: &Path) -> Result<i64> {
    let value = tensors
        .get(key)
        .ok_or_else(|| missing(key, path))?
        .to_scalar::<i64>()?;
    if value < 0 {
        return Err(AdaptError::Checkpoint(format!(
            "{} has negative {key}",
            path.display()
        )));
    }
    Ok(value)
}

fn missing(key: &str, path: &Path) -> AdaptError {
    AdaptError::Checkpoint(format!("{} is missing '{key}'", path.display()))
}

/// Write through a temporary file so an interrupted save never leaves a
/// truncated record under the final name.
fn write_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let mut on_cpu: HashMap<&str, Tensor> = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        on_cpu.insert(name.as_str(), tensor.to_device(&Device::Cpu)?);
    }
    let tmp = path.with_extension("tmp");
    candle_core::safetensors::save(&on_cpu, &tmp).map_err(|e| {
        AdaptError::Checkpoint(format!("failed to write {}: {e}", path.display()))
    })?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
