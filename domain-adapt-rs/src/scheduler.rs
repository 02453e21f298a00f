//! Learning rate schedules.
//!
//! Schedules are evaluated in closed form from the epoch index, so resuming
//! at epoch `k` yields the same rate as an uninterrupted run.

use crate::config::TrainingConfig;
use crate::error::{AdaptError, Result};
use crate::optimizer::GroupedOptimizer;

/// Learning rate schedule, resolved once from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum LrSchedule {
    /// Multiply by `gamma` at every milestone epoch.
    MultiStep {
        /// Sorted milestone epochs
        milestones: Vec<usize>,
        /// Decay factor
        gamma: f64,
    },
    /// Multiply by `gamma` every epoch.
    Exponential {
        /// Decay factor
        gamma: f64,
    },
    /// Multiply by `gamma` every `step_size` epochs.
    StepLr {
        /// Period in epochs
        step_size: usize,
        /// Decay factor
        gamma: f64,
    },
    /// Keep the base learning rate.
    Fixed,
    /// Per-group annealing `base / (1 + alpha * epoch / max_epoch)^beta`.
    TransferLearning {
        /// Total number of epochs
        max_epoch: usize,
        /// Annealing speed
        alpha: f64,
        /// Annealing exponent
        beta: f64,
    },
}

impl LrSchedule {
    /// Resolve the schedule named in the training configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for an unknown schedule name or
    /// malformed `steps`.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        match config.lr_scheduler.as_str() {
            "step" => {
                let mut milestones = parse_milestones(&config.steps)?;
                milestones.sort_unstable();
                Ok(Self::MultiStep {
                    milestones,
                    gamma: config.gamma,
                })
            }
            "exp" => Ok(Self::Exponential {
                gamma: config.gamma,
            }),
            "stepLR" => {
                let step_size: usize = config.steps.trim().parse().map_err(|_| {
                    AdaptError::Config(format!(
                        "stepLR expects a single integer period in training.steps, got '{}'",
                        config.steps
                    ))
                })?;
                if step_size == 0 {
                    return Err(AdaptError::Config("stepLR period must be > 0".into()));
                }
                Ok(Self::StepLr {
                    step_size,
                    gamma: config.gamma,
                })
            }
            "fix" => Ok(Self::Fixed),
            "transferLearning" => Ok(Self::TransferLearning {
                max_epoch: config.max_epoch,
                alpha: 10.0,
                beta: 0.75,
            }),
            other => Err(AdaptError::Config(format!(
                "unknown lr scheduler '{other}' (expected step, exp, stepLR, fix or transferLearning)"
            ))),
        }
    }

    /// Learning rate for a group whose base rate is `base_lr` at `epoch`.
    #[must_use]
    pub fn lr_at(&self, base_lr: f64, epoch: usize) -> f64 {
        match self {
            Self::MultiStep { milestones, gamma } => {
                let passed = milestones.partition_point(|&m| m <= epoch);
                base_lr * gamma.powi(passed as i32)
            }
            Self::Exponential { gamma } => base_lr * gamma.powi(epoch as i32),
            Self::StepLr { step_size, gamma } => {
                base_lr * gamma.powi((epoch / step_size) as i32)
            }
            Self::Fixed => base_lr,
            Self::TransferLearning {
                max_epoch,
                alpha,
                beta,
            } => {
                let progress = epoch as f64 / (*max_epoch).max(1) as f64;
                base_lr / (1.0 + alpha * progress).powf(*beta)
            }
        }
    }

    /// Set every parameter group's rate for `epoch` and return the new rates.
    ///
    /// `Fixed` leaves the optimizer untouched.
    pub fn apply(&self, optimizer: &mut GroupedOptimizer, epoch: usize) -> Vec<f64> {
        if !matches!(self, Self::Fixed) {
            for group in optimizer.groups_mut() {
                group.lr = self.lr_at(group.initial_lr, epoch);
            }
        }
        optimizer.learning_rates()
    }

    /// Configuration name of the schedule.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::MultiStep { .. } => "step",
            Self::Exponential { .. } => "exp",
            Self::StepLr { .. } => "stepLR",
            Self::Fixed => "fix",
            Self::TransferLearning { .. } => "transferLearning",
        }
    }
}

fn parse_milestones(steps: &str) -> Result<Vec<usize>> {
    steps
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>().map_err(|_| {
                AdaptError::Config(format!("invalid milestone '{s}' in training.steps"))
            })
        })
        .collect()
}
