//! Staged loss composition.
//!
//! During warm-up, and in every validation phase, the loss is plain
//! cross-entropy on the source batch. From `middle_epoch` on, the training
//! phase concatenates source and target inputs, computes features once and
//! adds a discriminator term and a structural discrepancy term, both scaled
//! by the adversarial weight λ.

use candle_core::{DType, Device, Tensor, D};

use crate::config::TrainingConfig;
use crate::dataset::Batch;
use crate::error::{AdaptError, Result};
use crate::model::AdaptationModel;
use crate::trainer::Phase;

/// Policy for the adversarial weight λ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeOff {
    /// Fixed weight.
    Constant(f64),
    /// Sigmoid ramp `2 / (1 + exp(-10 p)) - 1` over the adversarial phase.
    Step,
}

impl TradeOff {
    /// Resolve the policy named in the training configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for anything but `Cons` or `Step`.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        match config.trade_off_adversarial.as_str() {
            "Cons" => Ok(Self::Constant(config.lam_adversarial)),
            "Step" => Ok(Self::Step),
            other => Err(AdaptError::Config(format!(
                "unknown trade-off policy '{other}' (expected Cons or Step)"
            ))),
        }
    }

    /// λ at `epoch`.
    ///
    /// `p = (epoch - middle) / (max - middle)` is not clamped, so epochs
    /// before `middle` give negative weights; they are never queried by the
    /// composer.
    #[must_use]
    pub fn lambda(&self, epoch: usize, middle_epoch: usize, max_epoch: usize) -> f64 {
        match self {
            Self::Constant(lambda) => *lambda,
            Self::Step => {
                let span = max_epoch.saturating_sub(middle_epoch).max(1) as f64;
                let progress = (epoch as f64 - middle_epoch as f64) / span;
                2.0 / (1.0 + (-10.0 * progress).exp()) - 1.0
            }
        }
    }
}

/// Distribution discrepancy between source and target features.
pub trait StructuralLoss: Send + Sync {
    /// Scalar discrepancy; row counts of the two inputs may differ.
    fn discrepancy(&self, source: &Tensor, target: &Tensor) -> candle_core::Result<Tensor>;
}

/// Multi-kernel maximum mean discrepancy with Gaussian kernels.
///
/// Bandwidths are `base * kernel_mul^i` for `i in 0..kernel_num`, centred on
/// the mean pairwise squared distance of the pooled batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiKernelMmd {
    /// Ratio between neighbouring bandwidths
    pub kernel_mul: f64,
    /// Number of kernels
    pub kernel_num: usize,
}

impl Default for MultiKernelMmd {
    fn default() -> Self {
        Self {
            kernel_mul: 2.0,
            kernel_num: 5,
        }
    }
}

impl MultiKernelMmd {
    fn kernel_matrix(&self, total: &Tensor) -> candle_core::Result<Tensor> {
        let n = total.dim(0)?;
        let diff = total.unsqueeze(0)?.broadcast_sub(&total.unsqueeze(1)?)?;
        let l2 = diff.sqr()?.sum(D::Minus1)?;

        let pair_count = (n * n - n).max(1) as f64;
        let mean_distance = l2.detach().sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()? / pair_count;
        let base = (mean_distance / self.kernel_mul.powi((self.kernel_num / 2) as i32)).max(1e-12);

        let mut kernels = l2.affine(-1.0 / base, 0.0)?.exp()?;
        for i in 1..self.kernel_num {
            let bandwidth = base * self.kernel_mul.powi(i as i32);
            kernels = kernels.add(&l2.affine(-1.0 / bandwidth, 0.0)?.exp()?)?;
        }
        Ok(kernels)
    }
}

impl StructuralLoss for MultiKernelMmd {
    fn discrepancy(&self, source: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
        let n_s = source.dim(0)?;
        let n_t = target.dim(0)?;
        let total = Tensor::cat(&[source, target], 0)?;
        let kernels = self.kernel_matrix(&total)?;

        let ss = kernels.narrow(0, 0, n_s)?.narrow(1, 0, n_s)?.mean_all()?;
        let tt = kernels.narrow(0, n_s, n_t)?.narrow(1, n_s, n_t)?.mean_all()?;
        let st = kernels.narrow(0, 0, n_s)?.narrow(1, n_s, n_t)?.mean_all()?;
        let ts = kernels.narrow(0, n_s, n_t)?.narrow(1, 0, n_s)?.mean_all()?;
        ss.add(&tt)?.sub(&st)?.sub(&ts)
    }
}

const PROB_EPS: f32 = 1e-7;

/// Mean binary cross-entropy of probabilities against `{0, 1}` targets.
///
/// Probabilities are clamped to `[1e-7, 1 - 1e-7]` before the logs, so a
/// sigmoid that rounds to exactly 0 or 1 keeps both the value and the
/// gradient finite.
pub fn binary_cross_entropy(probs: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let log_p = probs.log()?;
    let log_not_p = probs.affine(-1.0, 1.0)?.log()?;
    let positive = targets.mul(&log_p)?;
    let negative = targets.affine(-1.0, 1.0)?.mul(&log_not_p)?;
    positive.add(&negative)?.mean_all()?.neg()
}

/// `1.0` for every source row followed by `0.0` for every target row.
pub fn domain_labels(
    label_count: usize,
    target_count: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let source = Tensor::ones(label_count, DType::F32, device)?;
    let target = Tensor::zeros(target_count, DType::F32, device)?;
    Tensor::cat(&[&source, &target], 0)
}

/// Number of rows whose argmax matches the label.
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let correct = logits
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as usize)
}

/// Which loss a batch receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Cross-entropy on the source batch only.
    Classification,
    /// Cross-entropy plus λ-weighted adversarial and structural terms.
    Adversarial,
}

/// Scalar value of every term, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    /// Cross-entropy on the source rows
    pub classification: f64,
    /// Discriminator BCE (adversarial stage with a discriminator)
    pub adversarial: Option<f64>,
    /// Structural discrepancy (adversarial stage)
    pub structural: Option<f64>,
    /// λ used for the weighted terms
    pub lambda: Option<f64>,
}

/// Result of one forward pass through the composer.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Scalar total loss (detached outside training)
    pub loss: Tensor,
    /// Logits of the source rows only
    pub logits: Tensor,
    /// Source labels
    pub labels: Tensor,
    /// Source rows in the forward pass
    pub label_count: usize,
    /// Target rows in the forward pass (0 in the classification stage)
    pub target_count: usize,
    /// Rows that went through the feature extractor
    pub concat_rows: usize,
    /// Per-term values
    pub terms: LossTerms,
}

/// Builds the phase- and epoch-dependent loss.
pub struct LossComposer {
    trade_off: TradeOff,
    structural: Box<dyn StructuralLoss>,
    middle_epoch: usize,
    max_epoch: usize,
}

impl LossComposer {
    /// Create a composer with an explicit structural loss.
    pub fn new(
        trade_off: TradeOff,
        structural: Box<dyn StructuralLoss>,
        middle_epoch: usize,
        max_epoch: usize,
    ) -> Self {
        Self {
            trade_off,
            structural,
            middle_epoch,
            max_epoch,
        }
    }

    /// Composer with the configured trade-off and [`MultiKernelMmd`].
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for an unknown trade-off name.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        Ok(Self::new(
            TradeOff::from_training_config(config)?,
            Box::new(MultiKernelMmd::default()),
            config.middle_epoch,
            config.max_epoch,
        ))
    }

    /// The trade-off policy.
    pub fn trade_off(&self) -> TradeOff {
        self.trade_off
    }

    /// Stage used for `phase` at `epoch`.
    #[must_use]
    pub fn stage(&self, phase: Phase, epoch: usize) -> Stage {
        if phase != Phase::SourceTrain || epoch < self.middle_epoch {
            Stage::Classification
        } else {
            Stage::Adversarial
        }
    }

    /// λ at `epoch`.
    #[must_use]
    pub fn lambda(&self, epoch: usize) -> f64 {
        self.trade_off
            .lambda(epoch, self.middle_epoch, self.max_epoch)
    }

    /// Forward `source` (and `target` in the adversarial stage) and build the
    /// loss. Target labels are never read.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Training`] if the adversarial stage is reached
    /// without a target batch, or any tensor error.
    pub fn compute(
        &self,
        model: &mut AdaptationModel,
        phase: Phase,
        epoch: usize,
        source: &Batch,
        target: Option<&Batch>,
    ) -> Result<StepOutput> {
        let train = phase.is_train();
        let output = match self.stage(phase, epoch) {
            Stage::Classification => {
                let features = model.features(&source.inputs, train)?;
                let logits = model.classify(&features)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &source.labels)?;
                let rows = source.size();
                StepOutput {
                    terms: LossTerms {
                        classification: scalar(&loss)?,
                        ..Default::default()
                    },
                    loss,
                    logits,
                    labels: source.labels.clone(),
                    label_count: rows,
                    target_count: 0,
                    concat_rows: rows,
                }
            }
            Stage::Adversarial => {
                let target = target.ok_or_else(|| {
                    AdaptError::Training("adversarial stage requires a target batch".into())
                })?;
                self.adversarial(model, epoch, source, target, train)?
            }
        };

        if train {
            Ok(output)
        } else {
            Ok(StepOutput {
                loss: output.loss.detach(),
                logits: output.logits.detach(),
                ..output
            })
        }
    }

    fn adversarial(
        &self,
        model: &mut AdaptationModel,
        epoch: usize,
        source: &Batch,
        target: &Batch,
        train: bool,
    ) -> Result<StepOutput> {
        let label_count = source.size();
        let target_count = target.size();
        let inputs = Tensor::cat(&[&source.inputs, &target.inputs], 0)?;
        let concat_rows = inputs.dim(0)?;

        let features = model.features(&inputs, train)?;
        let logits = model.classify(&features)?.narrow(0, 0, label_count)?;
        let classification = candle_nn::loss::cross_entropy(&logits, &source.labels)?;
        let lambda = self.lambda(epoch);

        let adversarial = match model.discriminate(&features, train) {
            Some(probs) => {
                let probs = probs?.squeeze(D::Minus1)?;
                let domain = domain_labels(label_count, target_count, features.device())?;
                Some(binary_cross_entropy(&probs, &domain)?)
            }
            None => None,
        };
        let structural = self.structural.discrepancy(
            &features.narrow(0, 0, label_count)?,
            &features.narrow(0, label_count, target_count)?,
        )?;

        let mut loss = classification.clone();
        if let Some(adversarial) = &adversarial {
            loss = loss.add(&adversarial.affine(lambda, 0.0)?)?;
        }
        loss = loss.add(&structural.affine(lambda, 0.0)?)?;

        Ok(StepOutput {
            terms: LossTerms {
                classification: scalar(&classification)?,
                adversarial: adversarial.as_ref().map(scalar).transpose()?,
                structural: Some(scalar(&structural)?),
                lambda: Some(lambda),
            },
            loss,
            logits,
            labels: source.labels.clone(),
            label_count,
            target_count,
            concat_rows,
        })
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
