//! Configuration parsing and validation.
//!
//! Enumerated choices (optimizer, learning-rate schedule, trade-off policy)
//! are kept as plain names in the YAML file and resolved once, at setup, into
//! closed enums. An unknown name is a [`AdaptError::Config`] raised by
//! [`AdaptConfig::validate`] before any epoch runs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, Result};
use crate::loss::TradeOff;
use crate::model::{AdaptationMode, FeatureHead};
use crate::optimizer::OptimizerKind;
use crate::scheduler::LrSchedule;

/// Main configuration for a domain adaptation run.
///
/// # Example
///
/// ```rust
/// use domain_adapt_rs::AdaptConfig;
///
/// # fn main() -> domain_adapt_rs::Result<()> {
/// let config = AdaptConfig::from_preset("cwru")?;
/// config.validate()?;
/// assert_eq!(config.training.middle_epoch, 50);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptConfig {
    /// Source/target data location and preprocessing.
    pub data: DataConfig,

    /// Model composition.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Directory under which run directories are created.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Prefix of the run directory name.
    #[serde(default = "default_run_name")]
    pub run_name: String,

    /// Random seed for splits, shuffling and initialisation order.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./checkpoint".into()
}

fn default_run_name() -> String {
    "mlp".into()
}

fn default_seed() -> u64 {
    42
}

/// Per-sample normalisation applied by the dataset provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeType {
    /// Rescale every sample to `[0, 1]`.
    #[serde(rename = "0-1")]
    ZeroOne,
    /// Rescale every sample to `[-1, 1]`.
    #[serde(rename = "1-1")]
    NegOneOne,
    /// Zero mean, unit variance per sample.
    #[default]
    #[serde(rename = "mean-std")]
    MeanStd,
}

/// Dataset configuration: the transfer task and where to find it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory containing one safetensors file per domain.
    pub data_dir: String,

    /// Source domain identifier (file stem inside `data_dir`).
    pub source: String,

    /// Target domain identifier (file stem inside `data_dir`).
    pub target: String,

    /// Normalisation mode.
    #[serde(default)]
    pub normalize: NormalizeType,

    /// Fraction of each domain held out for validation.
    #[serde(default = "default_val_split")]
    pub val_split: f32,

    /// Number of classes; inferred from the labels when absent.
    #[serde(default)]
    pub num_classes: Option<usize>,
}

fn default_val_split() -> f32 {
    0.2
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            source: String::new(),
            target: String::new(),
            normalize: NormalizeType::default(),
            val_split: default_val_split(),
            num_classes: None,
        }
    }
}

/// Model composition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden widths of the reference MLP feature extractor.
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,

    /// Optional safetensors file with pretrained feature-extractor weights.
    #[serde(default)]
    pub pretrained: Option<String>,

    /// Insert a bottleneck between the feature extractor and the classifier.
    #[serde(default = "default_true")]
    pub bottleneck: bool,

    /// Bottleneck width.
    #[serde(default = "default_bottleneck_num")]
    pub bottleneck_num: usize,

    /// Attach a domain discriminator.
    #[serde(default = "default_true")]
    pub domain_adversarial: bool,

    /// Discriminator hidden width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

fn default_hidden_dims() -> Vec<usize> {
    vec![512, 256]
}
fn default_true() -> bool {
    true
}
fn default_bottleneck_num() -> usize {
    256
}
fn default_hidden_size() -> usize {
    1024
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: default_hidden_dims(),
            pretrained: None,
            bottleneck: true,
            bottleneck_num: default_bottleneck_num(),
            domain_adversarial: true,
            hidden_size: default_hidden_size(),
        }
    }
}

impl ModelConfig {
    /// Resolve the bottleneck flags into a [`FeatureHead`].
    #[must_use]
    pub fn feature_head(&self) -> FeatureHead {
        if self.bottleneck {
            FeatureHead::WithBottleneck(self.bottleneck_num)
        } else {
            FeatureHead::Plain
        }
    }

    /// Resolve the discriminator flags into an [`AdaptationMode`].
    #[must_use]
    pub fn adaptation_mode(&self) -> AdaptationMode {
        if self.domain_adversarial {
            AdaptationMode::Adversarial(self.hidden_size)
        } else {
            AdaptationMode::ClassifierOnly
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Batch size per step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of devices the batch is spread over.
    #[serde(default = "default_devices")]
    pub devices: usize,

    /// Prefetch workers per data stream (0 loads batches inline).
    #[serde(default)]
    pub num_workers: usize,

    /// Drop the last incomplete batch of the training streams.
    #[serde(default = "default_true")]
    pub drop_last: bool,

    /// Optimizer name: `sgd` or `adam`.
    #[serde(default = "default_opt")]
    pub opt: String,

    /// Base learning rate of every parameter group.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Schedule name: `step`, `exp`, `stepLR`, `fix` or `transferLearning`.
    #[serde(default = "default_lr_scheduler")]
    pub lr_scheduler: String,

    /// Milestones for `step` (comma separated) or the period for `stepLR`.
    #[serde(default = "default_steps")]
    pub steps: String,

    /// Decay factor for `step`, `exp` and `stepLR`.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// First epoch of the adversarial phase.
    #[serde(default = "default_middle_epoch")]
    pub middle_epoch: usize,

    /// Number of epochs.
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,

    /// Trade-off policy name: `Cons` or `Step`.
    #[serde(default = "default_trade_off")]
    pub trade_off_adversarial: String,

    /// Constant adversarial weight used by `Cons`.
    #[serde(default = "default_lam_adversarial")]
    pub lam_adversarial: f64,

    /// Log training statistics every N steps.
    #[serde(default = "default_print_step")]
    pub print_step: usize,

    /// Number of periodic checkpoints to keep.
    #[serde(default = "default_max_model_num")]
    pub max_model_num: usize,
}

fn default_batch_size() -> usize {
    64
}
fn default_devices() -> usize {
    1
}
fn default_opt() -> String {
    "adam".into()
}
fn default_lr() -> f64 {
    1e-3
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    1e-5
}
fn default_lr_scheduler() -> String {
    "step".into()
}
fn default_steps() -> String {
    "150, 250".into()
}
fn default_gamma() -> f64 {
    0.1
}
fn default_middle_epoch() -> usize {
    50
}
fn default_max_epoch() -> usize {
    300
}
fn default_trade_off() -> String {
    "Step".into()
}
fn default_lam_adversarial() -> f64 {
    1.0
}
fn default_print_step() -> usize {
    50
}
fn default_max_model_num() -> usize {
    1
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            devices: default_devices(),
            num_workers: 0,
            drop_last: true,
            opt: default_opt(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            lr_scheduler: default_lr_scheduler(),
            steps: default_steps(),
            gamma: default_gamma(),
            middle_epoch: default_middle_epoch(),
            max_epoch: default_max_epoch(),
            trade_off_adversarial: default_trade_off(),
            lam_adversarial: default_lam_adversarial(),
            print_step: default_print_step(),
            max_model_num: default_max_model_num(),
        }
    }
}

impl TrainingConfig {
    /// Check that the batch can be split evenly across devices.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::DeviceMismatch`] when `devices > 1` and the batch
    /// size is not a multiple of it.
    pub fn check_devices(&self) -> Result<()> {
        if self.devices > 1 && self.batch_size % self.devices != 0 {
            return Err(AdaptError::DeviceMismatch {
                batch_size: self.batch_size,
                devices: self.devices,
            });
        }
        Ok(())
    }
}

impl AdaptConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"cwru"` - bearing-fault transfer between two load conditions
    /// - `"smoke"` - a tiny run for checking an installation
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "cwru" => Ok(Self::cwru_preset()),
            "smoke" => Ok(Self::smoke_preset()),
            _ => Err(AdaptError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Bearing-fault transfer task with the full 300-epoch schedule.
    #[must_use]
    pub fn cwru_preset() -> Self {
        Self {
            data: DataConfig {
                data_dir: "./data/cwru".into(),
                source: "load0".into(),
                target: "load3".into(),
                ..Default::default()
            },
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            output_dir: default_output_dir(),
            run_name: default_run_name(),
            seed: default_seed(),
        }
    }

    /// Short run with small widths and a two-epoch warm-up.
    #[must_use]
    pub fn smoke_preset() -> Self {
        Self {
            data: DataConfig {
                data_dir: "./data/smoke".into(),
                source: "source".into(),
                target: "target".into(),
                ..Default::default()
            },
            model: ModelConfig {
                hidden_dims: vec![32],
                bottleneck_num: 16,
                hidden_size: 32,
                ..Default::default()
            },
            training: TrainingConfig {
                batch_size: 16,
                opt: "sgd".into(),
                lr: 1e-2,
                lr_scheduler: "fix".into(),
                middle_epoch: 2,
                max_epoch: 5,
                print_step: 10,
                max_model_num: 2,
                ..Default::default()
            },
            output_dir: default_output_dir(),
            run_name: "smoke".into(),
            seed: default_seed(),
        }
    }

    /// Validate the configuration.
    ///
    /// Every enumerated name is resolved here so that a typo fails before
    /// any data is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] or [`AdaptError::DeviceMismatch`].
    pub fn validate(&self) -> Result<()> {
        if self.data.data_dir.is_empty() {
            return Err(AdaptError::Config("data.data_dir is required".into()));
        }
        if self.data.source.is_empty() || self.data.target.is_empty() {
            return Err(AdaptError::Config(
                "data.source and data.target are required".into(),
            ));
        }
        if !(self.data.val_split > 0.0 && self.data.val_split < 1.0) {
            return Err(AdaptError::Config(format!(
                "data.val_split must be in (0, 1), got {}",
                self.data.val_split
            )));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(AdaptError::Config("training.batch_size must be > 0".into()));
        }
        if training.devices == 0 {
            return Err(AdaptError::Config("training.devices must be > 0".into()));
        }
        if training.max_epoch == 0 {
            return Err(AdaptError::Config("training.max_epoch must be > 0".into()));
        }
        if training.middle_epoch > training.max_epoch {
            return Err(AdaptError::Config(format!(
                "training.middle_epoch ({}) exceeds training.max_epoch ({})",
                training.middle_epoch, training.max_epoch
            )));
        }
        if training.print_step == 0 {
            return Err(AdaptError::Config("training.print_step must be > 0".into()));
        }
        if training.max_model_num == 0 {
            return Err(AdaptError::Config(
                "training.max_model_num must be > 0".into(),
            ));
        }
        if self.model.bottleneck && self.model.bottleneck_num == 0 {
            return Err(AdaptError::Config("model.bottleneck_num must be > 0".into()));
        }
        if self.model.domain_adversarial && self.model.hidden_size == 0 {
            return Err(AdaptError::Config("model.hidden_size must be > 0".into()));
        }

        OptimizerKind::from_training_config(training)?;
        LrSchedule::from_training_config(training)?;
        TradeOff::from_training_config(training)?;
        training.check_devices()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_serialization() {
        let config = AdaptConfig::cwru_preset();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: AdaptConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.data.source, restored.data.source);
        assert_eq!(config.training.max_epoch, restored.training.max_epoch);
        assert_eq!(restored.data.normalize, NormalizeType::MeanStd);
    }

    #[test]
    fn test_presets() {
        assert!(AdaptConfig::from_preset("cwru").is_ok());
        assert!(AdaptConfig::from_preset("smoke").is_ok());
        assert!(matches!(
            AdaptConfig::from_preset("invalid"),
            Err(AdaptError::Config(_))
        ));
    }

    #[test]
    fn test_presets_validate() {
        assert!(AdaptConfig::cwru_preset().validate().is_ok());
        assert!(AdaptConfig::smoke_preset().validate().is_ok());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
data:
  data_dir: ./data
  source: a
  target: b
"#;
        let config: AdaptConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.training.opt, "adam");
        assert_eq!(config.training.steps, "150, 250");
        assert_eq!(config.model.bottleneck_num, 256);
        assert!(config.model.domain_adversarial);
        assert_eq!(config.output_dir, "./checkpoint");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_names() {
        let yaml = r#"
data_dir: ./d
source: a
target: b
normalize: "1-1"
"#;
        let data: DataConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(data.normalize, NormalizeType::NegOneOne);
    }

    #[test]
    fn test_unknown_optimizer_fails_fast() {
        let mut config = AdaptConfig::smoke_preset();
        config.training.opt = "rmsprop".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AdaptError::Config(_)));
        assert!(err.to_string().contains("rmsprop"));
    }

    #[test]
    fn test_unknown_scheduler_fails_fast() {
        let mut config = AdaptConfig::smoke_preset();
        config.training.lr_scheduler = "cosine".into();
        assert!(matches!(config.validate(), Err(AdaptError::Config(_))));
    }

    #[test]
    fn test_unknown_trade_off_fails_fast() {
        let mut config = AdaptConfig::smoke_preset();
        config.training.trade_off_adversarial = "Linear".into();
        assert!(matches!(config.validate(), Err(AdaptError::Config(_))));
    }

    #[test]
    fn test_device_mismatch() {
        let mut config = AdaptConfig::smoke_preset();
        config.training.batch_size = 30;
        config.training.devices = 4;
        assert!(matches!(
            config.validate(),
            Err(AdaptError::DeviceMismatch {
                batch_size: 30,
                devices: 4
            })
        ));

        config.training.batch_size = 32;
        assert!(config.validate().is_ok());

        // A single device never mismatches.
        config.training.batch_size = 31;
        config.training.devices = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_middle_epoch_bounds() {
        let mut config = AdaptConfig::smoke_preset();
        config.training.middle_epoch = config.training.max_epoch + 1;
        assert!(config.validate().is_err());

        config.training.middle_epoch = config.training.max_epoch;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_required_fields() {
        let mut config = AdaptConfig::smoke_preset();
        config.data.data_dir.clear();
        assert!(config.validate().is_err());

        let mut config = AdaptConfig::smoke_preset();
        config.data.target.clear();
        assert!(config.validate().is_err());

        let mut config = AdaptConfig::smoke_preset();
        config.training.max_model_num = 0;
        assert!(config.validate().is_err());

        let mut config = AdaptConfig::smoke_preset();
        config.data.val_split = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_variants() {
        let mut model = ModelConfig::default();
        assert_eq!(model.feature_head(), FeatureHead::WithBottleneck(256));
        assert_eq!(model.adaptation_mode(), AdaptationMode::Adversarial(1024));

        model.bottleneck = false;
        model.domain_adversarial = false;
        assert_eq!(model.feature_head(), FeatureHead::Plain);
        assert_eq!(model.adaptation_mode(), AdaptationMode::ClassifierOnly);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let config = AdaptConfig::smoke_preset();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(serde_yaml::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = AdaptConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.run_name, "smoke");
        assert_eq!(loaded.training.lr_scheduler, "fix");
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            AdaptConfig::from_file("/nonexistent/config.yaml"),
            Err(AdaptError::Io(_))
        ));
    }
}
