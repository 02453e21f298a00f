//! Error types for domain-adapt-rs.
//!
//! Configuration problems (unknown optimizer, scheduler, trade-off policy or
//! resume-file kind) and device mismatches are raised during setup, before
//! any training step runs. Everything that goes wrong later propagates to the
//! caller and ends the run; the last written checkpoint is the recovery point.
//!
//! # Example
//!
//! ```rust
//! use domain_adapt_rs::{AdaptConfig, AdaptError};
//!
//! # fn main() {
//! match AdaptConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(AdaptError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for domain-adapt-rs operations.
pub type Result<T> = std::result::Result<T, AdaptError>;

/// Errors that can occur in domain-adapt-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdaptError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Batch size cannot be spread evenly over the requested devices.
    #[error("batch size {batch_size} is not divisible by device count {devices}")]
    DeviceMismatch {
        /// Requested per-step batch size.
        batch_size: usize,
        /// Number of devices.
        devices: usize,
    },

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model construction or weight loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for AdaptError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        AdaptError::Template(err.to_string())
    }
}

impl AdaptError {
    /// Whether this error belongs to the fail-fast setup class.
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AdaptError::Config(_) | AdaptError::ConfigParse(_) | AdaptError::DeviceMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = AdaptError::Config("unknown optimizer 'rmsprop'".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: unknown optimizer 'rmsprop'"
        );
        assert!(error.is_setup_error());
    }

    #[test]
    fn test_device_mismatch_message() {
        let error = AdaptError::DeviceMismatch {
            batch_size: 30,
            devices: 4,
        };
        assert_eq!(
            error.to_string(),
            "batch size 30 is not divisible by device count 4"
        );
        assert!(error.is_setup_error());
    }

    #[test]
    fn test_runtime_errors_are_not_setup_errors() {
        assert!(!AdaptError::Training("nan loss".into()).is_setup_error());
        assert!(!AdaptError::Checkpoint("disk full".into()).is_setup_error());
        assert!(!AdaptError::Dataset("empty stream".into()).is_setup_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: AdaptError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: AdaptError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
        assert!(error.is_setup_error());
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: AdaptError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: AdaptError = io::Error::new(io::ErrorKind::NotFound, "x.ckpt").into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(template_error) = ProgressStyle::default_bar().template("{wide_bar:.}") {
            let error: AdaptError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }
}
