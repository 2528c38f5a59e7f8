//! Configuration types for Annal.
//!
//! Configuration is loaded from a YAML file (for example `annal.yaml`) whose
//! top-level keys are the [`AuditConfig`] fields. Every field has a default,
//! so an empty document yields the default configuration.

pub mod audit;

use std::fs;
use std::path::Path;

pub use audit::{AuditConfig, CaptureMode, DetectionFailurePolicy, RecordIdStrategy, WritePolicy};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }
}
