//! Audit trail configuration.

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Configuration for audit schema derivation and revision writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Suffix appended to the source table name to name its audit table.
    #[serde(default = "default_table_suffix")]
    pub table_suffix: String,

    /// Suffix appended to the source type name to name its shadow type.
    #[serde(default = "default_shadow_suffix")]
    pub shadow_suffix: String,

    /// Prefix of the three reserved metadata columns.
    #[serde(default = "default_meta_prefix")]
    pub meta_prefix: String,

    /// How record ids are generated.
    #[serde(default)]
    pub record_id: RecordIdStrategy,

    /// When a revision is written.
    #[serde(default)]
    pub write_policy: WritePolicy,

    /// Which value is recorded for a changed attribute.
    #[serde(default)]
    pub capture: CaptureMode,

    /// What happens when an attribute's history cannot be resolved.
    #[serde(default)]
    pub on_detection_error: DetectionFailurePolicy,
}

/// Record id generation strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordIdStrategy {
    /// Random v4 UUIDs.
    #[default]
    Uuid,
    /// Monotonically increasing integers.
    Sequence,
}

/// Revision write policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Write only when a real change is detected.
    #[default]
    OnChange,
    /// Write on every save regardless of detected change (legacy mode).
    Always,
}

/// Which value the detector records for an attribute with history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// The value as of this flush; each row is a full post-change snapshot.
    #[default]
    Current,
    /// The value being superseded; each row records the prior version.
    Superseded,
}

/// Policy for entities whose attribute history cannot be resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectionFailurePolicy {
    /// Propagate the error and fail the flush.
    #[default]
    Abort,
    /// Log a warning and write no row for that entity.
    Skip,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            table_suffix: default_table_suffix(),
            shadow_suffix: default_shadow_suffix(),
            meta_prefix: default_meta_prefix(),
            record_id: RecordIdStrategy::default(),
            write_policy: WritePolicy::default(),
            capture: CaptureMode::default(),
            on_detection_error: DetectionFailurePolicy::default(),
        }
    }
}

impl AuditConfig {
    /// Parse audit configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check naming settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_suffix.is_empty() {
            return Err(ConfigError::Config(
                "table_suffix must not be empty".to_string(),
            ));
        }
        if self.shadow_suffix.is_empty() {
            return Err(ConfigError::Config(
                "shadow_suffix must not be empty".to_string(),
            ));
        }
        if self.meta_prefix.is_empty()
            || !self
                .meta_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Config(format!(
                "meta_prefix '{}' must be a non-empty identifier",
                self.meta_prefix
            )));
        }
        Ok(())
    }

    pub fn record_id_column(&self) -> String {
        format!("{}_rec_id", self.meta_prefix)
    }

    pub fn timestamp_column(&self) -> String {
        format!("{}_timestamp", self.meta_prefix)
    }

    pub fn is_delete_column(&self) -> String {
        format!("{}_isdelete", self.meta_prefix)
    }

    /// The metadata column names, in physical order.
    pub fn reserved_columns(&self) -> [String; 3] {
        [
            self.record_id_column(),
            self.timestamp_column(),
            self.is_delete_column(),
        ]
    }

    pub fn is_reserved(&self, column: &str) -> bool {
        self.reserved_columns().iter().any(|c| c == column)
    }

    pub fn audit_table_name(&self, source_table: &str) -> String {
        format!("{}{}", source_table, self.table_suffix)
    }

    pub fn shadow_type_name(&self, source_type: &str) -> String {
        format!("{}{}", source_type, self.shadow_suffix)
    }
}

fn default_table_suffix() -> String {
    "_audit".to_string()
}

fn default_shadow_suffix() -> String {
    "Audit".to_string()
}

fn default_meta_prefix() -> String {
    "audit".to_string()
}
