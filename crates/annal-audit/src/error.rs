//! Error types for the audit crate.

use annal_core::SchemaError;
use thiserror::Error;

/// Errors that can occur while registering types or recording revisions.
///
/// Every variant propagates to the host transaction boundary: a failure to
/// record history must also fail the corresponding primary write.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Registration failed; the entity type is not auditable.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Building or staging an audit row failed; the flush must abort.
    #[error("failed to write audit revision: {0}")]
    Write(#[from] WriteError),

    /// An entity's attribute history could not be resolved.
    #[error("failed to detect changes: {0}")]
    Detection(#[from] DetectionError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Errors raised by the Revision Writer at flush time.
#[derive(Debug, Error)]
pub enum WriteError {
    /// A business column of the audit table has no value in the captured map.
    #[error("no value for column {column} of audit table {table} (entity {entity})")]
    MissingValue {
        entity: String,
        table: String,
        column: String,
    },

    /// A change decision refers to an audit table the registry does not know.
    #[error("entity {entity} refers to an unknown audit table")]
    UnknownTable { entity: String },

    /// The host refused to stage an audit row.
    #[error("failed to stage row for audit table {table}: {source}")]
    Staging {
        table: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by the Change Detector.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The entity's type has no registered Audit Schema.
    #[error("entity type {entity_type} is not auditable")]
    Untracked { entity_type: String },

    /// A deferred or expired attribute could not be loaded.
    #[error("failed to load attribute {attribute} of {entity}: {source}")]
    Load {
        entity: String,
        attribute: String,
        #[source]
        source: anyhow::Error,
    },
}
