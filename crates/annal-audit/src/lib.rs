//! # annal-audit
//!
//! Revision history for ORM-managed entities.
//!
//! This crate provides:
//! - The Audit Schema Builder: [`AuditRegistry::make_auditable`] derives a
//!   shadow table and shadow type for each registered entity type
//! - The Change Interceptor, installed on a host session with
//!   [`install_audit_hooks`]
//! - The Change Detector, which classifies attribute history and decides
//!   whether a save event is a real change
//! - The Revision Writer, which stages one audit row per inheritance level,
//!   all sharing one record id, into the host's transaction
//! - [`memory`]: an in-memory host runtime
//!
//! ## Audit Table Layout
//!
//! | Columns | Notes |
//! |---------|-------|
//! | business columns | copied from the source table, nullable, no defaults |
//! | `audit_rec_id` | primary key, shared across inheritance levels |
//! | `audit_timestamp` | float seconds since the Unix epoch |
//! | `audit_isdelete` | `true` for deletion rows, default `false` |
//!
//! ## Example Usage
//!
//! ```rust
//! use annal_audit::memory::{MemorySession, MemoryStore};
//! use annal_audit::{AuditRegistry, install_audit_hooks};
//! use annal_core::{AuditConfig, Column, ColumnType, EntitySchema, Value};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut reservation = EntitySchema::new("Reservation", "reservations");
//! reservation.add_column(Column::new("id", ColumnType::Integer).primary_key())?;
//! reservation.add_column(Column::new("party", ColumnType::Integer))?;
//!
//! let mut registry = AuditRegistry::new(AuditConfig::default())?;
//! registry.make_auditable(reservation.seal()?)?;
//! let registry = Arc::new(registry);
//!
//! let store = MemoryStore::new();
//! let mut session = MemorySession::new(store.clone());
//! install_audit_hooks(&mut session, registry);
//!
//! session.add("Reservation", "r:1", [("id", Value::Int(1)), ("party", Value::Int(2))])?;
//! session.commit()?;
//!
//! assert_eq!(store.audit_rows_in("reservations_audit").len(), 1);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod audit_schema;
pub mod detector;
pub mod error;
pub mod interceptor;
pub mod memory;
pub mod registry;
pub mod row;
pub mod session;
pub mod writer;

pub use audit_schema::{
    AuditColumn, AuditColumnKind, AuditForeignKey, AuditSchema, AuditTable, AuditTableId,
    ShadowType,
};
pub use detector::{AttributeHistory, ChangeDecision, ChangeDetector, LevelValues};
pub use error::{AuditError, DetectionError, WriteError};
pub use interceptor::{
    ChangeInterceptor, FlushReport, LISTENER_NAME, install_audit_hooks, install_interceptor,
};
pub use registry::AuditRegistry;
pub use row::{AuditRow, RecordId, ValueMap};
pub use session::{
    AttributeSnapshot, ChangeSet, EntityKey, EntityState, FlushListener, HookSession,
    RelationshipSnapshot, UnitOfWork,
};
pub use writer::{Clock, RecordIdGenerator, RevisionWriter, SystemClock};
