//! # annal-core
//!
//! Shared building blocks for Annal audit trails.
//!
//! This crate provides:
//! - [`Value`] and [`ColumnType`]: the cell values and semantic column types
//!   that flow between the host persistence layer and the audit engine
//! - The Schema Model ([`EntitySchema`], [`Column`], [`InheritanceLink`]):
//!   a sealed, introspectable description of one entity's physical layout
//! - [`AuditConfig`]: naming conventions and write policies, loadable from YAML
//!
//! ## Example
//!
//! ```rust
//! use annal_core::{Column, ColumnType, EntitySchema};
//!
//! # fn example() -> Result<(), annal_core::SchemaError> {
//! let mut reservation = EntitySchema::new("Reservation", "reservations");
//! reservation.add_column(Column::new("id", ColumnType::Integer).primary_key())?;
//! reservation.add_column(Column::new("name", ColumnType::Text))?;
//! reservation.add_column(Column::new("party", ColumnType::Integer))?;
//! let reservation = reservation.seal()?;
//!
//! assert_eq!(reservation.primary_key().len(), 1);
//! # Ok(())
//! # }
//! ```

// Configuration types shared across all Annal crates
pub mod config;
pub mod error;
pub mod schema;
pub mod value;

pub use config::{
    AuditConfig, CaptureMode, ConfigError, DetectionFailurePolicy, RecordIdStrategy, WritePolicy,
};
pub use error::SchemaError;
pub use schema::{
    Column, EntitySchema, ForeignKeyRef, InheritanceKind, InheritanceLink, Relationship,
};
pub use value::{ColumnType, Value};
