//! Error types for schema construction and audit registration.

use thiserror::Error;

/// Errors raised while building a Schema Model or deriving its Audit Schema.
///
/// All of these are fatal to registration: the entity type is not made
/// auditable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Root and joined-table schemas need at least one primary-key column.
    #[error("entity {entity} has no primary key")]
    MissingPrimaryKey { entity: String },

    /// The schema was sealed; its column list is frozen.
    #[error("entity {entity} is sealed; cannot add column {column}")]
    Sealed { entity: String, column: String },

    /// Two columns share a name on the same table level.
    #[error("entity {entity} declares column {column} twice")]
    DuplicateColumn { entity: String, column: String },

    /// A discriminator or relationship refers to a column that does not exist.
    #[error("entity {entity} references unknown column {column}")]
    UnknownColumn { entity: String, column: String },

    /// A business column collides with a reserved audit metadata column.
    #[error("column {column} on entity {entity} collides with a reserved audit column")]
    ReservedColumn { entity: String, column: String },

    /// Registration must run root-to-leaf across an inheritance hierarchy.
    #[error("entity {entity} inherits from {parent}, which has not been made auditable")]
    ParentNotRegistered { entity: String, parent: String },

    /// The entity type already has an Audit Schema.
    #[error("entity {entity} is already auditable")]
    AlreadyRegistered { entity: String },

    /// A joined-table subtype has no foreign key to its parent's table.
    #[error("entity {entity} has no foreign key to parent table {parent_table}")]
    MissingParentLink { entity: String, parent_table: String },

    /// Only the inheritance root may declare the polymorphic discriminator.
    #[error("entity {entity} declares a discriminator but is not an inheritance root")]
    DiscriminatorConflict { entity: String },

    /// Any other structural problem with the schema.
    #[error("malformed schema for entity {entity}: {reason}")]
    Malformed { entity: String, reason: String },
}
