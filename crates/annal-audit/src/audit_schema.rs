//! Audit Schema Builder.
//!
//! Derives a shadow table and shadow type from a sealed [`EntitySchema`]:
//! - business columns are copied without uniqueness or defaults and forced
//!   nullable (a deletion row carries nulls for every business column)
//! - foreign keys to the parent's live table are retargeted to the parent's
//!   audit table; other foreign keys are dropped
//! - record id, timestamp and is-delete metadata columns are appended
//! - joined subtypes get a composite foreign key keyed on record id to the
//!   parent's audit table
//! - single-table subtypes add their columns to the parent's audit table

use annal_core::{
    AuditConfig, Column, ColumnType, EntitySchema, ForeignKeyRef, InheritanceKind, SchemaError,
};
use serde::{Deserialize, Serialize};

/// Index of an audit table inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuditTableId(pub(crate) usize);

/// What an audit column holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditColumnKind {
    /// Copy of a source column.
    Business {
        /// Entity type that declares the source column.
        source_entity: String,
        /// Attribute that carries the source value.
        attribute: String,
        /// Whether the source column is part of the source primary key.
        source_primary_key: bool,
    },
    RecordId,
    Timestamp,
    IsDelete,
}

/// A column of an audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Retargeted foreign key (parent audit table), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
    /// Whether this column is the polymorphic discriminator.
    #[serde(default)]
    pub discriminator: bool,
    pub kind: AuditColumnKind,
}

impl AuditColumn {
    pub fn is_business(&self) -> bool {
        matches!(self.kind, AuditColumnKind::Business { .. })
    }

    /// Whether the copied source column was part of the primary key.
    pub fn is_source_key(&self) -> bool {
        matches!(
            self.kind,
            AuditColumnKind::Business {
                source_primary_key: true,
                ..
            }
        )
    }

    /// Entity type that declares the source column.
    pub fn source_entity(&self) -> Option<&str> {
        match &self.kind {
            AuditColumnKind::Business { source_entity, .. } => Some(source_entity),
            _ => None,
        }
    }

    /// Attribute that carries the source value.
    pub fn attribute(&self) -> Option<&str> {
        match &self.kind {
            AuditColumnKind::Business { attribute, .. } => Some(attribute),
            _ => None,
        }
    }
}

/// Table-level foreign key from a joined subtype's audit table to its
/// parent's audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditForeignKey {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

/// A derived audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTable {
    pub id: AuditTableId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_schema: Option<String>,
    pub source_table: String,
    business: Vec<AuditColumn>,
    meta: Vec<AuditColumn>,
    /// Parent audit table (joined inheritance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<AuditTableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<AuditForeignKey>,
    /// Column sets referenced by child audit tables; each needs a unique key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_keys: Vec<Vec<String>>,
}

impl AuditTable {
    /// All columns in physical order: business columns, then record id,
    /// timestamp and is-delete.
    pub fn columns(&self) -> impl Iterator<Item = &AuditColumn> {
        self.business.iter().chain(self.meta.iter())
    }

    pub fn business_columns(&self) -> &[AuditColumn] {
        &self.business
    }

    pub fn meta_columns(&self) -> &[AuditColumn] {
        &self.meta
    }

    pub fn column(&self, name: &str) -> Option<&AuditColumn> {
        self.columns().find(|c| c.name == name)
    }

    pub fn record_id_column(&self) -> Option<&AuditColumn> {
        self.meta
            .iter()
            .find(|c| c.kind == AuditColumnKind::RecordId)
    }

    pub fn discriminator(&self) -> Option<&AuditColumn> {
        self.business.iter().find(|c| c.discriminator)
    }

    pub(crate) fn append_business(&mut self, column: AuditColumn) {
        self.business.push(column);
    }
}

/// Statically declared descriptor of a shadow entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowType {
    pub name: String,
    pub source_type: String,
    pub table: AuditTableId,
    /// Shadow type of the source's parent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polymorphic_identity: Option<String>,
}

/// The Audit Schema associated with one source entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSchema {
    pub source_type: String,
    /// The audit table holding this type's own columns.
    pub table: AuditTableId,
    pub shadow: ShadowType,
    /// Audit tables of the inheritance chain, root to leaf, one per physical
    /// level (single-table levels share their root's table).
    pub levels: Vec<AuditTableId>,
}

/// Copy a source column for an audit table.
pub(crate) fn audit_copy(source: &EntitySchema, column: &Column) -> AuditColumn {
    AuditColumn {
        name: column.name.clone(),
        column_type: column.column_type.clone(),
        nullable: true,
        primary_key: false,
        default: None,
        foreign_key: None,
        discriminator: false,
        kind: AuditColumnKind::Business {
            source_entity: source.entity_type().to_string(),
            attribute: column.attribute_name().to_string(),
            source_primary_key: column.primary_key,
        },
    }
}

fn meta_columns(config: &AuditConfig) -> Vec<AuditColumn> {
    let record_id_type = match config.record_id {
        annal_core::RecordIdStrategy::Uuid => ColumnType::Uuid,
        annal_core::RecordIdStrategy::Sequence => ColumnType::BigInt,
    };
    vec![
        AuditColumn {
            name: config.record_id_column(),
            column_type: record_id_type,
            nullable: false,
            primary_key: true,
            default: None,
            foreign_key: None,
            discriminator: false,
            kind: AuditColumnKind::RecordId,
        },
        AuditColumn {
            name: config.timestamp_column(),
            column_type: ColumnType::Float,
            nullable: false,
            primary_key: false,
            default: None,
            foreign_key: None,
            discriminator: false,
            kind: AuditColumnKind::Timestamp,
        },
        AuditColumn {
            name: config.is_delete_column(),
            column_type: ColumnType::Boolean,
            nullable: false,
            primary_key: false,
            default: Some("false".to_string()),
            foreign_key: None,
            discriminator: false,
            kind: AuditColumnKind::IsDelete,
        },
    ]
}

/// Reject business columns that collide with the reserved metadata names.
pub(crate) fn check_reserved(config: &AuditConfig, source: &EntitySchema) -> Result<(), SchemaError> {
    match source.columns().iter().find(|c| config.is_reserved(&c.name)) {
        Some(column) => Err(SchemaError::ReservedColumn {
            entity: source.entity_type().to_string(),
            column: column.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Derive a new audit table for a root or joined-table source schema.
///
/// `parent` is the parent's audit table for joined inheritance.
pub(crate) fn derive_table(
    config: &AuditConfig,
    id: AuditTableId,
    source: &EntitySchema,
    parent: Option<&AuditTable>,
) -> Result<AuditTable, SchemaError> {
    let entity = source.entity_type().to_string();
    let discriminator = source.discriminator().map(|c| c.name.clone());
    let is_root = source.parent().is_none();

    let mut business = Vec::with_capacity(source.columns().len());
    let mut parent_pairs: Vec<(String, String)> = Vec::new();

    for column in source.columns() {
        let mut copy = audit_copy(source, column);

        if let (Some(parent_table), Some(parent_schema)) = (parent, source.parent()) {
            for fk in column
                .foreign_keys
                .iter()
                .filter(|fk| fk.table == parent_schema.table())
            {
                if parent_table.column(&fk.column).is_none() {
                    return Err(SchemaError::Malformed {
                        entity: entity.clone(),
                        reason: format!(
                            "column {} references {}.{}, which is not audited",
                            column.name, fk.table, fk.column
                        ),
                    });
                }
                copy.foreign_key = Some(ForeignKeyRef::new(&parent_table.name, &fk.column));
                parent_pairs.push((column.name.clone(), fk.column.clone()));
            }
        }

        if is_root && discriminator.as_deref() == Some(column.name.as_str()) {
            copy.discriminator = true;
        }

        business.push(copy);
    }

    let meta = meta_columns(config);
    let parent_key = parent.map(|parent_table| {
        let record_id = config.record_id_column();
        parent_pairs.push((record_id.clone(), record_id));
        let (columns, ref_columns): (Vec<String>, Vec<String>) =
            parent_pairs.into_iter().unzip();
        AuditForeignKey {
            columns,
            ref_table: parent_table.name.clone(),
            ref_columns,
        }
    });

    Ok(AuditTable {
        id,
        name: config.audit_table_name(source.table()),
        db_schema: source.db_schema().map(str::to_string),
        source_table: source.table().to_string(),
        business,
        meta,
        parent: parent.map(|p| p.id),
        parent_key,
        referenced_keys: Vec::new(),
    })
}

/// Append a single-table subtype's columns to its root's audit table.
///
/// Returns the names of the appended columns.
pub(crate) fn append_single_columns(
    table: &mut AuditTable,
    source: &EntitySchema,
) -> Vec<String> {
    debug_assert_eq!(source.link_kind(), Some(InheritanceKind::Single));

    let mut appended = Vec::new();
    for column in source.columns() {
        if table.column(&column.name).is_none() {
            table.append_business(audit_copy(source, column));
            appended.push(column.name.clone());
        }
    }
    appended
}

#[cfg(test)]
mod tests {
    use super::*;
    use annal_core::{Column, EntitySchema};
    use pretty_assertions::assert_eq;

    fn reservation() -> std::sync::Arc<EntitySchema> {
        let mut s = EntitySchema::new("Reservation", "reservations");
        s.add_column(Column::new("id", ColumnType::Integer).primary_key())
            .unwrap();
        s.add_column(Column::new("name", ColumnType::Text).not_null().unique())
            .unwrap();
        s.add_column(Column::new("party", ColumnType::Integer).default_expr("2"))
            .unwrap();
        s.add_column(Column::new("owner_id", ColumnType::Integer).references("users", "id"))
            .unwrap();
        s.seal().unwrap()
    }

    #[test]
    fn test_physical_column_order() {
        let config = AuditConfig::default();
        let table = derive_table(&config, AuditTableId(0), &reservation(), None).unwrap();

        let names: Vec<&str> = table.columns().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "id",
                "name",
                "party",
                "owner_id",
                "audit_rec_id",
                "audit_timestamp",
                "audit_isdelete"
            ]
        );
        assert_eq!(table.name, "reservations_audit");
    }

    #[test]
    fn test_business_columns_never_more_restrictive() {
        let config = AuditConfig::default();
        let table = derive_table(&config, AuditTableId(0), &reservation(), None).unwrap();

        for column in table.business_columns() {
            assert!(column.nullable, "{} must be nullable", column.name);
            assert!(column.default.is_none(), "{} must have no default", column.name);
            assert!(!column.primary_key);
            assert!(column.foreign_key.is_none());
        }
        assert!(table.column("id").unwrap().is_source_key());
    }

    #[test]
    fn test_metadata_columns() {
        let config = AuditConfig::default();
        let table = derive_table(&config, AuditTableId(0), &reservation(), None).unwrap();

        let rec_id = table.record_id_column().unwrap();
        assert!(rec_id.primary_key);
        assert_eq!(rec_id.column_type, ColumnType::Uuid);

        let is_delete = table.column("audit_isdelete").unwrap();
        assert_eq!(is_delete.default.as_deref(), Some("false"));
        assert_eq!(table.column("audit_timestamp").unwrap().column_type, ColumnType::Float);
    }

    #[test]
    fn test_reserved_column_rejected() {
        let mut s = EntitySchema::new("Clash", "clash");
        s.add_column(Column::new("id", ColumnType::Integer).primary_key())
            .unwrap();
        s.add_column(Column::new("audit_timestamp", ColumnType::Float))
            .unwrap();
        let s = s.seal().unwrap();

        let err = check_reserved(&AuditConfig::default(), &s).unwrap_err();
        assert_eq!(
            err,
            SchemaError::ReservedColumn {
                entity: "Clash".to_string(),
                column: "audit_timestamp".to_string()
            }
        );
    }
}
