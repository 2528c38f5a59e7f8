//! Schema Model: the physical layout of one entity type.
//!
//! An [`EntitySchema`] is built by adding columns and then sealed with
//! [`EntitySchema::seal`], which validates it and hands back a shared,
//! read-only `Arc<EntitySchema>`. Subtypes refer to their parent's sealed
//! schema through an [`InheritanceLink`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SchemaError;
use crate::value::ColumnType;

/// Target of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    /// Referenced table name.
    pub table: String,
    /// Referenced column name.
    pub column: String,
}

impl ForeignKeyRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// A column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Physical column name.
    pub name: String,

    /// Attribute that maps to this column, when it differs from the column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Semantic type.
    pub column_type: ColumnType,

    /// Whether the column accepts NULL.
    pub nullable: bool,

    /// Whether the column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,

    /// Foreign-key targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyRef>,

    /// Default or server-default expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Whether the column carries a uniqueness constraint.
    #[serde(default)]
    pub unique: bool,
}

impl Column {
    /// Create a nullable column with no constraints.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            attribute: None,
            column_type,
            nullable: true,
            primary_key: false,
            foreign_keys: Vec::new(),
            default: None,
            unique: false,
        }
    }

    /// Mark as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKeyRef::new(table, column));
        self
    }

    /// Map this column through an attribute with a different name.
    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Name of the attribute that carries this column's value.
    pub fn attribute_name(&self) -> &str {
        self.attribute.as_deref().unwrap_or(&self.name)
    }

    /// Whether any foreign key on this column targets `table`.
    pub fn references_table(&self, table: &str) -> bool {
        self.foreign_keys.iter().any(|fk| fk.table == table)
    }
}

/// How a subtype relates to its parent's physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceKind {
    /// The subtype has its own table whose key references the parent's key.
    Joined,
    /// The subtype shares the parent's table.
    Single,
}

impl std::fmt::Display for InheritanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joined => write!(f, "joined"),
            Self::Single => write!(f, "single"),
        }
    }
}

/// Link from a subtype to its parent schema.
#[derive(Debug, Clone)]
pub struct InheritanceLink {
    pub parent: Arc<EntitySchema>,
    pub kind: InheritanceKind,
}

/// A relationship attribute that is not mapped to a column itself.
///
/// `local_columns` lists the foreign-key columns on this entity's own table
/// that back the relationship; it is empty for the non-owning side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub local_columns: Vec<String>,
}

impl Relationship {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            local_columns: Vec::new(),
        }
    }

    pub fn via(mut self, column: impl Into<String>) -> Self {
        self.local_columns.push(column.into());
        self
    }
}

/// Physical layout of one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity_type: String,
    table: String,
    db_schema: Option<String>,
    columns: Vec<Column>,
    relationships: Vec<Relationship>,
    inherits: Option<InheritanceLink>,
    polymorphic_on: Option<String>,
    polymorphic_identity: Option<String>,
    sealed: bool,
}

impl EntitySchema {
    /// Create a root entity schema mapped to `table`.
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            db_schema: None,
            columns: Vec::new(),
            relationships: Vec::new(),
            inherits: None,
            polymorphic_on: None,
            polymorphic_identity: None,
            sealed: false,
        }
    }

    /// Create a joined-table subtype of `parent` with its own `table`.
    pub fn joined(
        entity_type: impl Into<String>,
        table: impl Into<String>,
        parent: Arc<EntitySchema>,
    ) -> Self {
        let mut schema = Self::new(entity_type, table);
        schema.db_schema = parent.db_schema.clone();
        schema.inherits = Some(InheritanceLink {
            parent,
            kind: InheritanceKind::Joined,
        });
        schema
    }

    /// Create a single-table subtype of `parent`, sharing its table.
    ///
    /// Columns added to a single-table subtype live on the parent's table.
    pub fn single(entity_type: impl Into<String>, parent: Arc<EntitySchema>) -> Self {
        let mut schema = Self::new(entity_type, parent.table.clone());
        schema.db_schema = parent.db_schema.clone();
        schema.inherits = Some(InheritanceLink {
            parent,
            kind: InheritanceKind::Single,
        });
        schema
    }

    /// Set the database schema (namespace) of the table, e.g. `public`.
    pub fn in_db_schema(mut self, db_schema: impl Into<String>) -> Self {
        self.db_schema = Some(db_schema.into());
        self
    }

    /// Append a column. Fails once the schema is sealed.
    pub fn add_column(&mut self, column: Column) -> Result<(), SchemaError> {
        if self.sealed {
            return Err(SchemaError::Sealed {
                entity: self.entity_type.clone(),
                column: column.name,
            });
        }
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(SchemaError::DuplicateColumn {
                entity: self.entity_type.clone(),
                column: column.name,
            });
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn add_relationship(&mut self, relationship: Relationship) -> Result<(), SchemaError> {
        if self.sealed {
            return Err(SchemaError::Sealed {
                entity: self.entity_type.clone(),
                column: relationship.name,
            });
        }
        self.relationships.push(relationship);
        Ok(())
    }

    /// Declare the polymorphic discriminator column (inheritance root only).
    pub fn set_discriminator(&mut self, column: impl Into<String>) {
        self.polymorphic_on = Some(column.into());
    }

    pub fn set_polymorphic_identity(&mut self, identity: impl Into<String>) {
        self.polymorphic_identity = Some(identity.into());
    }

    /// Validate and freeze the schema.
    pub fn seal(mut self) -> Result<Arc<EntitySchema>, SchemaError> {
        self.validate()?;
        self.sealed = true;
        Ok(Arc::new(self))
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let entity = self.entity_type.clone();

        if let Some(link) = &self.inherits {
            if !link.parent.sealed {
                return Err(SchemaError::Malformed {
                    entity,
                    reason: format!("parent {} is not sealed", link.parent.entity_type),
                });
            }
            if self.polymorphic_on.is_some() {
                return Err(SchemaError::DiscriminatorConflict { entity });
            }
        }

        let has_local_pk = self.columns.iter().any(|c| c.primary_key);
        match self.link_kind() {
            Some(InheritanceKind::Single) => {
                if has_local_pk {
                    return Err(SchemaError::Malformed {
                        entity,
                        reason: "single-table subtypes inherit their primary key".to_string(),
                    });
                }
                // Extra columns land on the shared table; they must not shadow it.
                let parent = self.parent().map(|p| p.root_table_columns()).unwrap_or_default();
                if let Some(dup) = self
                    .columns
                    .iter()
                    .find(|c| parent.iter().any(|p| p.name == c.name))
                {
                    return Err(SchemaError::DuplicateColumn {
                        entity,
                        column: dup.name.clone(),
                    });
                }
            }
            Some(InheritanceKind::Joined) => {
                if !has_local_pk {
                    return Err(SchemaError::MissingPrimaryKey { entity });
                }
                let parent_table = self.parent().map(|p| p.table.clone()).unwrap_or_default();
                if !self.columns.iter().any(|c| c.references_table(&parent_table)) {
                    return Err(SchemaError::MissingParentLink {
                        entity,
                        parent_table,
                    });
                }
            }
            None => {
                if !has_local_pk {
                    return Err(SchemaError::MissingPrimaryKey { entity });
                }
            }
        }

        if let Some(disc) = &self.polymorphic_on
            && self.column(disc).is_none()
        {
            return Err(SchemaError::UnknownColumn {
                entity,
                column: disc.clone(),
            });
        }

        for rel in &self.relationships {
            for col in &rel.local_columns {
                if self.column(col).is_none() {
                    return Err(SchemaError::UnknownColumn {
                        entity,
                        column: col.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Columns physically present on a single-table hierarchy's shared table
    /// as seen from this level upwards.
    fn root_table_columns(&self) -> Vec<&Column> {
        let mut cols: Vec<&Column> = self.columns.iter().collect();
        if self.link_kind() == Some(InheritanceKind::Single)
            && let Some(parent) = self.parent()
        {
            cols.extend(parent.root_table_columns());
        }
        cols
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn db_schema(&self) -> Option<&str> {
        self.db_schema.as_deref()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Columns declared at this level, in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn inherits(&self) -> Option<&InheritanceLink> {
        self.inherits.as_ref()
    }

    pub fn parent(&self) -> Option<&Arc<EntitySchema>> {
        self.inherits.as_ref().map(|l| &l.parent)
    }

    pub fn link_kind(&self) -> Option<InheritanceKind> {
        self.inherits.as_ref().map(|l| l.kind)
    }

    /// Primary-key columns, in declaration order.
    ///
    /// Single-table subtypes report their parent's key.
    pub fn primary_key(&self) -> Vec<&Column> {
        match (self.link_kind(), self.parent()) {
            (Some(InheritanceKind::Single), Some(parent)) => parent.primary_key(),
            _ => self.columns.iter().filter(|c| c.primary_key).collect(),
        }
    }

    /// The inheritance root of this schema.
    pub fn root(&self) -> &EntitySchema {
        match self.parent() {
            Some(parent) => parent.root(),
            None => self,
        }
    }

    /// The discriminator column, declared on the inheritance root.
    pub fn discriminator(&self) -> Option<&Column> {
        let root = self.root();
        root.polymorphic_on.as_deref().and_then(|name| root.column(name))
    }

    pub fn polymorphic_identity(&self) -> Option<&str> {
        self.polymorphic_identity.as_deref()
    }

    /// All schemas from the inheritance root down to this one.
    pub fn chain(&self) -> Vec<&EntitySchema> {
        let mut chain = match self.parent() {
            Some(parent) => parent.chain(),
            None => Vec::new(),
        };
        chain.push(self);
        chain
    }

    /// Whether `entity_type` is this type or one of its ancestors.
    pub fn is_a(&self, entity_type: &str) -> bool {
        self.chain().iter().any(|s| s.entity_type == entity_type)
    }

    /// Depth counted in physical tables (joined links only).
    pub fn table_depth(&self) -> usize {
        self.chain()
            .iter()
            .filter(|s| s.link_kind() != Some(InheritanceKind::Single))
            .count()
    }
}
