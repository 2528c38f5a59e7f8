//! Registry of audited entity types.
//!
//! [`AuditRegistry::make_auditable`] is the registration entry point. It
//! derives the audit table and shadow type of one sealed entity schema and
//! records the association. Types in an inheritance hierarchy must be
//! registered root first.

use annal_core::{AuditConfig, ConfigError, EntitySchema, InheritanceKind, SchemaError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::audit_schema::{
    AuditSchema, AuditTable, AuditTableId, ShadowType, append_single_columns, check_reserved,
    derive_table,
};
use crate::writer::RecordIdGenerator;

/// Explicit map from source entity type to its Audit Schema.
#[derive(Debug, Clone, Default)]
pub struct AuditRegistry {
    config: AuditConfig,
    /// Audit tables in creation order (parents before children).
    tables: Vec<AuditTable>,
    schemas: HashMap<String, AuditSchema>,
    sources: HashMap<String, Arc<EntitySchema>>,
    /// Registered type names, in registration order.
    order: Vec<String>,
    /// Record ids shared by every writer built from this registry.
    record_ids: Arc<RecordIdGenerator>,
}

impl AuditRegistry {
    /// Create an empty registry. Fails if `config` does not validate.
    pub fn new(config: AuditConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            record_ids: Arc::new(RecordIdGenerator::new(config.record_id)),
            config,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// The record id generator shared by every session installed with this
    /// registry.
    ///
    /// Advance it past the ids already persisted before writing under the
    /// `sequence` strategy.
    pub fn record_ids(&self) -> &Arc<RecordIdGenerator> {
        &self.record_ids
    }

    /// Register `source` for auditing and return its Audit Schema.
    ///
    /// On error nothing is registered.
    pub fn make_auditable(
        &mut self,
        source: Arc<EntitySchema>,
    ) -> Result<&AuditSchema, SchemaError> {
        let entity = source.entity_type().to_string();

        if self.schemas.contains_key(&entity) {
            return Err(SchemaError::AlreadyRegistered { entity });
        }
        if !source.is_sealed() {
            return Err(SchemaError::Malformed {
                entity,
                reason: "schema must be sealed before registration".to_string(),
            });
        }
        check_reserved(&self.config, &source)?;

        let parent = match source.parent() {
            Some(parent_schema) => {
                let parent = self.schemas.get(parent_schema.entity_type()).ok_or_else(|| {
                    SchemaError::ParentNotRegistered {
                        entity: entity.clone(),
                        parent: parent_schema.entity_type().to_string(),
                    }
                })?;
                Some(parent.clone())
            }
            None => None,
        };

        let shadow_name = self.config.shadow_type_name(&entity);
        let schema = match (source.link_kind(), parent) {
            (Some(InheritanceKind::Single), Some(parent)) => {
                let table = self.table_mut(parent.table)?;
                let appended = append_single_columns(table, &source);
                info!(
                    entity = %entity,
                    audit_table = %table.name,
                    appended = appended.len(),
                    link = "single",
                    "Entity made auditable"
                );
                AuditSchema {
                    source_type: entity.clone(),
                    table: parent.table,
                    shadow: ShadowType {
                        name: shadow_name,
                        source_type: entity.clone(),
                        table: parent.table,
                        parent: Some(parent.shadow.name.clone()),
                        polymorphic_identity: source.polymorphic_identity().map(str::to_string),
                    },
                    levels: parent.levels.clone(),
                }
            }
            (_, parent) => {
                let id = AuditTableId(self.tables.len());
                let parent_table = match &parent {
                    Some(p) => Some(self.table_ref(p.table)?),
                    None => None,
                };
                let table = derive_table(&self.config, id, &source, parent_table)?;

                info!(
                    entity = %entity,
                    source_table = %table.source_table,
                    audit_table = %table.name,
                    link = %source
                        .link_kind()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "root".to_string()),
                    "Entity made auditable"
                );

                if let (Some(p), Some(key)) = (&parent, table.parent_key.clone()) {
                    let parent_table = self.table_mut(p.table)?;
                    if !parent_table.referenced_keys.contains(&key.ref_columns) {
                        parent_table.referenced_keys.push(key.ref_columns);
                    }
                }
                self.tables.push(table);

                let mut levels = parent.as_ref().map(|p| p.levels.clone()).unwrap_or_default();
                levels.push(id);

                AuditSchema {
                    source_type: entity.clone(),
                    table: id,
                    shadow: ShadowType {
                        name: shadow_name,
                        source_type: entity.clone(),
                        table: id,
                        parent: parent.as_ref().map(|p| p.shadow.name.clone()),
                        polymorphic_identity: source.polymorphic_identity().map(str::to_string),
                    },
                    levels,
                }
            }
        };

        self.sources.insert(entity.clone(), source);
        self.order.push(entity.clone());
        Ok(&*self.schemas.entry(entity).or_insert(schema))
    }

    pub fn is_audited(&self, entity_type: &str) -> bool {
        self.schemas.contains_key(entity_type)
    }

    pub fn audit_schema(&self, entity_type: &str) -> Option<&AuditSchema> {
        self.schemas.get(entity_type)
    }

    pub fn source_schema(&self, entity_type: &str) -> Option<&Arc<EntitySchema>> {
        self.sources.get(entity_type)
    }

    /// Audit Schemas in registration order.
    pub fn schemas(&self) -> impl Iterator<Item = &AuditSchema> {
        self.order.iter().filter_map(|t| self.schemas.get(t))
    }

    pub fn table(&self, id: AuditTableId) -> Option<&AuditTable> {
        self.tables.get(id.0)
    }

    /// Audit tables in creation order; a parent always precedes its children.
    pub fn tables(&self) -> &[AuditTable] {
        &self.tables
    }

    pub fn table_by_name(&self, name: &str) -> Option<&AuditTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_ref(&self, id: AuditTableId) -> Result<&AuditTable, SchemaError> {
        self.tables.get(id.0).ok_or_else(|| SchemaError::Malformed {
            entity: String::new(),
            reason: format!("audit table #{} is not registered", id.0),
        })
    }

    fn table_mut(&mut self, id: AuditTableId) -> Result<&mut AuditTable, SchemaError> {
        self.tables.get_mut(id.0).ok_or_else(|| SchemaError::Malformed {
            entity: String::new(),
            reason: format!("audit table #{} is not registered", id.0),
        })
    }
}
