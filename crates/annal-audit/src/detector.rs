//! Change Detector.
//!
//! Decides, for one entity instance and one save event, whether a revision
//! must be written and which values it carries. Detection is history based:
//! an attribute counts as changed when its snapshot reports an added or
//! removed value, never by comparing against the database.

use annal_core::{CaptureMode, Value};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::audit_schema::AuditTableId;
use crate::error::DetectionError;
use crate::registry::AuditRegistry;
use crate::row::ValueMap;
use crate::session::{AttributeSnapshot, EntityKey, EntityState, UnitOfWork};

/// Change history of one attribute across one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributeHistory {
    /// Values present now but not before this unit of work began.
    pub added: Vec<Value>,
    /// The loaded baseline, when nothing changed.
    pub unchanged: Vec<Value>,
    /// Values present before but removed.
    pub deleted: Vec<Value>,
}

impl AttributeHistory {
    pub fn unchanged(value: Value) -> Self {
        Self {
            unchanged: vec![value],
            ..Default::default()
        }
    }

    /// Classify a loaded snapshot. Returns `None` for unloaded attributes.
    pub fn from_snapshot(snapshot: &AttributeSnapshot) -> Option<Self> {
        let history = match snapshot {
            AttributeSnapshot::Unloaded => return None,
            AttributeSnapshot::Clean { value } => Self::unchanged(value.clone()),
            AttributeSnapshot::Assigned {
                previous: None,
                current,
            } => Self {
                added: vec![current.clone()],
                ..Default::default()
            },
            AttributeSnapshot::Assigned {
                previous: Some(previous),
                current,
            } if previous == current => Self::unchanged(current.clone()),
            AttributeSnapshot::Assigned {
                previous: Some(previous),
                current,
            } => Self {
                added: vec![current.clone()],
                deleted: vec![previous.clone()],
                ..Default::default()
            },
            AttributeSnapshot::Removed { previous } => Self {
                deleted: vec![previous.clone()],
                ..Default::default()
            },
        };
        Some(history)
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty()
    }

    /// The value to record for this attribute.
    pub fn resolve(&self, capture: CaptureMode) -> Value {
        match capture {
            CaptureMode::Current => {
                if let Some(value) = self.added.last() {
                    value.clone()
                } else if !self.deleted.is_empty() {
                    Value::Null
                } else {
                    self.baseline()
                }
            }
            CaptureMode::Superseded => {
                if let Some(value) = self.deleted.first() {
                    value.clone()
                } else if let Some(value) = self.added.last() {
                    value.clone()
                } else {
                    self.baseline()
                }
            }
        }
    }

    fn baseline(&self) -> Value {
        self.unchanged.first().cloned().unwrap_or_default()
    }
}

/// Values captured for one audit table level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelValues {
    pub table: AuditTableId,
    pub values: ValueMap,
}

/// The detector's verdict for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeDecision {
    pub key: EntityKey,
    pub entity_type: String,
    pub changed: bool,
    pub deleted: bool,
    /// Per audit table level, root to leaf.
    pub levels: Vec<LevelValues>,
}

impl ChangeDecision {
    /// Captured value of `column` on the level backed by `table`.
    pub fn value(&self, table: AuditTableId, column: &str) -> Option<&Value> {
        self.levels
            .iter()
            .find(|l| l.table == table)
            .and_then(|l| l.values.get(column))
    }
}

pub struct ChangeDetector {
    registry: Arc<AuditRegistry>,
    capture: CaptureMode,
}

impl ChangeDetector {
    pub fn new(registry: Arc<AuditRegistry>) -> Self {
        let capture = registry.config().capture;
        Self { registry, capture }
    }

    pub fn with_capture(mut self, capture: CaptureMode) -> Self {
        self.capture = capture;
        self
    }

    /// Detect changes on `entity` for the current flush.
    ///
    /// Deferred attributes are force-loaded through `uow`. For deletions the
    /// non-key columns are not loaded since they are recorded as null.
    pub fn detect(
        &self,
        uow: &mut dyn UnitOfWork,
        entity: &EntityState,
        deleted: bool,
    ) -> Result<ChangeDecision, DetectionError> {
        let untracked = || DetectionError::Untracked {
            entity_type: entity.entity_type.clone(),
        };
        let audit = self
            .registry
            .audit_schema(&entity.entity_type)
            .ok_or_else(untracked)?;
        let source = self
            .registry
            .source_schema(&entity.entity_type)
            .ok_or_else(untracked)?;

        let chain = source.chain();
        let mapped: HashSet<&str> = chain.iter().map(|s| s.entity_type()).collect();

        let mut changed = false;
        let mut levels = Vec::with_capacity(audit.levels.len());

        for &table_id in &audit.levels {
            let table = self.registry.table(table_id).ok_or_else(untracked)?;
            let mut values = ValueMap::new();

            for column in table.business_columns() {
                let (Some(owner), Some(attribute)) = (column.source_entity(), column.attribute())
                else {
                    continue;
                };
                // Columns added by sibling single-table subtypes.
                if !mapped.contains(owner) {
                    values.insert(column.name.clone(), Value::Null);
                    continue;
                }
                if deleted && !column.is_source_key() {
                    values.insert(column.name.clone(), Value::Null);
                    continue;
                }

                let snapshot = entity.attribute(attribute);
                let history = match AttributeHistory::from_snapshot(snapshot) {
                    Some(history) => history,
                    None => {
                        let value = uow.load_attribute(&entity.key, attribute).map_err(|source| {
                            DetectionError::Load {
                                entity: entity.key.to_string(),
                                attribute: attribute.to_string(),
                                source,
                            }
                        })?;
                        AttributeHistory::unchanged(value)
                    }
                };

                changed |= history.has_changes();
                values.insert(column.name.clone(), history.resolve(self.capture));
            }

            levels.push(LevelValues {
                table: table_id,
                values,
            });
        }

        if !changed {
            changed = chain.iter().any(|schema| {
                schema
                    .relationships()
                    .iter()
                    .filter(|rel| !rel.local_columns.is_empty())
                    .any(|rel| {
                        entity
                            .relationships
                            .get(&rel.name)
                            .is_some_and(|snapshot| snapshot.is_changed())
                    })
            });
        }

        Ok(ChangeDecision {
            key: entity.key.clone(),
            entity_type: entity.entity_type.clone(),
            changed: changed || deleted,
            deleted,
            levels,
        })
    }
}
