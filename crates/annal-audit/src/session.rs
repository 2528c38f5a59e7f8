//! Interfaces consumed from the host persistence runtime.
//!
//! The host owns the unit of work. At flush time it exposes plain snapshots
//! of the new, dirty and deleted entities, force-loads deferred attributes on
//! request, and accepts audit rows into the same pending write batch.

use annal_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::AuditError;
use crate::interceptor::FlushReport;
use crate::row::AuditRow;

/// Host-assigned identity of an entity instance within a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Before/after view of one scalar attribute across the current flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttributeSnapshot {
    /// Not materialized in memory (deferred or expired).
    Unloaded,
    /// Loaded and not assigned during this unit of work.
    Clean { value: Value },
    /// Assigned during this unit of work. `previous` is `None` when no
    /// baseline was loaded before the assignment.
    Assigned {
        previous: Option<Value>,
        current: Value,
    },
    /// The value was removed without a replacement.
    Removed { previous: Value },
}

impl AttributeSnapshot {
    pub fn clean(value: impl Into<Value>) -> Self {
        Self::Clean {
            value: value.into(),
        }
    }

    pub fn assigned(previous: Option<Value>, current: impl Into<Value>) -> Self {
        Self::Assigned {
            previous,
            current: current.into(),
        }
    }

    /// Whether the attribute was touched during this unit of work.
    pub fn is_touched(&self) -> bool {
        matches!(self, Self::Assigned { .. } | Self::Removed { .. })
    }
}

static UNLOADED: AttributeSnapshot = AttributeSnapshot::Unloaded;

/// Before/after view of one relationship attribute across the current flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RelationshipSnapshot {
    #[default]
    Unchanged,
    /// The related object was swapped.
    Replaced {
        previous: Option<EntityKey>,
        current: Option<EntityKey>,
    },
}

impl RelationshipSnapshot {
    /// Whether the relationship now points somewhere else.
    ///
    /// Re-assigning the object that was already related is not a change.
    pub fn is_changed(&self) -> bool {
        match self {
            Self::Unchanged => false,
            Self::Replaced { previous, current } => previous != current,
        }
    }
}

/// Snapshot of one entity participating in a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub key: EntityKey,

    /// Dynamic (most derived) type of the instance.
    pub entity_type: String,

    /// Scalar attributes by attribute name. Missing entries are unloaded.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSnapshot>,

    /// Relationship attributes by name.
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipSnapshot>,
}

impl EntityState {
    pub fn new(key: impl Into<EntityKey>, entity_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entity_type: entity_type.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, snapshot: AttributeSnapshot) -> Self {
        self.attributes.insert(name.into(), snapshot);
        self
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        snapshot: RelationshipSnapshot,
    ) -> Self {
        self.relationships.insert(name.into(), snapshot);
        self
    }

    /// Snapshot for `attribute`, treating missing entries as unloaded.
    pub fn attribute(&self, attribute: &str) -> &AttributeSnapshot {
        self.attributes.get(attribute).unwrap_or(&UNLOADED)
    }
}

/// The entities of one flush, partitioned by pending operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub new: Vec<EntityState>,
    pub dirty: Vec<EntityState>,
    pub deleted: Vec<EntityState>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }
}

/// The host's current unit of work, as seen from the pre-commit hook.
pub trait UnitOfWork {
    /// Snapshots of the new, dirty and deleted entities of this flush.
    ///
    /// Derived values (server defaults, relationship-driven foreign keys)
    /// must already be resolved.
    fn change_set(&self) -> ChangeSet;

    /// Force-load a deferred or expired attribute and return its value.
    fn load_attribute(&mut self, key: &EntityKey, attribute: &str) -> anyhow::Result<Value>;

    /// Stage an audit row into the pending write batch of this transaction.
    fn stage(&mut self, row: AuditRow) -> anyhow::Result<()>;
}

/// A subscriber to a session's pre-commit save-lifecycle event.
pub trait FlushListener: Send + Sync {
    fn before_commit(&self, uow: &mut dyn UnitOfWork) -> Result<FlushReport, AuditError>;
}

/// A session that can dispatch its pre-commit event to listeners.
pub trait HookSession {
    /// Subscribe `listener` under `name`; an existing listener with the same
    /// name is replaced.
    fn subscribe(&mut self, name: &str, listener: Arc<dyn FlushListener>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassigning_same_related_object_is_not_a_change() {
        let same = RelationshipSnapshot::Replaced {
            previous: Some(EntityKey::from("parent:1")),
            current: Some(EntityKey::from("parent:1")),
        };
        assert!(!same.is_changed());

        let swapped = RelationshipSnapshot::Replaced {
            previous: Some(EntityKey::from("parent:1")),
            current: Some(EntityKey::from("parent:2")),
        };
        assert!(swapped.is_changed());

        let attached = RelationshipSnapshot::Replaced {
            previous: None,
            current: Some(EntityKey::from("parent:2")),
        };
        assert!(attached.is_changed());
    }

    #[test]
    fn test_missing_attribute_is_unloaded() {
        let state = EntityState::new("r:1", "Reservation")
            .with_attribute("name", AttributeSnapshot::clean("Me"));

        assert_eq!(state.attribute("name"), &AttributeSnapshot::clean("Me"));
        assert_eq!(state.attribute("data"), &AttributeSnapshot::Unloaded);
    }
}
