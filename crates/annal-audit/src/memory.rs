//! In-memory host runtime.
//!
//! A small unit-of-work implementation with an identity map, attribute
//! snapshots, relationship-driven foreign keys and transactional commit into
//! a shared [`MemoryStore`]. It implements [`UnitOfWork`] and [`HookSession`]
//! so the audit engine can be driven end to end without a database.

use annal_core::Value;
use anyhow::{Context, anyhow, bail};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::AuditError;
use crate::interceptor::FlushReport;
use crate::row::AuditRow;
use crate::session::{
    AttributeSnapshot, ChangeSet, EntityKey, EntityState, FlushListener, HookSession,
    RelationshipSnapshot, UnitOfWork,
};

#[derive(Debug, Clone, Default)]
struct StoredEntity {
    entity_type: String,
    values: BTreeMap<String, Value>,
    links: BTreeMap<String, Option<EntityKey>>,
}

#[derive(Debug, Default)]
struct StoreData {
    entities: BTreeMap<EntityKey, StoredEntity>,
    audit: Vec<AuditRow>,
}

/// Committed state shared by every session opened on it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed attribute values of an entity.
    pub fn row(&self, key: &EntityKey) -> Option<BTreeMap<String, Value>> {
        self.lock().entities.get(key).map(|e| e.values.clone())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.lock().entities.contains_key(key)
    }

    /// Every committed audit row, in commit order.
    pub fn audit_rows(&self) -> Vec<AuditRow> {
        self.lock().audit.clone()
    }

    /// Committed audit rows of one audit table, in commit order.
    pub fn audit_rows_in(&self, table: &str) -> Vec<AuditRow> {
        self.lock()
            .audit
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Persistent,
    Deleted,
}

#[derive(Debug, Clone)]
struct Link {
    target: Option<EntityKey>,
    fk_attribute: String,
    target_attribute: String,
}

#[derive(Debug, Clone)]
struct Tracked {
    entity_type: String,
    lifecycle: Lifecycle,
    attributes: BTreeMap<String, AttributeSnapshot>,
    relationships: BTreeMap<String, RelationshipSnapshot>,
    links: BTreeMap<String, Link>,
    /// Related objects as of the last flush.
    baseline_links: BTreeMap<String, Option<EntityKey>>,
}

impl Tracked {
    fn is_dirty(&self) -> bool {
        self.attributes.values().any(AttributeSnapshot::is_touched)
            || self
                .relationships
                .values()
                .any(|r| matches!(r, RelationshipSnapshot::Replaced { .. }))
    }

    fn state(&self, key: &EntityKey) -> EntityState {
        EntityState {
            key: key.clone(),
            entity_type: self.entity_type.clone(),
            attributes: self.attributes.clone(),
            relationships: self.relationships.clone(),
        }
    }

    /// Values to persist; unloaded attributes keep their stored value.
    fn materialized(&self) -> BTreeMap<String, Value> {
        self.attributes
            .iter()
            .filter_map(|(name, snapshot)| {
                let value = match snapshot {
                    AttributeSnapshot::Unloaded => return None,
                    AttributeSnapshot::Clean { value } => value.clone(),
                    AttributeSnapshot::Assigned { current, .. } => current.clone(),
                    AttributeSnapshot::Removed { .. } => Value::Null,
                };
                Some((name.clone(), value))
            })
            .collect()
    }

    fn current_value(&self, attribute: &str) -> Option<Value> {
        match self.attributes.get(attribute)? {
            AttributeSnapshot::Unloaded => None,
            AttributeSnapshot::Clean { value } => Some(value.clone()),
            AttributeSnapshot::Assigned { current, .. } => Some(current.clone()),
            AttributeSnapshot::Removed { .. } => Some(Value::Null),
        }
    }
}

/// Writes flushed but not yet committed.
#[derive(Debug, Default)]
struct Pending {
    writes: BTreeMap<EntityKey, StoredEntity>,
    deletes: HashSet<EntityKey>,
    audit: Vec<AuditRow>,
}

/// A unit of work over a [`MemoryStore`].
pub struct MemorySession {
    store: Arc<MemoryStore>,
    listeners: Vec<(String, Arc<dyn FlushListener>)>,
    identity: BTreeMap<EntityKey, Tracked>,
    pending: Pending,
    staged: Vec<AuditRow>,
    unloadable: HashSet<(EntityKey, String)>,
    stage_limit: Option<usize>,
}

impl MemorySession {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            listeners: Vec::new(),
            identity: BTreeMap::new(),
            pending: Pending::default(),
            staged: Vec::new(),
            unloadable: HashSet::new(),
            stage_limit: None,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Audit rows flushed in this transaction but not yet committed.
    pub fn pending_audit_rows(&self) -> &[AuditRow] {
        &self.pending.audit
    }

    /// Add a new entity. Attributes not given are null on insert.
    pub fn add<I, A>(
        &mut self,
        entity_type: &str,
        key: impl Into<EntityKey>,
        values: I,
    ) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (A, Value)>,
        A: Into<String>,
    {
        let key = key.into();
        if self.identity.contains_key(&key) || self.stored(&key).is_some() {
            bail!("entity {key} already exists");
        }
        let attributes = values
            .into_iter()
            .map(|(name, value)| (name.into(), AttributeSnapshot::assigned(None, value)))
            .collect();
        self.identity.insert(
            key,
            Tracked {
                entity_type: entity_type.to_string(),
                lifecycle: Lifecycle::New,
                attributes,
                relationships: BTreeMap::new(),
                links: BTreeMap::new(),
                baseline_links: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Load a persistent entity with every attribute materialized.
    pub fn load(&mut self, key: impl Into<EntityKey>) -> anyhow::Result<()> {
        self.load_deferred(key, &[])
    }

    /// Load a persistent entity, leaving `deferred` attributes unloaded.
    pub fn load_deferred(&mut self, key: impl Into<EntityKey>, deferred: &[&str]) -> anyhow::Result<()> {
        let key = key.into();
        if self.identity.contains_key(&key) {
            return Ok(());
        }
        let stored = self
            .stored(&key)
            .ok_or_else(|| anyhow!("entity {key} not found"))?;

        let attributes = stored
            .values
            .iter()
            .map(|(name, value)| {
                let snapshot = if deferred.contains(&name.as_str()) {
                    AttributeSnapshot::Unloaded
                } else {
                    AttributeSnapshot::clean(value.clone())
                };
                (name.clone(), snapshot)
            })
            .collect();
        self.identity.insert(
            key,
            Tracked {
                entity_type: stored.entity_type,
                lifecycle: Lifecycle::Persistent,
                attributes,
                relationships: BTreeMap::new(),
                links: BTreeMap::new(),
                baseline_links: stored.links,
            },
        );
        Ok(())
    }

    /// Assign an attribute.
    pub fn set(
        &mut self,
        key: impl Into<EntityKey>,
        attribute: &str,
        value: impl Into<Value>,
    ) -> anyhow::Result<()> {
        let tracked = self.tracked_mut(key.into())?;
        let value = value.into();
        let previous = match tracked.attributes.remove(attribute) {
            None | Some(AttributeSnapshot::Unloaded) => None,
            Some(AttributeSnapshot::Clean { value }) => Some(value),
            Some(AttributeSnapshot::Assigned { previous, .. }) => previous,
            Some(AttributeSnapshot::Removed { previous }) => Some(previous),
        };
        tracked
            .attributes
            .insert(attribute.to_string(), AttributeSnapshot::assigned(previous, value));
        Ok(())
    }

    /// Remove an attribute's value without a replacement.
    pub fn unset(&mut self, key: impl Into<EntityKey>, attribute: &str) -> anyhow::Result<()> {
        let key = key.into();
        if matches!(
            self.tracked_mut(key.clone())?.attributes.get(attribute),
            None | Some(AttributeSnapshot::Unloaded)
        ) {
            self.load_attribute(&key, attribute)?;
        }
        let tracked = self.tracked_mut(key)?;
        let next = match tracked.attributes.remove(attribute) {
            Some(AttributeSnapshot::Clean { value }) => AttributeSnapshot::Removed { previous: value },
            Some(AttributeSnapshot::Assigned {
                previous: Some(previous),
                ..
            })
            | Some(AttributeSnapshot::Removed { previous }) => AttributeSnapshot::Removed { previous },
            _ => AttributeSnapshot::assigned(None, Value::Null),
        };
        tracked.attributes.insert(attribute.to_string(), next);
        Ok(())
    }

    /// Expire an attribute so the next read reloads it.
    pub fn expire(&mut self, key: impl Into<EntityKey>, attribute: &str) -> anyhow::Result<()> {
        let tracked = self.tracked_mut(key.into())?;
        tracked
            .attributes
            .insert(attribute.to_string(), AttributeSnapshot::Unloaded);
        Ok(())
    }

    /// Mark an entity for deletion.
    pub fn delete(&mut self, key: impl Into<EntityKey>) -> anyhow::Result<()> {
        let key = key.into();
        let lifecycle = self.tracked_mut(key.clone())?.lifecycle;
        if lifecycle == Lifecycle::New {
            self.identity.remove(&key);
        } else if let Some(tracked) = self.identity.get_mut(&key) {
            tracked.lifecycle = Lifecycle::Deleted;
        }
        Ok(())
    }

    /// Point relationship `relationship` of `key` at `target`.
    ///
    /// At flush the foreign key attribute `fk_attribute` is resolved from
    /// the target's `target_attribute` without recording column history.
    pub fn relate(
        &mut self,
        key: impl Into<EntityKey>,
        relationship: &str,
        target: Option<EntityKey>,
        fk_attribute: &str,
        target_attribute: &str,
    ) -> anyhow::Result<()> {
        let tracked = self.tracked_mut(key.into())?;
        let previous = match tracked.relationships.get(relationship) {
            Some(RelationshipSnapshot::Replaced { previous, .. }) => previous.clone(),
            _ => tracked.baseline_links.get(relationship).cloned().flatten(),
        };
        tracked.relationships.insert(
            relationship.to_string(),
            RelationshipSnapshot::Replaced {
                previous,
                current: target.clone(),
            },
        );
        tracked.links.insert(
            relationship.to_string(),
            Link {
                target,
                fk_attribute: fk_attribute.to_string(),
                target_attribute: target_attribute.to_string(),
            },
        );
        Ok(())
    }

    /// Make loading `attribute` of `key` fail.
    pub fn make_unloadable(&mut self, key: impl Into<EntityKey>, attribute: &str) {
        self.unloadable.insert((key.into(), attribute.to_string()));
    }

    /// Refuse audit rows once `rows` have been staged in one flush.
    pub fn limit_staging(&mut self, rows: usize) {
        self.stage_limit = Some(rows);
    }

    /// Flush pending changes into the transaction and run pre-commit
    /// listeners. On error the whole transaction is rolled back.
    pub fn flush(&mut self) -> Result<FlushReport, AuditError> {
        if let Err(err) = self.resolve_links() {
            self.rollback();
            return Err(err.into());
        }

        self.staged.clear();
        let listeners: Vec<Arc<dyn FlushListener>> =
            self.listeners.iter().map(|(_, l)| l.clone()).collect();

        let mut report = FlushReport::default();
        for listener in listeners {
            match listener.before_commit(self) {
                Ok(r) => {
                    report.inspected += r.inspected;
                    report.changed += r.changed;
                    report.skipped += r.skipped;
                    report.rows_staged += r.rows_staged;
                }
                Err(err) => {
                    self.rollback();
                    return Err(err);
                }
            }
        }

        self.apply_flush();
        Ok(report)
    }

    /// Flush, then make the transaction's writes durable atomically.
    pub fn commit(&mut self) -> Result<FlushReport, AuditError> {
        let report = self.flush()?;

        let pending = std::mem::take(&mut self.pending);
        let mut data = self.store.lock();
        for key in pending.deletes {
            data.entities.remove(&key);
        }
        for (key, write) in pending.writes {
            let entry = data.entities.entry(key).or_default();
            entry.entity_type = write.entity_type;
            entry.values.extend(write.values);
            entry.links.extend(write.links);
        }
        data.audit.extend(pending.audit);
        Ok(report)
    }

    /// Discard every flushed and unflushed change of this transaction.
    pub fn rollback(&mut self) {
        self.pending = Pending::default();
        self.staged.clear();
        self.identity.clear();
    }

    fn stored(&self, key: &EntityKey) -> Option<StoredEntity> {
        if self.pending.deletes.contains(key) {
            return None;
        }
        if let Some(write) = self.pending.writes.get(key) {
            let mut merged = self.store.lock().entities.get(key).cloned().unwrap_or_default();
            merged.entity_type = write.entity_type.clone();
            merged.values.extend(write.values.clone());
            merged.links.extend(write.links.clone());
            return Some(merged);
        }
        self.store.lock().entities.get(key).cloned()
    }

    fn tracked_mut(&mut self, key: EntityKey) -> anyhow::Result<&mut Tracked> {
        if !self.identity.contains_key(&key) {
            self.load(key.clone())?;
        }
        let tracked = self
            .identity
            .get_mut(&key)
            .ok_or_else(|| anyhow!("entity {key} not found"))?;
        if tracked.lifecycle == Lifecycle::Deleted {
            bail!("entity {key} is deleted");
        }
        Ok(tracked)
    }

    fn resolve_links(&mut self) -> anyhow::Result<()> {
        let mut resolved = Vec::new();
        for (key, tracked) in &self.identity {
            if tracked.lifecycle == Lifecycle::Deleted {
                continue;
            }
            for link in tracked.links.values() {
                let value = match &link.target {
                    None => Value::Null,
                    Some(target) => self
                        .identity
                        .get(target)
                        .and_then(|t| t.current_value(&link.target_attribute))
                        .or_else(|| {
                            self.stored(target)
                                .and_then(|s| s.values.get(&link.target_attribute).cloned())
                        })
                        .with_context(|| {
                            format!("cannot resolve {} of related {target}", link.target_attribute)
                        })?,
                };
                resolved.push((key.clone(), link.fk_attribute.clone(), value));
            }
        }

        for (key, attribute, value) in resolved {
            if let Some(tracked) = self.identity.get_mut(&key) {
                let snapshot = match tracked.attributes.remove(&attribute) {
                    // Already assigned explicitly; keep the recorded history.
                    Some(AttributeSnapshot::Assigned { previous, .. }) => {
                        AttributeSnapshot::Assigned {
                            previous,
                            current: value,
                        }
                    }
                    _ => AttributeSnapshot::Clean { value },
                };
                tracked.attributes.insert(attribute, snapshot);
            }
        }
        Ok(())
    }

    fn apply_flush(&mut self) {
        let mut survivors = BTreeMap::new();
        for (key, mut tracked) in std::mem::take(&mut self.identity) {
            match tracked.lifecycle {
                Lifecycle::Deleted => {
                    self.pending.writes.remove(&key);
                    self.pending.deletes.insert(key);
                }
                Lifecycle::New | Lifecycle::Persistent => {
                    let links: BTreeMap<String, Option<EntityKey>> = tracked
                        .links
                        .iter()
                        .map(|(name, link)| (name.clone(), link.target.clone()))
                        .collect();
                    let write = self.pending.writes.entry(key.clone()).or_default();
                    write.entity_type = tracked.entity_type.clone();
                    write.values.extend(tracked.materialized());
                    write.links.extend(links.clone());
                    self.pending.deletes.remove(&key);

                    tracked.attributes = tracked
                        .attributes
                        .into_iter()
                        .map(|(name, snapshot)| {
                            let clean = match snapshot {
                                AttributeSnapshot::Unloaded => AttributeSnapshot::Unloaded,
                                AttributeSnapshot::Clean { value }
                                | AttributeSnapshot::Assigned { current: value, .. } => {
                                    AttributeSnapshot::Clean { value }
                                }
                                AttributeSnapshot::Removed { .. } => {
                                    AttributeSnapshot::clean(Value::Null)
                                }
                            };
                            (name, clean)
                        })
                        .collect();
                    tracked.lifecycle = Lifecycle::Persistent;
                    tracked.relationships.clear();
                    tracked.baseline_links.extend(links);
                    tracked.links.clear();
                    survivors.insert(key, tracked);
                }
            }
        }
        self.identity = survivors;
        self.pending.audit.append(&mut self.staged);
    }
}

impl UnitOfWork for MemorySession {
    fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (key, tracked) in &self.identity {
            match tracked.lifecycle {
                Lifecycle::New => changes.new.push(tracked.state(key)),
                Lifecycle::Deleted => changes.deleted.push(tracked.state(key)),
                Lifecycle::Persistent if tracked.is_dirty() => {
                    changes.dirty.push(tracked.state(key))
                }
                Lifecycle::Persistent => {}
            }
        }
        changes
    }

    fn load_attribute(&mut self, key: &EntityKey, attribute: &str) -> anyhow::Result<Value> {
        if self.unloadable.contains(&(key.clone(), attribute.to_string())) {
            bail!("attribute {attribute} of {key} cannot be loaded");
        }
        let is_new = self
            .identity
            .get(key)
            .is_some_and(|t| t.lifecycle == Lifecycle::New);

        let value = match self.stored(key) {
            Some(stored) => stored
                .values
                .get(attribute)
                .cloned()
                .ok_or_else(|| anyhow!("{key} has no attribute {attribute}"))?,
            None if is_new => Value::Null,
            None => bail!("entity {key} not found"),
        };

        if let Some(tracked) = self.identity.get_mut(key)
            && matches!(
                tracked.attributes.get(attribute),
                None | Some(AttributeSnapshot::Unloaded)
            )
        {
            tracked
                .attributes
                .insert(attribute.to_string(), AttributeSnapshot::clean(value.clone()));
        }
        Ok(value)
    }

    fn stage(&mut self, row: AuditRow) -> anyhow::Result<()> {
        if let Some(limit) = self.stage_limit
            && self.staged.len() >= limit
        {
            bail!("write batch refused row for {}", row.table);
        }
        self.staged.push(row);
        Ok(())
    }
}

impl HookSession for MemorySession {
    fn subscribe(&mut self, name: &str, listener: Arc<dyn FlushListener>) {
        match self.listeners.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = listener,
            None => self.listeners.push((name.to_string(), listener)),
        }
    }
}
