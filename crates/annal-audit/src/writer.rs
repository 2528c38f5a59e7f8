//! Revision Writer.
//!
//! Turns a [`ChangeDecision`] into audit rows, one per audit table level,
//! all sharing a single record id, and stages them into the host's pending
//! write batch in root-to-leaf order.

use annal_core::RecordIdStrategy;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::detector::ChangeDecision;
use crate::error::WriteError;
use crate::registry::AuditRegistry;
use crate::row::{AuditRow, RecordId, ValueMap};
use crate::session::UnitOfWork;

/// Source of wall-clock time, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// The system clock, with microsecond resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Generates record ids according to a [`RecordIdStrategy`].
#[derive(Debug)]
pub struct RecordIdGenerator {
    strategy: RecordIdStrategy,
    next: AtomicI64,
}

impl RecordIdGenerator {
    pub fn new(strategy: RecordIdStrategy) -> Self {
        Self::starting_at(strategy, 1)
    }

    /// A generator whose first sequence value is `first`.
    ///
    /// Used to continue a sequence after the highest id already persisted.
    pub fn starting_at(strategy: RecordIdStrategy, first: i64) -> Self {
        Self {
            strategy,
            next: AtomicI64::new(first),
        }
    }

    /// Make sure the next sequence value is at least `next`.
    ///
    /// Never moves the sequence backwards.
    pub fn advance_to(&self, next: i64) {
        self.next.fetch_max(next, Ordering::SeqCst);
    }

    pub fn strategy(&self) -> RecordIdStrategy {
        self.strategy
    }

    pub fn next_id(&self) -> RecordId {
        match self.strategy {
            RecordIdStrategy::Uuid => RecordId::Uuid(Uuid::new_v4()),
            RecordIdStrategy::Sequence => RecordId::Sequence(self.next.fetch_add(1, Ordering::SeqCst)),
        }
    }
}

impl Default for RecordIdGenerator {
    fn default() -> Self {
        Self::new(RecordIdStrategy::default())
    }
}

pub struct RevisionWriter {
    registry: Arc<AuditRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<RecordIdGenerator>,
    last_timestamp: Mutex<f64>,
}

impl RevisionWriter {
    /// A writer drawing record ids from the registry's shared generator.
    pub fn new(registry: Arc<AuditRegistry>) -> Self {
        let ids = registry.record_ids().clone();
        Self {
            registry,
            clock: Arc::new(SystemClock),
            ids,
            last_timestamp: Mutex::new(0.0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a private generator instead of the registry's.
    pub fn with_ids(mut self, ids: RecordIdGenerator) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Next revision timestamp; strictly greater than any previous one.
    fn timestamp(&self) -> f64 {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let next = if now > *last { now } else { *last + 1e-6 };
        *last = next;
        next
    }

    /// Build the audit rows for `decision`, root to leaf.
    ///
    /// Fails without producing any row if a level lacks a business value.
    pub fn build_rows(&self, decision: &ChangeDecision) -> Result<Vec<AuditRow>, WriteError> {
        let unknown = || WriteError::UnknownTable {
            entity: decision.key.to_string(),
        };
        let schema = self
            .registry
            .audit_schema(&decision.entity_type)
            .ok_or_else(unknown)?;

        let record_id = self.ids.next_id();
        let timestamp = self.timestamp();
        let mut rows = Vec::with_capacity(decision.levels.len());

        for level in &decision.levels {
            let table = self.registry.table(level.table).ok_or_else(unknown)?;

            let mut values = ValueMap::new();
            let mut column_order = Vec::with_capacity(table.business_columns().len());
            for column in table.business_columns() {
                let value = level.values.get(&column.name).ok_or_else(|| {
                    WriteError::MissingValue {
                        entity: decision.key.to_string(),
                        table: table.name.clone(),
                        column: column.name.clone(),
                    }
                })?;
                values.insert(column.name.clone(), value.clone());
                column_order.push(column.name.clone());
            }

            rows.push(AuditRow {
                table: table.name.clone(),
                db_schema: table.db_schema.clone(),
                shadow_type: schema.shadow.name.clone(),
                record_id,
                timestamp,
                is_delete: decision.deleted,
                values,
                column_order,
            });
        }

        Ok(rows)
    }

    /// Stage the revision described by `decision` into `uow`.
    ///
    /// Writes nothing when the decision reports no change. Returns the
    /// number of rows staged.
    pub fn write(
        &self,
        uow: &mut dyn UnitOfWork,
        decision: &ChangeDecision,
    ) -> Result<usize, WriteError> {
        if !decision.changed {
            return Ok(0);
        }

        let rows = self.build_rows(decision)?;
        let staged = rows.len();
        for row in rows {
            debug!(
                table = %row.table,
                record_id = %row.record_id,
                is_delete = row.is_delete,
                entity = %decision.key,
                "Staging audit row"
            );
            let table = row.table.clone();
            uow.stage(row)
                .map_err(|source| WriteError::Staging { table, source })?;
        }
        Ok(staged)
    }
}
