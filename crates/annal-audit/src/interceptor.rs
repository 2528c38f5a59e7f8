//! Change Interceptor.
//!
//! The single entry point the host runtime invokes before commit. It
//! partitions the unit of work into new, dirty and deleted entities of
//! audited types and hands each to the detector and writer.

use annal_core::{DetectionFailurePolicy, WritePolicy};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::detector::ChangeDetector;
use crate::error::AuditError;
use crate::registry::AuditRegistry;
use crate::session::{EntityState, FlushListener, HookSession, UnitOfWork};
use crate::writer::{Clock, RecordIdGenerator, RevisionWriter};

/// Name under which the interceptor subscribes to a session.
pub const LISTENER_NAME: &str = "annal.audit";

/// Outcome of one interceptor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entities of audited types seen in the flush.
    pub inspected: usize,
    /// Entities for which a revision was written.
    pub changed: usize,
    /// Entities skipped under the `skip` detection-failure policy.
    pub skipped: usize,
    pub rows_staged: usize,
}

pub struct ChangeInterceptor {
    registry: Arc<AuditRegistry>,
    detector: ChangeDetector,
    writer: RevisionWriter,
}

impl ChangeInterceptor {
    pub fn new(registry: Arc<AuditRegistry>) -> Self {
        Self {
            detector: ChangeDetector::new(registry.clone()),
            writer: RevisionWriter::new(registry.clone()),
            registry,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.writer = self.writer.with_clock(clock);
        self
    }

    pub fn with_ids(mut self, ids: RecordIdGenerator) -> Self {
        self.writer = self.writer.with_ids(ids);
        self
    }

    pub fn registry(&self) -> &Arc<AuditRegistry> {
        &self.registry
    }

    /// Audit every new, dirty and deleted entity of the current flush.
    pub fn process(&self, uow: &mut dyn UnitOfWork) -> Result<FlushReport, AuditError> {
        let changes = uow.change_set();
        let audited = |e: &&EntityState| self.registry.is_audited(&e.entity_type);

        let pending: Vec<(&EntityState, bool)> = changes
            .new
            .iter()
            .filter(audited)
            .map(|e| (e, false))
            .chain(changes.dirty.iter().filter(audited).map(|e| (e, false)))
            .chain(changes.deleted.iter().filter(audited).map(|e| (e, true)))
            .collect();

        let config = self.registry.config();
        let mut report = FlushReport::default();

        for (entity, deleted) in pending {
            report.inspected += 1;

            let mut decision = match self.detector.detect(uow, entity, deleted) {
                Ok(decision) => decision,
                Err(err) if config.on_detection_error == DetectionFailurePolicy::Skip => {
                    warn!(
                        entity = %entity.key,
                        entity_type = %entity.entity_type,
                        error = %err,
                        "Skipping audit of entity"
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if config.write_policy == WritePolicy::Always {
                decision.changed = true;
            }

            let staged = self.writer.write(uow, &decision)?;
            if staged > 0 {
                report.changed += 1;
                report.rows_staged += staged;
            }
        }

        debug!(
            new = changes.new.len(),
            dirty = changes.dirty.len(),
            deleted = changes.deleted.len(),
            inspected = report.inspected,
            changed = report.changed,
            rows = report.rows_staged,
            "Audit pass complete"
        );

        Ok(report)
    }
}

impl FlushListener for ChangeInterceptor {
    fn before_commit(&self, uow: &mut dyn UnitOfWork) -> Result<FlushReport, AuditError> {
        self.process(uow)
    }
}

/// Subscribe a [`ChangeInterceptor`] for `registry` to `session`'s
/// pre-commit event.
///
/// Installing twice on the same session replaces the earlier interceptor.
pub fn install_audit_hooks<S>(session: &mut S, registry: Arc<AuditRegistry>) -> Arc<ChangeInterceptor>
where
    S: HookSession + ?Sized,
{
    let interceptor = Arc::new(ChangeInterceptor::new(registry));
    install_interceptor(session, interceptor.clone());
    interceptor
}

/// Subscribe a preconfigured interceptor to `session`.
pub fn install_interceptor<S>(session: &mut S, interceptor: Arc<ChangeInterceptor>)
where
    S: HookSession + ?Sized,
{
    session.subscribe(LISTENER_NAME, interceptor);
}
