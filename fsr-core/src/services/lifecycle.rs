//! Lifecycle gate
//!
//! The one path by which a record's status changes: decide through the
//! status machine, persist with a version check, then audit and announce.
//! Refusals are audited and announced too.

use crate::db::{audit, responses};
use crate::services::status_machine::{transition, TransitionCause};
use fsr_common::api::AuditEntry;
use fsr_common::events::{EventBus, FsrEvent};
use fsr_common::time::now;
use fsr_common::{Error, ResponseRecord, ResponseStatus, Result};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct LifecycleGate {
    db: SqlitePool,
    events: EventBus,
}

impl LifecycleGate {
    pub fn new(db: SqlitePool, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Move `record` (as read, with any non-status edits already applied)
    /// to `target`
    ///
    /// On success the returned record carries the new status and version.
    /// `ConcurrentModification` is passed back untouched so the caller can
    /// re-read and decide again.
    pub async fn apply(
        &self,
        record: ResponseRecord,
        target: ResponseStatus,
        actor: &str,
        cause: TransitionCause,
    ) -> Result<ResponseRecord> {
        let decided = match transition(&record, target, actor, cause.clone()) {
            Ok(t) => t,
            Err(err) => {
                self.refused(&record, target, actor, &cause, &err).await;
                return Err(err);
            }
        };

        let new_version = match responses::write_response(&self.db, &record, Some(&decided)).await {
            Ok(v) => v,
            Err(err @ Error::IllegalTransition { .. }) => {
                self.refused(&record, target, actor, &cause, &err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let mut updated = record;
        updated.status = decided.to();
        updated.version = new_version;
        if decided.releases_batch() {
            updated.qc_batch_ref = None;
            updated.is_sample_response = false;
        }

        tracing::info!(
            response_id = %updated.id,
            from = %decided.from(),
            to = %decided.to(),
            actor,
            cause = %cause,
            version = new_version,
            "Status changed"
        );

        self.audit(AuditEntry {
            response_id: updated.id.clone(),
            from_status: decided.from(),
            to_status: decided.to(),
            actor: actor.to_string(),
            cause: cause.label(),
            accepted: true,
            version: Some(new_version),
            detail: None,
            recorded_at: now(),
        })
        .await;

        self.events.emit_lossy(FsrEvent::StatusChanged {
            response_id: updated.id.clone(),
            from: decided.from(),
            to: decided.to(),
            actor: actor.to_string(),
            cause: cause.label(),
            version: new_version,
            timestamp: now(),
        });

        Ok(updated)
    }

    /// Audit the status a record was created with
    pub async fn record_creation(&self, record: &ResponseRecord, actor: &str) {
        self.audit(AuditEntry {
            response_id: record.id.clone(),
            from_status: record.status,
            to_status: record.status,
            actor: actor.to_string(),
            cause: TransitionCause::Submission.label(),
            accepted: true,
            version: Some(record.version),
            detail: record.abandonment_reason.clone(),
            recorded_at: now(),
        })
        .await;
    }

    async fn refused(
        &self,
        record: &ResponseRecord,
        target: ResponseStatus,
        actor: &str,
        cause: &TransitionCause,
        err: &Error,
    ) {
        let reason = match err {
            Error::IllegalTransition { reason, .. } => reason.clone(),
            other => other.to_string(),
        };

        tracing::warn!(
            response_id = %record.id,
            from = %record.status,
            to = %target,
            actor,
            cause = %cause,
            "Transition refused: {}",
            reason
        );

        self.audit(AuditEntry {
            response_id: record.id.clone(),
            from_status: record.status,
            to_status: target,
            actor: actor.to_string(),
            cause: cause.label(),
            accepted: false,
            version: Some(record.version),
            detail: Some(reason.clone()),
            recorded_at: now(),
        })
        .await;

        self.events.emit_lossy(FsrEvent::TransitionRejected {
            response_id: record.id.clone(),
            from: record.status,
            to: target,
            actor: actor.to_string(),
            reason,
            timestamp: now(),
        });
    }

    // An audit failure must not undo a committed status change
    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = audit::record_audit(&self.db, &entry).await {
            tracing::error!(
                response_id = %entry.response_id,
                "Failed to write status audit entry: {}",
                e
            );
        }
    }
}
