//! Manual review: reviewer decisions, reversion and abandonment
//!
//! When the caller supplies `expected_version` and the record has moved
//! on, the call fails with `ConcurrentModification` rather than being
//! retried: a human decided on what they saw, and what they saw is stale.

use crate::db::{audit, responses};
use crate::services::lifecycle::LifecycleGate;
use crate::services::status_machine::TransitionCause;
use fsr_common::api::{AuditEntry, StatusChangeResponse};
use fsr_common::time::now;
use fsr_common::{
    is_valid_abandonment_reason, DecisionKind, Error, ResponseRecord, ResponseStatus, Result,
    Verification,
};
use sqlx::SqlitePool;

pub struct ReviewService {
    db: SqlitePool,
    gate: LifecycleGate,
}

fn check_expected_version(record: &ResponseRecord, expected_version: Option<i64>) -> Result<()> {
    match expected_version {
        Some(expected) if expected != record.version => Err(Error::ConcurrentModification {
            response_id: record.id.clone(),
            expected_version: expected,
            actual_version: Some(record.version),
        }),
        _ => Ok(()),
    }
}

fn changed(record: ResponseRecord) -> StatusChangeResponse {
    StatusChangeResponse {
        id: record.id,
        status: record.status,
        version: record.version,
    }
}

impl ReviewService {
    pub fn new(db: SqlitePool, gate: LifecycleGate) -> Self {
        Self { db, gate }
    }

    /// Reviewer sets a status
    ///
    /// `Abandoned` is routed through `mark_abandoned` and needs `reason`.
    /// For Approved/Rejected the reason becomes the reviewer feedback.
    pub async fn set_status(
        &self,
        response_id: &str,
        target: ResponseStatus,
        actor: &str,
        reason: Option<&str>,
        expected_version: Option<i64>,
    ) -> Result<StatusChangeResponse> {
        if target == ResponseStatus::Abandoned {
            let reason = reason.ok_or_else(|| {
                Error::Validation("Abandoning a response requires a reason".into())
            })?;
            return self
                .mark_abandoned(response_id, actor, reason, expected_version)
                .await;
        }

        let mut record = responses::require_response(&self.db, response_id).await?;
        check_expected_version(&record, expected_version)?;

        if matches!(target, ResponseStatus::Approved | ResponseStatus::Rejected) {
            record.verification = Some(Verification {
                reviewer_id: actor.to_string(),
                reviewed_at: now(),
                decision_kind: DecisionKind::Manual,
                feedback: reason
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
            });
        }

        let updated = self
            .gate
            .apply(record, target, actor, TransitionCause::ManualReview)
            .await?;
        Ok(changed(updated))
    }

    /// Put an Approved/Rejected record back in front of reviewers
    ///
    /// The previous verification is cleared and the record leaves any QC
    /// batch, so it can be sampled again.
    pub async fn revert_to_pending(
        &self,
        response_id: &str,
        actor: &str,
        reason: &str,
        expected_version: Option<i64>,
    ) -> Result<StatusChangeResponse> {
        if reason.trim().is_empty() {
            return Err(Error::Validation("Reverting a decision requires a reason".into()));
        }

        let mut record = responses::require_response(&self.db, response_id).await?;
        check_expected_version(&record, expected_version)?;
        record.verification = None;

        let updated = self
            .gate
            .apply(
                record,
                ResponseStatus::PendingApproval,
                actor,
                TransitionCause::RevertToPending,
            )
            .await?;

        tracing::info!(response_id, actor, "Decision reverted: {}", reason.trim());
        Ok(changed(updated))
    }

    /// Mark a pending record abandoned with a real reason
    pub async fn mark_abandoned(
        &self,
        response_id: &str,
        actor: &str,
        reason: &str,
        expected_version: Option<i64>,
    ) -> Result<StatusChangeResponse> {
        if !is_valid_abandonment_reason(reason) {
            return Err(Error::Validation(format!(
                "'{}' is not a valid abandonment reason",
                reason
            )));
        }

        let mut record = responses::require_response(&self.db, response_id).await?;
        check_expected_version(&record, expected_version)?;
        record.abandonment_reason = Some(reason.trim().to_string());

        let updated = self
            .gate
            .apply(
                record,
                ResponseStatus::Abandoned,
                actor,
                TransitionCause::Abandonment,
            )
            .await?;
        Ok(changed(updated))
    }

    pub async fn get_record(&self, response_id: &str) -> Result<ResponseRecord> {
        responses::require_response(&self.db, response_id).await
    }

    pub async fn audit_trail(&self, response_id: &str) -> Result<Vec<AuditEntry>> {
        responses::require_response(&self.db, response_id).await?;
        audit::list_audit(&self.db, response_id).await
    }
}
