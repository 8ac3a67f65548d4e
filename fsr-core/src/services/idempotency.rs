//! Idempotency guard for phase-1 submissions
//!
//! A submission is identified by a content fingerprint over who collected
//! it, for which survey, when, and what was answered. Resubmitting the
//! same content resolves to the record it created the first time:
//! - final record: nothing is written, the existing id comes back
//! - pending record: metadata and the abandonment reason are merged in
//! - no record: a new one is created
//!
//! Two concurrent first submissions race on the unique fingerprint index;
//! the loser re-reads and merges into the winner's record.

use crate::db::responses::{self, InsertOutcome};
use crate::services::lifecycle::LifecycleGate;
use crate::services::status_machine::{initial_status, TransitionCause};
use crate::services::survey_catalog::{validate_answers, SurveyCatalog};
use crate::utils::db_retry::{cas_max_attempts, retry_on_conflict};
use fsr_common::api::{SubmitInterviewRequest, SubmitInterviewResponse};
use fsr_common::events::{EventBus, FsrEvent};
use fsr_common::ids::new_response_id;
use fsr_common::time::{now, to_db_timestamp};
use fsr_common::{
    normalize_abandonment_reason, AudioUploadStatus, Error, ResponseRecord, ResponseStatus,
    Result, SyncMetadata,
};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;

/// SHA-256 over a canonical JSON rendering of the submission content
///
/// Object keys serialize in sorted order and timestamps at millisecond
/// precision, so the same interview hashes identically from any device.
pub fn compute_fingerprint(req: &SubmitInterviewRequest) -> Result<String> {
    let canonical = serde_json::json!({
        "survey_id": req.survey_id,
        "interviewer_id": req.interviewer_id,
        "started_at": to_db_timestamp(&req.started_at),
        "ended_at": to_db_timestamp(&req.ended_at),
        "answers": req.answers,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn validate_request(req: &SubmitInterviewRequest) -> Result<()> {
    if req.survey_id.trim().is_empty() {
        return Err(Error::Validation("survey_id must not be empty".into()));
    }
    if req.interviewer_id.trim().is_empty() {
        return Err(Error::Validation("interviewer_id must not be empty".into()));
    }
    if req.ended_at < req.started_at {
        return Err(Error::Validation(format!(
            "Interview ended ({}) before it started ({})",
            to_db_timestamp(&req.ended_at),
            to_db_timestamp(&req.started_at)
        )));
    }
    if !(req.metadata.is_null() || req.metadata.is_object()) {
        return Err(Error::Validation("metadata must be a JSON object".into()));
    }
    Ok(())
}

pub struct IdempotencyGuard {
    db: SqlitePool,
    gate: LifecycleGate,
    catalog: Arc<dyn SurveyCatalog>,
    events: EventBus,
}

impl IdempotencyGuard {
    pub fn new(
        db: SqlitePool,
        gate: LifecycleGate,
        catalog: Arc<dyn SurveyCatalog>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            gate,
            catalog,
            events,
        }
    }

    /// Resolve a phase-1 submission to exactly one record
    pub async fn submit(
        &self,
        req: &SubmitInterviewRequest,
        actor: &str,
    ) -> Result<SubmitInterviewResponse> {
        validate_request(req)?;
        let reason = normalize_abandonment_reason(req.abandonment_reason.as_deref());
        let questions = self.catalog.questions(&req.survey_id).await?;
        validate_answers(questions.as_deref(), &req.answers, reason.is_some())?;

        let fingerprint = compute_fingerprint(req)?;
        let max_attempts = cas_max_attempts(&self.db).await;
        let (fingerprint, reason) = (&fingerprint, reason.as_deref());

        retry_on_conflict("submit interview", max_attempts, |_| {
            self.submit_once(req, fingerprint, reason, actor)
        })
        .await
    }

    async fn submit_once(
        &self,
        req: &SubmitInterviewRequest,
        fingerprint: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<SubmitInterviewResponse> {
        if let Some(existing) = self.lookup(req, fingerprint).await? {
            return self.merge(existing, req, reason, actor).await;
        }

        let timestamp = now();
        let record = ResponseRecord {
            id: new_response_id(),
            survey_id: req.survey_id.clone(),
            interviewer_id: req.interviewer_id.clone(),
            status: initial_status(reason),
            abandonment_reason: reason.map(str::to_string),
            answers: req.answers.clone(),
            audio_attachment: None,
            sync_metadata: SyncMetadata::for_submission(req.has_audio),
            verification: None,
            qc_batch_ref: None,
            is_sample_response: false,
            content_fingerprint: fingerprint.to_string(),
            started_at: req.started_at,
            ended_at: req.ended_at,
            metadata: req.metadata.clone(),
            version: 1,
            created_at: timestamp,
            updated_at: timestamp,
        };

        match responses::insert_response(&self.db, &record).await? {
            InsertOutcome::Inserted => {
                tracing::info!(
                    response_id = %record.id,
                    survey_id = %record.survey_id,
                    interviewer_id = %record.interviewer_id,
                    status = %record.status,
                    "Response created"
                );
                self.gate.record_creation(&record, actor).await;
                self.announce(&record, true);
                Ok(SubmitInterviewResponse {
                    id: record.id,
                    created: true,
                    status: record.status,
                    version: record.version,
                })
            }
            InsertOutcome::FingerprintExists => {
                tracing::debug!(
                    fingerprint,
                    "Lost insert race on fingerprint, resolving to existing record"
                );
                let existing = self.lookup(req, fingerprint).await?.ok_or_else(|| {
                    Error::Internal(format!("Fingerprint {} conflicted but was not found", fingerprint))
                })?;
                self.merge(existing, req, reason, actor).await
            }
        }
    }

    async fn lookup(
        &self,
        req: &SubmitInterviewRequest,
        fingerprint: &str,
    ) -> Result<Option<ResponseRecord>> {
        responses::find_by_fingerprint(&self.db, &req.survey_id, &req.interviewer_id, fingerprint)
            .await
    }

    async fn merge(
        &self,
        existing: ResponseRecord,
        req: &SubmitInterviewRequest,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<SubmitInterviewResponse> {
        if existing.status.is_final() {
            tracing::debug!(
                response_id = %existing.id,
                status = %existing.status,
                "Duplicate submission of a final record, no change"
            );
            self.announce(&existing, false);
            return Ok(unchanged(existing));
        }

        let mut updated = existing.clone();
        if !req.metadata.is_null() {
            updated.metadata = req.metadata.clone();
        }
        if req.has_audio && updated.sync_metadata.audio_upload_status == AudioUploadStatus::None {
            updated.sync_metadata.audio_upload_status = AudioUploadStatus::Pending;
        }

        let result = match reason {
            Some(reason) => {
                updated.abandonment_reason = Some(reason.to_string());
                self.gate
                    .apply(updated, ResponseStatus::Abandoned, actor, TransitionCause::Abandonment)
                    .await?
            }
            None if updated == existing => {
                self.announce(&existing, false);
                return Ok(unchanged(existing));
            }
            None => {
                let version = responses::write_response(&self.db, &updated, None).await?;
                updated.version = version;
                updated
            }
        };

        tracing::info!(
            response_id = %result.id,
            status = %result.status,
            version = result.version,
            "Duplicate submission merged into pending record"
        );
        self.announce(&result, false);
        Ok(unchanged(result))
    }

    fn announce(&self, record: &ResponseRecord, created: bool) {
        self.events.emit_lossy(FsrEvent::ResponseSubmitted {
            response_id: record.id.clone(),
            survey_id: record.survey_id.clone(),
            created,
            timestamp: now(),
        });
    }
}

fn unchanged(record: ResponseRecord) -> SubmitInterviewResponse {
    SubmitInterviewResponse {
        id: record.id,
        created: false,
        status: record.status,
        version: record.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fsr_common::Answer;
    use serde_json::json;

    fn request() -> SubmitInterviewRequest {
        SubmitInterviewRequest {
            survey_id: "s1".into(),
            interviewer_id: "i1".into(),
            answers: vec![Answer {
                question_id: "q1".into(),
                value: json!("yes"),
                skipped: false,
            }],
            started_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 20, 0).unwrap(),
            abandonment_reason: None,
            has_audio: true,
            metadata: json!({"device": "tab-3"}),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = compute_fingerprint(&request()).unwrap();
        assert_eq!(a, compute_fingerprint(&request()).unwrap());
        assert_eq!(a.len(), 64);

        let mut changed = request();
        changed.answers[0].value = json!("no");
        assert_ne!(a, compute_fingerprint(&changed).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_metadata_and_reason() {
        let a = compute_fingerprint(&request()).unwrap();
        let mut other = request();
        other.metadata = json!({"device": "tab-9"});
        other.abandonment_reason = Some("Respondent refused".into());
        assert_eq!(a, compute_fingerprint(&other).unwrap());
    }

    #[test]
    fn test_request_validation() {
        let mut bad = request();
        bad.survey_id = " ".into();
        assert!(validate_request(&bad).is_err());

        let mut backwards = request();
        backwards.ended_at = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();
        assert!(validate_request(&backwards).is_err());

        let mut scalar_meta = request();
        scalar_meta.metadata = json!(5);
        assert!(validate_request(&scalar_meta).is_err());

        assert!(validate_request(&request()).is_ok());
    }
}
