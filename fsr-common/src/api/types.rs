//! Shared API request/response types
//!
//! Every mutating response says whether it created something or resolved
//! to something that already existed, so retrying clients can tell.

use crate::db::models::{Answer, AudioAttachment, ResponseStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ========================================
// Phase 1: submit interview
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitInterviewRequest {
    pub survey_id: String,
    pub interviewer_id: String,
    pub answers: Vec<Answer>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when the interviewer reports the interview as abandoned
    #[serde(default)]
    pub abandonment_reason: Option<String>,
    /// Whether audio evidence was captured and will follow in phase 2
    #[serde(default)]
    pub has_audio: bool,
    /// Device / GPS / locale context, stored verbatim
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitInterviewResponse {
    pub id: String,
    /// false when the payload matched an existing record
    pub created: bool,
    pub status: ResponseStatus,
    pub version: i64,
}

// ========================================
// Phase 2: attach audio
// ========================================

/// Query parameters accompanying the raw audio body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAudioParams {
    pub format: String,
    pub duration_seconds: f64,
    /// Size the client intended to send; a shorter body is a truncated upload
    #[serde(default)]
    pub expected_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAudioResponse {
    pub id: String,
    pub ack: bool,
    pub attachment: AudioAttachment,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyAudioResponse {
    pub id: String,
    /// Object storage currently holds the evidence
    pub exists: bool,
    /// The record claimed "uploaded" but the object was absent
    pub evidence_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStalledRequest {
    pub detail: String,
}

// ========================================
// Manual review
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub target: ResponseStatus,
    #[serde(default)]
    pub reason: Option<String>,
    /// Version the reviewer was looking at; stale versions are refused
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertRequest {
    pub reason: String,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonRequest {
    pub reason: String,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeResponse {
    pub id: String,
    pub status: ResponseStatus,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub response_id: String,
    pub from_status: ResponseStatus,
    pub to_status: ResponseStatus,
    pub actor: String,
    pub cause: String,
    pub accepted: bool,
    pub version: Option<i64>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ========================================
// QC batches
// ========================================

/// Decision derived from the sample and applied to the remainder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainingDecision {
    AutoApprove,
    AutoReject,
    QueueForReview,
}

impl RemainingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemainingDecision::AutoApprove => "auto_approve",
            RemainingDecision::AutoReject => "auto_reject",
            RemainingDecision::QueueForReview => "queue_for_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_approve" => Some(RemainingDecision::AutoApprove),
            "auto_reject" => Some(RemainingDecision::AutoReject),
            "queue_for_review" => Some(RemainingDecision::QueueForReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQcBatchRequest {
    pub survey_id: String,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQcBatchResponse {
    pub batch_id: String,
    pub sampled: Vec<String>,
    /// Members awaiting the derived decision
    pub remainder: Vec<String>,
    /// Members already decided (empty until the sample is reviewed)
    pub decided_remainder: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyQcBatchResponse {
    pub batch_id: String,
    pub decision: RemainingDecision,
    /// Members that received the decision in this or an earlier run
    pub decided_remainder: Vec<String>,
    /// Members left out because they stopped being eligible
    pub skipped: Vec<String>,
    /// Members whose write failed; a later apply retries only these
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcMemberView {
    pub response_id: String,
    pub is_sample: bool,
    pub outcome: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcBatchView {
    pub batch_id: String,
    pub survey_id: String,
    pub sample_size: usize,
    pub state: String,
    pub remaining_decision: Option<RemainingDecision>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub members: Vec<QcMemberView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearQcBatchResponse {
    pub batch_id: String,
    /// Members released back to the eligible pool
    pub released: Vec<String>,
}

// ========================================
// Operator queue
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorItem {
    pub item_id: String,
    pub response_id: String,
    pub kind: String,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveItemRequest {
    pub resolution: String,
}

// ========================================
// Error Response Types
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// JSON body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_defaults() {
        let req: SubmitInterviewRequest = serde_json::from_str(
            r#"{
                "survey_id": "s1",
                "interviewer_id": "i1",
                "answers": [{"question_id": "q1", "value": 3}],
                "started_at": "2026-05-01T10:00:00Z",
                "ended_at": "2026-05-01T10:20:00Z"
            }"#,
        )
        .unwrap();
        assert!(!req.has_audio);
        assert!(req.abandonment_reason.is_none());
        assert!(!req.answers[0].skipped);
        assert_eq!(req.metadata, Value::Null);
    }

    #[test]
    fn test_remaining_decision_names() {
        for decision in [
            RemainingDecision::AutoApprove,
            RemainingDecision::AutoReject,
            RemainingDecision::QueueForReview,
        ] {
            assert_eq!(RemainingDecision::parse(decision.as_str()), Some(decision));
            assert_eq!(
                serde_json::to_string(&decision).unwrap(),
                format!("\"{}\"", decision.as_str())
            );
        }
        assert_eq!(RemainingDecision::parse("maybe"), None);
    }
}
