//! Database models
//!
//! `ResponseRecord` is the unit of work. Its `status` is only ever changed
//! through the lifecycle gate in `fsr-core`; the record store refuses to
//! write a status that did not come out of that gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Abandonment reasons that clients send when they really mean "none"
const PLACEHOLDER_REASONS: [&str; 3] = ["null", "undefined", "no reason specified"];

/// Whether an abandonment reason is real (non-blank and not a placeholder)
pub fn is_valid_abandonment_reason(reason: &str) -> bool {
    let trimmed = reason.trim();
    !trimmed.is_empty()
        && !PLACEHOLDER_REASONS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Collapse placeholder reasons to `None` so stored reasons are always valid
pub fn normalize_abandonment_reason(reason: Option<&str>) -> Option<String> {
    reason
        .filter(|r| is_valid_abandonment_reason(r))
        .map(|r| r.trim().to_string())
}

/// Lifecycle status of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "Pending_Approval")]
    PendingApproval,
    Approved,
    Rejected,
    Terminated,
    Abandoned,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::PendingApproval => "Pending_Approval",
            ResponseStatus::Approved => "Approved",
            ResponseStatus::Rejected => "Rejected",
            ResponseStatus::Terminated => "Terminated",
            ResponseStatus::Abandoned => "Abandoned",
        }
    }

    /// Final statuses admit no transition other than explicit reversion
    pub fn is_final(&self) -> bool {
        !matches!(self, ResponseStatus::PendingApproval)
    }

    /// Final statuses that even reversion cannot leave
    pub fn is_irreversible(&self) -> bool {
        matches!(self, ResponseStatus::Terminated | ResponseStatus::Abandoned)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending_Approval" => Ok(ResponseStatus::PendingApproval),
            "Approved" => Ok(ResponseStatus::Approved),
            "Rejected" => Ok(ResponseStatus::Rejected),
            "Terminated" => Ok(ResponseStatus::Terminated),
            "Abandoned" => Ok(ResponseStatus::Abandoned),
            other => Err(crate::Error::Validation(format!(
                "Unknown response status: {}",
                other
            ))),
        }
    }
}

/// One answered (or skipped) question, in interview order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub skipped: bool,
}

/// Audio evidence attached to a response
///
/// Every field is required on deserialization, so an empty placeholder
/// object can never be read back as an attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAttachment {
    pub url: String,
    pub format: String,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
}

impl AudioAttachment {
    pub fn new(
        url: impl Into<String>,
        format: impl Into<String>,
        duration_seconds: f64,
        file_size_bytes: u64,
    ) -> crate::Result<Self> {
        let url = url.into();
        let format = format.into();
        if url.trim().is_empty() {
            return Err(crate::Error::Validation("Audio url must not be empty".into()));
        }
        if format.trim().is_empty() {
            return Err(crate::Error::Validation("Audio format must not be empty".into()));
        }
        if !duration_seconds.is_finite() || duration_seconds < 0.0 {
            return Err(crate::Error::Validation(format!(
                "Invalid audio duration: {}",
                duration_seconds
            )));
        }
        if file_size_bytes == 0 {
            return Err(crate::Error::Validation("Audio file is empty".into()));
        }
        Ok(Self {
            url,
            format,
            duration_seconds,
            file_size_bytes,
        })
    }
}

/// Server-side view of the phase-2 leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioUploadStatus {
    None,
    Pending,
    Uploaded,
    Failed,
}

impl AudioUploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioUploadStatus::None => "none",
            AudioUploadStatus::Pending => "pending",
            AudioUploadStatus::Uploaded => "uploaded",
            AudioUploadStatus::Failed => "failed",
        }
    }
}

impl FromStr for AudioUploadStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AudioUploadStatus::None),
            "pending" => Ok(AudioUploadStatus::Pending),
            "uploaded" => Ok(AudioUploadStatus::Uploaded),
            "failed" => Ok(AudioUploadStatus::Failed),
            other => Err(crate::Error::Validation(format!(
                "Unknown audio upload status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub audio_upload_status: AudioUploadStatus,
    pub needs_audio_retry: bool,
}

impl SyncMetadata {
    pub fn for_submission(has_audio: bool) -> Self {
        Self {
            audio_upload_status: if has_audio {
                AudioUploadStatus::Pending
            } else {
                AudioUploadStatus::None
            },
            needs_audio_retry: false,
        }
    }
}

/// Who decided a review outcome, recorded at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionKind {
    Manual,
    AutoApproved,
    AutoRejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub reviewer_id: String,
    pub reviewed_at: DateTime<Utc>,
    pub decision_kind: DecisionKind,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// A survey response as held by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    pub survey_id: String,
    pub interviewer_id: String,
    pub status: ResponseStatus,
    pub abandonment_reason: Option<String>,
    pub answers: Vec<Answer>,
    pub audio_attachment: Option<AudioAttachment>,
    pub sync_metadata: SyncMetadata,
    pub verification: Option<Verification>,
    pub qc_batch_ref: Option<String>,
    pub is_sample_response: bool,
    pub content_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Free-form interview context (device, GPS fix, locale)
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResponseRecord {
    pub fn has_valid_abandonment(&self) -> bool {
        self.abandonment_reason
            .as_deref()
            .map(is_valid_abandonment_reason)
            .unwrap_or(false)
    }

    /// Pending and not abandoned: the only records QC may touch
    pub fn is_qc_eligible(&self) -> bool {
        self.status == ResponseStatus::PendingApproval && !self.has_valid_abandonment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_reasons_are_invalid() {
        assert!(!is_valid_abandonment_reason(""));
        assert!(!is_valid_abandonment_reason("   "));
        assert!(!is_valid_abandonment_reason("null"));
        assert!(!is_valid_abandonment_reason("undefined"));
        assert!(!is_valid_abandonment_reason("No reason specified"));
        assert!(!is_valid_abandonment_reason("NO REASON SPECIFIED"));
    }

    #[test]
    fn test_real_reason_is_valid() {
        assert!(is_valid_abandonment_reason("Respondent refused"));
        assert_eq!(
            normalize_abandonment_reason(Some("  Respondent refused ")),
            Some("Respondent refused".to_string())
        );
        assert_eq!(normalize_abandonment_reason(Some("null")), None);
        assert_eq!(normalize_abandonment_reason(None), None);
    }

    #[test]
    fn test_status_round_trips_through_wire_names() {
        for status in [
            ResponseStatus::PendingApproval,
            ResponseStatus::Approved,
            ResponseStatus::Rejected,
            ResponseStatus::Terminated,
            ResponseStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<ResponseStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_finality() {
        assert!(!ResponseStatus::PendingApproval.is_final());
        assert!(ResponseStatus::Approved.is_final());
        assert!(!ResponseStatus::Approved.is_irreversible());
        assert!(ResponseStatus::Abandoned.is_irreversible());
        assert!(ResponseStatus::Terminated.is_irreversible());
    }

    #[test]
    fn test_placeholder_attachment_does_not_deserialize() {
        let empty: Result<AudioAttachment, _> = serde_json::from_str("{}");
        assert!(empty.is_err());
        let partial: Result<AudioAttachment, _> =
            serde_json::from_str(r#"{"url":"objects/audio/r1","format":"m4a"}"#);
        assert!(partial.is_err());
    }

    #[test]
    fn test_attachment_constructor_rejects_empty_file() {
        assert!(AudioAttachment::new("objects/audio/r1", "m4a", 12.0, 0).is_err());
        assert!(AudioAttachment::new("", "m4a", 12.0, 10).is_err());
        assert!(AudioAttachment::new("objects/audio/r1", "m4a", f64::NAN, 10).is_err());
        assert!(AudioAttachment::new("objects/audio/r1", "m4a", 12.0, 10).is_ok());
    }

    #[test]
    fn test_decision_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&DecisionKind::AutoApproved).unwrap(),
            "\"autoApproved\""
        );
        assert_eq!(serde_json::to_string(&DecisionKind::Manual).unwrap(), "\"manual\"");
    }
}
