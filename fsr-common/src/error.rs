//! Common error types for FSR
//!
//! One taxonomy is shared by the server and the sync client so that a
//! failure observed on one side can be reported faithfully on the other.
//! There is no duplicate-submission error: a duplicate resolves to the
//! existing record and is reported as `created = false`.

use crate::db::models::ResponseStatus;
use thiserror::Error;

/// Common result type for FSR operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across FSR crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode of a stored sub-object failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed payload; rejected immediately and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Status change refused by the lifecycle gate
    #[error("Illegal transition for {response_id}: {from} -> {to} ({reason})")]
    IllegalTransition {
        response_id: String,
        from: ResponseStatus,
        to: ResponseStatus,
        reason: String,
    },

    /// Optimistic version check failed; caller must re-read
    #[error(
        "Concurrent modification of {response_id}: expected version {expected_version}, found {actual_version:?}"
    )]
    ConcurrentModification {
        response_id: String,
        expected_version: i64,
        actual_version: Option<i64>,
    },

    /// Network or storage hiccup while transferring audio evidence
    #[error("Transient upload failure: {0}")]
    TransientUpload(String),

    /// Record claims audio was uploaded but object storage does not have it
    #[error("Evidence missing for {response_id}")]
    EvidenceMissing { response_id: String },

    /// Operation depends on work that has not happened yet (e.g. sample review)
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Local copy cannot be released until sync is verified complete
    #[error("Sync incomplete for {local_key}: {reason}")]
    SyncIncomplete { local_key: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientUpload(_) | Error::ConcurrentModification { .. } => true,
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }

    /// Stable machine-readable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Error::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Error::TransientUpload(_) => "TRANSIENT_UPLOAD_FAILURE",
            Error::EvidenceMissing { .. } => "EVIDENCE_MISSING",
            Error::NotReady(_) => "NOT_READY",
            Error::SyncIncomplete { .. } => "SYNC_INCOMPLETE",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
