//! Error types for fsr-core
//!
//! Every handler returns `ApiResult`; shared errors are mapped onto HTTP
//! status codes by their lifecycle meaning.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fsr_common::api::{ErrorBody, ErrorDetail};
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Mutating call without an actor identity (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// fsr-common error
    #[error(transparent)]
    Common(#[from] fsr_common::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        use fsr_common::Error as E;

        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Common(err) => match err {
                E::Validation(_) => StatusCode::BAD_REQUEST,
                E::NotFound(_) => StatusCode::NOT_FOUND,
                E::ConcurrentModification { .. } | E::NotReady(_) => StatusCode::CONFLICT,
                E::IllegalTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                E::TransientUpload(_) => StatusCode::SERVICE_UNAVAILABLE,
                E::EvidenceMissing { .. } => StatusCode::FAILED_DEPENDENCY,
                E::SyncIncomplete { .. } => StatusCode::CONFLICT,
                E::Database(_)
                | E::Io(_)
                | E::Serialization(_)
                | E::Config(_)
                | E::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Other(_) => "INTERNAL_ERROR",
            ApiError::Common(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        }

        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        });

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
