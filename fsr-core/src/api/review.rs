//! Manual review endpoints

use crate::api::Actor;
use crate::{ApiResult, AppState};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use fsr_common::api::{
    AbandonRequest, AuditEntry, RevertRequest, SetStatusRequest, StatusChangeResponse,
};

/// POST /api/responses/:id/status
pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    Json(payload): Json<SetStatusRequest>,
) -> ApiResult<Json<StatusChangeResponse>> {
    let result = state
        .review
        .set_status(
            &id,
            payload.target,
            actor.as_str(),
            payload.reason.as_deref(),
            payload.expected_version,
        )
        .await?;
    Ok(Json(result))
}

/// POST /api/responses/:id/revert
pub async fn revert_to_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    Json(payload): Json<RevertRequest>,
) -> ApiResult<Json<StatusChangeResponse>> {
    let result = state
        .review
        .revert_to_pending(&id, actor.as_str(), &payload.reason, payload.expected_version)
        .await?;
    Ok(Json(result))
}

/// POST /api/responses/:id/abandon
pub async fn mark_abandoned(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    Json(payload): Json<AbandonRequest>,
) -> ApiResult<Json<StatusChangeResponse>> {
    let result = state
        .review
        .mark_abandoned(&id, actor.as_str(), &payload.reason, payload.expected_version)
        .await?;
    Ok(Json(result))
}

/// GET /api/responses/:id/audit
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.review.audit_trail(&id).await?))
}

pub fn review_routes() -> Router<AppState> {
    Router::new()
        .route("/api/responses/:id/status", post(set_status))
        .route("/api/responses/:id/revert", post(revert_to_pending))
        .route("/api/responses/:id/abandon", post(mark_abandoned))
        .route("/api/responses/:id/audit", get(audit_trail))
}
