//! QC batch endpoints

use crate::api::Actor;
use crate::{ApiResult, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fsr_common::api::{
    ApplyQcBatchResponse, ClearQcBatchResponse, QcBatchView, RunQcBatchRequest,
    RunQcBatchResponse,
};

/// POST /api/qc/batches
pub async fn run_batch(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<RunQcBatchRequest>,
) -> ApiResult<(StatusCode, Json<RunQcBatchResponse>)> {
    let result = state
        .qc
        .run_batch(&payload.survey_id, payload.sample_size, actor.as_str())
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/qc/batches/:batch_id
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<QcBatchView>> {
    Ok(Json(state.qc.get_batch(&batch_id).await?))
}

/// POST /api/qc/batches/:batch_id/apply
///
/// 409 while sample responses still await review.
pub async fn apply_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    actor: Actor,
) -> ApiResult<Json<ApplyQcBatchResponse>> {
    Ok(Json(state.qc.apply_batch(&batch_id, actor.as_str()).await?))
}

/// POST /api/qc/batches/:batch_id/clear
pub async fn clear_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    actor: Actor,
) -> ApiResult<Json<ClearQcBatchResponse>> {
    Ok(Json(state.qc.clear_batch(&batch_id, actor.as_str()).await?))
}

pub fn qc_routes() -> Router<AppState> {
    Router::new()
        .route("/api/qc/batches", post(run_batch))
        .route("/api/qc/batches/:batch_id", get(get_batch))
        .route("/api/qc/batches/:batch_id/apply", post(apply_batch))
        .route("/api/qc/batches/:batch_id/clear", post(clear_batch))
}
