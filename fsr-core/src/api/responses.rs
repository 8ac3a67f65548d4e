//! Two-phase sync endpoints
//!
//! - POST /api/responses: phase 1, 201 when created, 200 when the
//!   fingerprint resolved to an existing record
//! - POST /api/responses/:id/audio: phase 2, raw audio body
//! - GET /api/responses/:id/audio/verify: read-back against object storage
//! - POST /api/responses/:id/sync-stalled: client gave up on phase 2

use crate::api::Actor;
use crate::{ApiResult, AppState};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fsr_common::api::{
    OperatorItem, SubmitInterviewRequest, SubmitInterviewResponse, SyncStalledRequest,
    UploadAudioParams, UploadAudioResponse, VerifyAudioResponse,
};
use fsr_common::ResponseRecord;

/// POST /api/responses
pub async fn submit_interview(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<SubmitInterviewRequest>,
) -> ApiResult<(StatusCode, Json<SubmitInterviewResponse>)> {
    let result = state
        .reconciler
        .submit_interview(&payload, actor.as_str())
        .await?;
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

/// GET /api/responses/:id
pub async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResponseRecord>> {
    Ok(Json(state.review.get_record(&id).await?))
}

/// POST /api/responses/:id/audio?format=&duration_seconds=&expected_size_bytes=
pub async fn upload_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UploadAudioParams>,
    actor: Actor,
    body: Bytes,
) -> ApiResult<Json<UploadAudioResponse>> {
    let result = state
        .reconciler
        .upload_audio(&id, &params, &body, actor.as_str())
        .await?;
    Ok(Json(result))
}

/// GET /api/responses/:id/audio/verify
pub async fn verify_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VerifyAudioResponse>> {
    Ok(Json(state.reconciler.verify_audio(&id).await?))
}

/// POST /api/responses/:id/sync-stalled
pub async fn report_sync_stalled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    Json(payload): Json<SyncStalledRequest>,
) -> ApiResult<(StatusCode, Json<OperatorItem>)> {
    let item = state
        .reconciler
        .report_sync_stalled(&id, &payload.detail, actor.as_str())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

/// Build response routes
///
/// The audio route gets its own body limit; every other route keeps the
/// axum default.
pub fn response_routes(max_audio_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/api/responses", post(submit_interview))
        .route("/api/responses/:id", get(get_record))
        .route(
            "/api/responses/:id/audio",
            post(upload_audio).layer(DefaultBodyLimit::max(max_audio_bytes)),
        )
        .route("/api/responses/:id/audio/verify", get(verify_audio))
        .route("/api/responses/:id/sync-stalled", post(report_sync_stalled))
}
