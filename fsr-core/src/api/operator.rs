//! Operator attention queue endpoints

use crate::api::Actor;
use crate::db::operator_queue;
use crate::{ApiResult, AppState};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use fsr_common::api::{OperatorItem, ResolveItemRequest};

/// GET /api/operator/queue - open items, oldest first
pub async fn list_queue(State(state): State<AppState>) -> ApiResult<Json<Vec<OperatorItem>>> {
    Ok(Json(operator_queue::list_open_items(&state.db).await?))
}

/// POST /api/operator/queue/:item_id/resolve
pub async fn resolve_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    actor: Actor,
    Json(payload): Json<ResolveItemRequest>,
) -> ApiResult<Json<OperatorItem>> {
    let item =
        operator_queue::resolve_item(&state.db, &item_id, actor.as_str(), &payload.resolution)
            .await?;
    tracing::info!(
        item_id = %item.item_id,
        response_id = %item.response_id,
        actor = actor.as_str(),
        "Operator item resolved"
    );
    Ok(Json(item))
}

pub fn operator_routes() -> Router<AppState> {
    Router::new()
        .route("/api/operator/queue", get(list_queue))
        .route("/api/operator/queue/:item_id/resolve", post(resolve_item))
}
