//! fsr-core library interface
//!
//! Server side of the field-survey response lifecycle: record store,
//! lifecycle gate, two-phase sync reconciliation, attachment verification
//! and QC batches, exposed over HTTP.

pub mod api;
pub mod db;
pub mod error;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use chrono::{DateTime, Utc};
use fsr_common::config::TomlConfig;
use fsr_common::events::EventBus;
use services::{
    AttachmentVerifier, IdempotencyGuard, LifecycleGate, ObjectStore, QcBatchProcessor,
    ReviewService, SurveyCatalog, SyncReconciler,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub reconciler: Arc<SyncReconciler>,
    pub review: Arc<ReviewService>,
    pub qc: Arc<QcBatchProcessor>,
    pub max_audio_bytes: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last server-side failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire every service over one pool, bus and object store
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn SurveyCatalog>,
        config: &TomlConfig,
    ) -> Self {
        let gate = LifecycleGate::new(db.clone(), event_bus.clone());
        let guard = IdempotencyGuard::new(db.clone(), gate.clone(), catalog, event_bus.clone());
        let verifier = AttachmentVerifier::new(db.clone(), store.clone(), event_bus.clone());
        let reconciler = SyncReconciler::new(
            db.clone(),
            guard,
            verifier,
            store,
            event_bus.clone(),
            config.server.max_audio_bytes,
        );
        let review = ReviewService::new(db.clone(), gate.clone());
        let qc = QcBatchProcessor::new(
            db.clone(),
            gate,
            event_bus.clone(),
            config.qc.max_write_attempts,
        );

        Self {
            db,
            event_bus,
            reconciler: Arc::new(reconciler),
            review: Arc::new(review),
            qc: Arc::new(qc),
            max_audio_bytes: config.server.max_audio_bytes,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Remember the most recent 5xx for /health
async fn track_server_errors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let description = format!("{} {}", req.method(), req.uri().path());
    let response = next.run(req).await;
    if response.status().is_server_error() {
        *state.last_error.write().await = Some(format!(
            "{} returned {} at {}",
            description,
            response.status(),
            fsr_common::time::to_db_timestamp(&Utc::now())
        ));
    }
    response
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::response_routes(state.max_audio_bytes))
        .merge(api::review_routes())
        .merge(api::qc_routes())
        .merge(api::operator_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_server_errors,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
