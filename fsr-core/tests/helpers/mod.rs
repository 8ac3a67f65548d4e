//! Shared fixtures for fsr-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use fsr_common::api::SubmitInterviewRequest;
use fsr_common::config::TomlConfig;
use fsr_common::events::EventBus;
use fsr_common::{
    is_valid_abandonment_reason, Answer, AudioUploadStatus, ResponseRecord, ResponseStatus,
};
use fsr_core::services::object_store::ObjectAck;
use fsr_core::services::{MemoryObjectStore, ObjectStore, PermissiveCatalog, SurveyCatalog};
use fsr_core::AppState;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const ACTOR: &str = "device-17";
pub const REVIEWER: &str = "reviewer-7";

/// Object store that can fail uploads or lose objects on demand
#[derive(Default)]
pub struct FlakyObjectStore {
    inner: MemoryObjectStore,
    failing_puts: AtomicU32,
}

impl FlakyObjectStore {
    /// Make the next `n` puts fail with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Delete an object behind the record store's back
    pub async fn drop_object(&self, key: &str) -> bool {
        self.inner.remove(key).await
    }

    pub async fn object_count(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> fsr_common::Result<ObjectAck> {
        let remaining = self.failing_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(fsr_common::Error::TransientUpload(
                "injected storage timeout".into(),
            ));
        }
        self.inner.put(key, bytes).await
    }

    async fn exists(&self, key: &str) -> fsr_common::Result<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> fsr_common::Result<Vec<u8>> {
        self.inner.get(key).await
    }

    fn url_for(&self, key: &str) -> String {
        self.inner.url_for(key)
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<FlakyObjectStore>,
    pub events: EventBus,
    _dir: Option<TempDir>,
}

impl TestApp {
    pub fn db(&self) -> &SqlitePool {
        &self.state.db
    }

    pub fn router(&self) -> axum::Router {
        fsr_core::build_router(self.state.clone())
    }

    pub async fn record(&self, id: &str) -> ResponseRecord {
        self.state.review.get_record(id).await.unwrap()
    }

    /// Submit an interview and return its id
    pub async fn submit(&self, req: &SubmitInterviewRequest) -> String {
        self.state
            .reconciler
            .submit_interview(req, ACTOR)
            .await
            .unwrap()
            .id
    }
}

fn build(db: SqlitePool, dir: Option<TempDir>, catalog: Arc<dyn SurveyCatalog>) -> TestApp {
    let events = EventBus::new(100);
    let store = Arc::new(FlakyObjectStore::default());
    let mut config = TomlConfig::default();
    config.server.max_audio_bytes = 64 * 1024;
    let state = AppState::new(db, events.clone(), store.clone(), catalog, &config);
    TestApp {
        state,
        store,
        events,
        _dir: dir,
    }
}

/// App over an in-memory database
pub async fn memory_app() -> TestApp {
    let db = fsr_core::db::init_memory_database()
        .await
        .expect("Failed to create in-memory database");
    build(db, None, Arc::new(PermissiveCatalog))
}

/// App over a file database with a real connection pool, for concurrency
pub async fn file_app() -> TestApp {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db = fsr_core::db::init_database(&dir.path().join("fsr.db"))
        .await
        .expect("Failed to create database");
    build(db, Some(dir), Arc::new(PermissiveCatalog))
}

pub async fn memory_app_with_catalog(catalog: Arc<dyn SurveyCatalog>) -> TestApp {
    let db = fsr_core::db::init_memory_database()
        .await
        .expect("Failed to create in-memory database");
    build(db, None, catalog)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
}

/// Distinct interviews for the same interviewer differ by start minute
pub fn interview(survey_id: &str, interviewer_id: &str, minute: i64) -> SubmitInterviewRequest {
    let started_at = base_time() + chrono::Duration::minutes(minute);
    SubmitInterviewRequest {
        survey_id: survey_id.into(),
        interviewer_id: interviewer_id.into(),
        answers: vec![
            Answer {
                question_id: "q1".into(),
                value: json!("yes"),
                skipped: false,
            },
            Answer {
                question_id: "q2".into(),
                value: json!(4),
                skipped: false,
            },
        ],
        started_at,
        ended_at: started_at + chrono::Duration::minutes(20),
        abandonment_reason: None,
        has_audio: false,
        metadata: json!({"device": "tab-3"}),
    }
}

pub fn with_audio(mut req: SubmitInterviewRequest) -> SubmitInterviewRequest {
    req.has_audio = true;
    req
}

pub fn abandoned(mut req: SubmitInterviewRequest, reason: &str) -> SubmitInterviewRequest {
    req.abandonment_reason = Some(reason.into());
    req
}

pub fn json_request(method: &str, uri: &str, actor: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(actor) = actor {
        builder = builder.header("x-actor-id", actor);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, actor: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(actor) = actor {
        builder = builder.header("x-actor-id", actor);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn bytes_request(uri: &str, actor: &str, bytes: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-actor-id", actor)
        .header("content-type", "application/octet-stream")
        .body(Body::from(bytes))
        .unwrap()
}

/// Send one request through a fresh router and decode the JSON body
pub async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Record-level rules that must hold after any sequence of operations
pub async fn assert_record_invariants(app: &TestApp, id: &str) {
    let record = app.record(id).await;

    assert_eq!(
        record.status == ResponseStatus::Abandoned,
        record.has_valid_abandonment(),
        "abandonment reason and status disagree on {}: {:?} / {:?}",
        id,
        record.status,
        record.abandonment_reason
    );
    if let Some(reason) = &record.abandonment_reason {
        assert!(is_valid_abandonment_reason(reason), "placeholder reason stored on {}", id);
    }
    if record.sync_metadata.audio_upload_status == AudioUploadStatus::Uploaded {
        let attachment = record
            .audio_attachment
            .as_ref()
            .unwrap_or_else(|| panic!("{} uploaded without attachment", id));
        assert!(attachment.file_size_bytes > 0);
    }
    if matches!(record.status, ResponseStatus::Approved | ResponseStatus::Rejected) {
        assert!(record.verification.is_some(), "{} decided without verification", id);
    }
    assert!(record.version >= 1);
}
