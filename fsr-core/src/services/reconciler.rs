//! Sync reconciler: the server side of two-phase sync
//!
//! Phase 1 (`submit_interview`) stores the response and returns its id.
//! Phase 2 (`upload_audio`) stores the recording and attaches it. The two
//! phases are independent: a failed upload never touches the status or
//! answers, and audio may arrive for a record in any status.

use crate::db::operator_queue::{self, ItemKind};
use crate::db::responses;
use crate::services::attachment_verifier::{audio_key, AttachmentVerifier};
use crate::services::idempotency::IdempotencyGuard;
use crate::services::object_store::ObjectStore;
use crate::utils::db_retry::{cas_max_attempts, retry_on_conflict};
use fsr_common::api::{
    OperatorItem, SubmitInterviewRequest, SubmitInterviewResponse, UploadAudioParams,
    UploadAudioResponse, VerifyAudioResponse,
};
use fsr_common::events::{EventBus, FsrEvent};
use fsr_common::time::now;
use fsr_common::{AudioAttachment, AudioUploadStatus, Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct SyncReconciler {
    db: SqlitePool,
    guard: IdempotencyGuard,
    verifier: AttachmentVerifier,
    store: Arc<dyn ObjectStore>,
    events: EventBus,
    max_audio_bytes: usize,
}

impl SyncReconciler {
    pub fn new(
        db: SqlitePool,
        guard: IdempotencyGuard,
        verifier: AttachmentVerifier,
        store: Arc<dyn ObjectStore>,
        events: EventBus,
        max_audio_bytes: usize,
    ) -> Self {
        Self {
            db,
            guard,
            verifier,
            store,
            events,
            max_audio_bytes,
        }
    }

    /// Phase 1
    pub async fn submit_interview(
        &self,
        req: &SubmitInterviewRequest,
        actor: &str,
    ) -> Result<SubmitInterviewResponse> {
        self.guard.submit(req, actor).await
    }

    /// Phase 2
    ///
    /// The attachment is written only after the object store acknowledged
    /// the full body.
    pub async fn upload_audio(
        &self,
        response_id: &str,
        params: &UploadAudioParams,
        body: &[u8],
        actor: &str,
    ) -> Result<UploadAudioResponse> {
        // 404 before any bytes are stored
        responses::require_response(&self.db, response_id).await?;

        if body.is_empty() {
            return Err(Error::Validation("Audio body is empty".into()));
        }
        if body.len() > self.max_audio_bytes {
            return Err(Error::Validation(format!(
                "Audio body of {} bytes exceeds limit of {}",
                body.len(),
                self.max_audio_bytes
            )));
        }
        if params.format.trim().is_empty() {
            return Err(Error::Validation("Audio format must not be empty".into()));
        }

        if let Some(expected) = params.expected_size_bytes {
            if expected != body.len() as u64 {
                let detail = format!(
                    "Received {} of {} expected audio bytes",
                    body.len(),
                    expected
                );
                self.mark_failed(response_id, &detail).await;
                return Err(Error::TransientUpload(detail));
            }
        }

        let key = audio_key(response_id);
        let ack = match self.store.put(&key, body).await {
            Ok(ack) => ack,
            Err(e) => {
                let detail = format!("Object store rejected audio: {}", e);
                self.mark_failed(response_id, &detail).await;
                return Err(match e {
                    Error::TransientUpload(_) => e,
                    other => Error::TransientUpload(other.to_string()),
                });
            }
        };

        let attachment = AudioAttachment::new(
            self.store.url_for(&ack.key),
            params.format.trim(),
            params.duration_seconds,
            ack.size_bytes,
        )?;

        let max_attempts = cas_max_attempts(&self.db).await;
        let attachment_ref = &attachment;
        let version = retry_on_conflict("attach audio", max_attempts, |_| async move {
            let current = responses::require_response(&self.db, response_id).await?;
            responses::write_audio_state(
                &self.db,
                &current,
                Some(attachment_ref),
                AudioUploadStatus::Uploaded,
                false,
            )
            .await
        })
        .await?;

        tracing::info!(
            response_id,
            actor,
            file_size_bytes = attachment.file_size_bytes,
            format = %attachment.format,
            version,
            "Audio attached"
        );
        self.events.emit_lossy(FsrEvent::AudioAttached {
            response_id: response_id.to_string(),
            file_size_bytes: attachment.file_size_bytes,
            timestamp: now(),
        });

        Ok(UploadAudioResponse {
            id: response_id.to_string(),
            ack: true,
            attachment,
            version,
        })
    }

    pub async fn verify_audio(&self, response_id: &str) -> Result<VerifyAudioResponse> {
        self.verifier.verify(response_id).await
    }

    /// Raised by a client that gave up on phase 2
    pub async fn report_sync_stalled(
        &self,
        response_id: &str,
        detail: &str,
        actor: &str,
    ) -> Result<OperatorItem> {
        responses::require_response(&self.db, response_id).await?;
        let detail = if detail.trim().is_empty() {
            "Client exhausted audio upload retries"
        } else {
            detail.trim()
        };

        tracing::error!(response_id, actor, "Sync stalled: {}", detail);
        let item =
            operator_queue::raise_item(&self.db, response_id, ItemKind::SyncStalled, detail).await?;
        self.events.emit_lossy(FsrEvent::SyncStalled {
            response_id: response_id.to_string(),
            detail: detail.to_string(),
            timestamp: now(),
        });
        Ok(item)
    }

    /// Record a failed phase-2 attempt
    ///
    /// An attachment that was already stored stays; a failed re-upload
    /// does not discard earlier evidence.
    async fn mark_failed(&self, response_id: &str, detail: &str) {
        tracing::warn!(response_id, "Audio upload failed: {}", detail);

        let max_attempts = cas_max_attempts(&self.db).await;
        let result = retry_on_conflict("mark audio failed", max_attempts, |_| async move {
            let current = responses::require_response(&self.db, response_id).await?;
            if current.audio_attachment.is_some() {
                return Ok(current.version);
            }
            responses::write_audio_state(&self.db, &current, None, AudioUploadStatus::Failed, true)
                .await
        })
        .await;

        if let Err(e) = result {
            tracing::error!(response_id, "Could not record failed upload: {}", e);
        }
    }
}
