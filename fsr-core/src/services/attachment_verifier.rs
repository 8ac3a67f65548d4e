//! Attachment verification
//!
//! The record store saying "uploaded" is not evidence; the object store
//! holding the bytes is. When the two disagree the record is corrected
//! (attachment withdrawn, upload marked failed and retryable) and an
//! operator item is raised. The record is never reported as verified.

use crate::db::operator_queue::{self, ItemKind};
use crate::db::responses;
use crate::services::object_store::ObjectStore;
use crate::utils::db_retry::{cas_max_attempts, retry_on_conflict};
use fsr_common::api::VerifyAudioResponse;
use fsr_common::events::{EventBus, FsrEvent};
use fsr_common::time::now;
use fsr_common::{AudioUploadStatus, ResponseRecord, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Object key holding a response's audio
pub fn audio_key(response_id: &str) -> String {
    format!("audio/{}", response_id)
}

pub struct AttachmentVerifier {
    db: SqlitePool,
    store: Arc<dyn ObjectStore>,
    events: EventBus,
}

impl AttachmentVerifier {
    pub fn new(db: SqlitePool, store: Arc<dyn ObjectStore>, events: EventBus) -> Self {
        Self { db, store, events }
    }

    /// Whether the object store holds audio for `response_id`
    pub async fn exists(&self, response_id: &str) -> Result<bool> {
        self.store.exists(&audio_key(response_id)).await
    }

    /// Check a record's claimed audio against the object store
    pub async fn verify(&self, response_id: &str) -> Result<VerifyAudioResponse> {
        let record = responses::require_response(&self.db, response_id).await?;
        let object_exists = self.exists(response_id).await?;

        let claims_audio = record.audio_attachment.is_some()
            || record.sync_metadata.audio_upload_status == AudioUploadStatus::Uploaded;

        if claims_audio && !object_exists {
            self.withdraw(record).await?;
            return Ok(VerifyAudioResponse {
                id: response_id.to_string(),
                exists: false,
                evidence_missing: true,
            });
        }

        Ok(VerifyAudioResponse {
            id: response_id.to_string(),
            exists: object_exists && record.audio_attachment.is_some(),
            evidence_missing: false,
        })
    }

    async fn withdraw(&self, record: ResponseRecord) -> Result<()> {
        tracing::error!(
            response_id = %record.id,
            status = %record.status,
            "Audio evidence missing from object storage"
        );

        let max_attempts = cas_max_attempts(&self.db).await;
        let id = record.id.as_str();
        let mut first = Some(record.clone());
        retry_on_conflict("withdraw audio attachment", max_attempts, |_| {
            let preloaded = first.take();
            async move {
                let current = match preloaded {
                    Some(r) => r,
                    None => responses::require_response(&self.db, id).await?,
                };
                if current.audio_attachment.is_none()
                    && current.sync_metadata.audio_upload_status == AudioUploadStatus::Failed
                {
                    return Ok(current.version);
                }
                responses::write_audio_state(
                    &self.db,
                    &current,
                    None,
                    AudioUploadStatus::Failed,
                    true,
                )
                .await
            }
        })
        .await?;

        operator_queue::raise_item(
            &self.db,
            id,
            ItemKind::EvidenceMissing,
            "Record claimed uploaded audio but the object store has no object",
        )
        .await?;

        self.events.emit_lossy(FsrEvent::EvidenceMissing {
            response_id: record.id.clone(),
            timestamp: now(),
        });
        Ok(())
    }
}
