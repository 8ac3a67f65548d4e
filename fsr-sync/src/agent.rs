//! Two-phase sync agent
//!
//! Phase 1 sends the interview payload and learns the server id. Phase 2
//! uploads the recorded audio against that id and reads it back. A local
//! entry only reaches `Complete` after the read-back confirms the object,
//! and only a `Complete` entry may be purged from the device.

use crate::store::{AudioPhase, EntryState, LocalAudio, SyncEntry, SyncStore};
use crate::transport::SyncTransport;
use fsr_common::api::{SubmitInterviewRequest, UploadAudioParams};
use fsr_common::ids::new_local_key;
use fsr_common::retry::RetryPolicy;
use fsr_common::time::now;
use fsr_common::{Error, Result};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome counts of one `sync_all` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub completed: usize,
    pub awaiting_audio: usize,
    pub needs_attention: usize,
    pub rejected: usize,
    /// Entries left for the next pass because of a transient failure
    pub deferred: usize,
}

enum ReadBack {
    Confirmed,
    Missing(String),
}

pub struct SyncAgent<T: SyncTransport> {
    store: SyncStore,
    transport: T,
    policy: RetryPolicy,
}

impl<T: SyncTransport> SyncAgent<T> {
    pub fn new(store: SyncStore, transport: T, policy: RetryPolicy) -> Self {
        Self {
            store,
            transport,
            policy,
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue a captured interview for sync
    ///
    /// `has_audio` on the payload is derived from `audio` so the server
    /// expects exactly what the device will send.
    pub async fn enqueue(
        &self,
        mut payload: SubmitInterviewRequest,
        audio: Option<LocalAudio>,
    ) -> Result<SyncEntry> {
        if let Some(local) = &audio {
            if !tokio::fs::try_exists(&local.path).await.unwrap_or(false) {
                return Err(Error::Validation(format!(
                    "Audio file not found: {}",
                    local.path.display()
                )));
            }
            if local.format.trim().is_empty() {
                return Err(Error::Validation("Audio format must not be empty".into()));
            }
        }
        payload.has_audio = audio.is_some();

        let ts = now();
        let entry = SyncEntry {
            local_key: new_local_key(),
            payload,
            audio_phase: if audio.is_some() {
                AudioPhase::Pending
            } else {
                AudioPhase::NotRequired
            },
            audio,
            server_id: None,
            state: EntryState::Queued,
            needs_audio_retry: false,
            audio_attempts: 0,
            last_error: None,
            created_at: ts,
            updated_at: ts,
        };
        self.store.insert(&entry).await?;
        info!(
            "Queued interview {} (survey {}, audio: {})",
            entry.local_key,
            entry.payload.survey_id,
            entry.audio.is_some()
        );
        Ok(entry)
    }

    /// Drive one entry as far as it can go
    ///
    /// Returns the entry in its new state. `Err` means a transient failure
    /// left the entry where it was for a later pass.
    pub async fn sync_entry(&self, local_key: &str) -> Result<SyncEntry> {
        let mut entry = self.store.require(local_key).await?;
        if matches!(
            entry.state,
            EntryState::Complete | EntryState::NeedsAttention | EntryState::Rejected
        ) {
            return Ok(entry);
        }

        if entry.server_id.is_none() {
            match self.transport.submit_interview(&entry.payload).await {
                Ok(ack) => {
                    info!(
                        "Interview {} acknowledged as {} (created: {})",
                        entry.local_key, ack.id, ack.created
                    );
                    entry.server_id = Some(ack.id);
                    entry.state = if entry.audio.is_some() {
                        EntryState::AwaitingAudio
                    } else {
                        EntryState::Complete
                    };
                    entry.last_error = None;
                    self.store.save(&mut entry).await?;
                }
                Err(Error::Validation(msg)) => {
                    warn!("Server rejected interview {}: {}", entry.local_key, msg);
                    entry.state = EntryState::Rejected;
                    entry.last_error = Some(msg);
                    self.store.save(&mut entry).await?;
                    return Ok(entry);
                }
                Err(e) => {
                    debug!("Phase 1 for {} deferred: {}", entry.local_key, e);
                    entry.last_error = Some(e.to_string());
                    self.store.save(&mut entry).await?;
                    return Err(e);
                }
            }
        }

        if entry.state == EntryState::AwaitingAudio {
            self.sync_audio(&mut entry).await?;
        }
        Ok(entry)
    }

    async fn sync_audio(&self, entry: &mut SyncEntry) -> Result<()> {
        let (server_id, audio) = match (entry.server_id.clone(), entry.audio.clone()) {
            (Some(id), Some(audio)) => (id, audio),
            (Some(_), None) => {
                entry.state = EntryState::Complete;
                return self.store.save(entry).await;
            }
            (None, _) => {
                return Err(Error::Internal(format!(
                    "Entry {} has no server id for phase 2",
                    entry.local_key
                )))
            }
        };

        loop {
            // An upload acknowledged before a restart only needs its read-back
            if entry.audio_phase == AudioPhase::Uploaded {
                match self.read_back(entry, &server_id).await? {
                    ReadBack::Confirmed => return Ok(()),
                    ReadBack::Missing(detail) => {
                        entry.audio_phase = AudioPhase::Pending;
                        entry.needs_audio_retry = true;
                        entry.last_error = Some(detail);
                        self.store.save(entry).await?;
                    }
                }
            }

            if !self.policy.allows_another(entry.audio_attempts) {
                let detail = format!(
                    "audio upload gave up after {} attempts: {}",
                    entry.audio_attempts,
                    entry.last_error.as_deref().unwrap_or("unknown error")
                );
                return self.escalate(entry, &server_id, detail).await;
            }

            let attempt = entry.audio_attempts + 1;
            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before audio attempt {} for {}", delay, attempt, server_id);
                tokio::time::sleep(delay).await;
            }
            entry.audio_attempts = attempt;

            let bytes = match tokio::fs::read(&audio.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let detail = format!("local audio {} unreadable: {}", audio.path.display(), e);
                    return self.escalate(entry, &server_id, detail).await;
                }
            };
            let params = UploadAudioParams {
                format: audio.format.clone(),
                duration_seconds: audio.duration_seconds,
                expected_size_bytes: Some(bytes.len() as u64),
            };

            match self.transport.upload_audio(&server_id, &params, bytes).await {
                Ok(ack) => {
                    debug!(
                        "Audio for {} acknowledged ({} bytes, attempt {})",
                        server_id, ack.attachment.file_size_bytes, attempt
                    );
                    entry.audio_phase = AudioPhase::Uploaded;
                    self.store.save(entry).await?;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Audio upload attempt {} for {} failed: {}", attempt, server_id, e);
                    entry.needs_audio_retry = true;
                    entry.last_error = Some(e.to_string());
                    self.store.save(entry).await?;
                }
                Err(e @ (Error::Validation(_) | Error::NotFound(_))) => {
                    return self.escalate(entry, &server_id, e.to_string()).await;
                }
                Err(e) => {
                    entry.last_error = Some(e.to_string());
                    self.store.save(entry).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn read_back(&self, entry: &mut SyncEntry, server_id: &str) -> Result<ReadBack> {
        match self.transport.verify_audio(server_id).await {
            Ok(v) if v.exists => {
                info!("Audio for {} verified server-side", server_id);
                entry.audio_phase = AudioPhase::Verified;
                entry.state = EntryState::Complete;
                entry.needs_audio_retry = false;
                entry.last_error = None;
                self.store.save(entry).await?;
                Ok(ReadBack::Confirmed)
            }
            Ok(v) => {
                warn!(
                    "Audio for {} not found on read-back (evidence missing: {})",
                    server_id, v.evidence_missing
                );
                Ok(ReadBack::Missing("audio absent on read-back".to_string()))
            }
            Err(e @ Error::EvidenceMissing { .. }) => Ok(ReadBack::Missing(e.to_string())),
            Err(e) if e.is_retryable() => Ok(ReadBack::Missing(e.to_string())),
            Err(e) => {
                entry.last_error = Some(e.to_string());
                self.store.save(entry).await?;
                Err(e)
            }
        }
    }

    /// Park the entry and surface it to the operator queue
    async fn escalate(&self, entry: &mut SyncEntry, server_id: &str, detail: String) -> Result<()> {
        warn!("Sync of {} needs attention: {}", entry.local_key, detail);
        entry.state = EntryState::NeedsAttention;
        entry.needs_audio_retry = true;
        entry.last_error = Some(detail.clone());
        self.store.save(entry).await?;

        if let Err(e) = self.transport.report_sync_stalled(server_id, &detail).await {
            warn!("Could not report stalled sync for {}: {}", server_id, e);
        }
        Ok(())
    }

    /// One pass over every unfinished entry, oldest first
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for entry in self.store.list_unfinished().await? {
            report.attempted += 1;
            match self.sync_entry(&entry.local_key).await {
                Ok(done) => match done.state {
                    EntryState::Complete => report.completed += 1,
                    EntryState::NeedsAttention => report.needs_attention += 1,
                    EntryState::Rejected => report.rejected += 1,
                    EntryState::AwaitingAudio => report.awaiting_audio += 1,
                    EntryState::Queued => report.deferred += 1,
                },
                Err(e) => {
                    debug!("Entry {} deferred: {}", entry.local_key, e);
                    report.deferred += 1;
                }
            }
        }
        if report.attempted > 0 {
            info!(
                "Sync pass: {} attempted, {} complete, {} need attention, {} deferred",
                report.attempted, report.completed, report.needs_attention, report.deferred
            );
        }
        Ok(report)
    }

    /// Release local data for a fully synced entry
    pub async fn purge_local(&self, local_key: &str) -> Result<()> {
        let entry = self.store.require(local_key).await?;
        if let Some(reason) = entry.completion_blocker() {
            return Err(Error::SyncIncomplete {
                local_key: local_key.to_string(),
                reason,
            });
        }

        if let Some(audio) = &entry.audio {
            match tokio::fs::remove_file(&audio.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store.delete(local_key).await?;
        info!("Purged local copy of {}", local_key);
        Ok(())
    }

    /// Give a parked entry a fresh retry budget and sync it again
    pub async fn retry_stalled(&self, local_key: &str) -> Result<SyncEntry> {
        let mut entry = self.store.require(local_key).await?;
        if entry.state != EntryState::NeedsAttention {
            return Err(Error::Validation(format!(
                "Entry {} is {}, not needs_attention",
                local_key,
                entry.state.as_str()
            )));
        }

        entry.audio_attempts = 0;
        entry.state = if entry.server_id.is_some() {
            EntryState::AwaitingAudio
        } else {
            EntryState::Queued
        };
        if entry.audio_phase != AudioPhase::Verified && entry.audio.is_some() {
            entry.audio_phase = AudioPhase::Pending;
        }
        self.store.save(&mut entry).await?;
        info!("Retrying stalled entry {}", local_key);
        self.sync_entry(local_key).await
    }

    /// Sync on an interval until cancelled
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!("Sync agent started (interval {:?})", interval);
        loop {
            if let Err(e) = self.sync_all().await {
                warn!("Sync pass failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Sync agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use fsr_common::api::{SubmitInterviewResponse, UploadAudioResponse, VerifyAudioResponse};
    use fsr_common::{AudioAttachment, ResponseStatus};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays scripted upload and verify outcomes
    #[derive(Default)]
    struct ScriptedTransport {
        submit_errors: Mutex<VecDeque<Error>>,
        upload_errors: Mutex<VecDeque<Error>>,
        verify_missing: Mutex<u32>,
        uploads: Mutex<u32>,
        stalled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn submit_interview(
            &self,
            _req: &SubmitInterviewRequest,
        ) -> Result<SubmitInterviewResponse> {
            if let Some(e) = self.submit_errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            Ok(SubmitInterviewResponse {
                id: "srv-1".into(),
                created: true,
                status: ResponseStatus::PendingApproval,
                version: 1,
            })
        }

        async fn upload_audio(
            &self,
            response_id: &str,
            params: &UploadAudioParams,
            bytes: Vec<u8>,
        ) -> Result<UploadAudioResponse> {
            *self.uploads.lock().unwrap() += 1;
            if let Some(e) = self.upload_errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            Ok(UploadAudioResponse {
                id: response_id.into(),
                ack: true,
                attachment: AudioAttachment::new(
                    "memory://audio/srv-1",
                    params.format.clone(),
                    params.duration_seconds,
                    bytes.len() as u64,
                )?,
                version: 2,
            })
        }

        async fn verify_audio(&self, response_id: &str) -> Result<VerifyAudioResponse> {
            let mut missing = self.verify_missing.lock().unwrap();
            let exists = *missing == 0;
            if !exists {
                *missing -= 1;
            }
            Ok(VerifyAudioResponse {
                id: response_id.into(),
                exists,
                evidence_missing: false,
            })
        }

        async fn report_sync_stalled(&self, response_id: &str, detail: &str) -> Result<()> {
            self.stalled
                .lock()
                .unwrap()
                .push(format!("{}: {}", response_id, detail));
            Ok(())
        }
    }

    fn payload() -> SubmitInterviewRequest {
        let ts = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        SubmitInterviewRequest {
            survey_id: "s1".into(),
            interviewer_id: "i1".into(),
            answers: vec![],
            started_at: ts,
            ended_at: ts + chrono::Duration::minutes(12),
            abandonment_reason: None,
            has_audio: false,
            metadata: serde_json::Value::Null,
        }
    }

    fn audio_file(dir: &tempfile::TempDir) -> LocalAudio {
        let path = dir.path().join("interview.m4a");
        std::fs::write(&path, vec![7u8; 2048]).unwrap();
        LocalAudio {
            path,
            format: "m4a".into(),
            duration_seconds: 42.0,
        }
    }

    async fn agent(transport: ScriptedTransport, attempts: u32) -> SyncAgent<ScriptedTransport> {
        let store = SyncStore::open_memory().await.unwrap();
        SyncAgent::new(store, transport, RetryPolicy::immediate(attempts))
    }

    #[tokio::test]
    async fn test_interview_without_audio_completes_in_phase_one() {
        let agent = agent(ScriptedTransport::default(), 3).await;
        let entry = agent.enqueue(payload(), None).await.unwrap();
        assert!(!entry.payload.has_audio);

        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::Complete);
        assert!(synced.completion_blocker().is_none());
        agent.purge_local(&entry.local_key).await.unwrap();
        assert!(agent.store().load(&entry.local_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_retries_then_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::default();
        transport
            .upload_errors
            .lock()
            .unwrap()
            .extend([Error::TransientUpload("timeout".into()), Error::TransientUpload("reset".into())]);
        let agent = agent(transport, 5).await;

        let entry = agent.enqueue(payload(), Some(audio_file(&dir))).await.unwrap();
        assert!(entry.payload.has_audio);

        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::Complete);
        assert_eq!(synced.audio_phase, AudioPhase::Verified);
        assert_eq!(synced.audio_attempts, 3);
        assert!(!synced.needs_audio_retry);
        assert_eq!(*agent.transport().uploads.lock().unwrap(), 3);

        agent.purge_local(&entry.local_key).await.unwrap();
        assert!(!dir.path().join("interview.m4a").exists());
    }

    #[tokio::test]
    async fn test_missing_read_back_triggers_reupload() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::default();
        *transport.verify_missing.lock().unwrap() = 1;
        let agent = agent(transport, 5).await;

        let entry = agent.enqueue(payload(), Some(audio_file(&dir))).await.unwrap();
        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::Complete);
        assert_eq!(*agent.transport().uploads.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_and_block_purge() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::default();
        transport.upload_errors.lock().unwrap().extend(
            (0..3).map(|i| Error::TransientUpload(format!("failure {}", i))),
        );
        let agent = agent(transport, 3).await;

        let entry = agent.enqueue(payload(), Some(audio_file(&dir))).await.unwrap();
        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::NeedsAttention);
        assert!(synced.needs_audio_retry);
        assert_eq!(agent.transport().stalled.lock().unwrap().len(), 1);

        let err = agent.purge_local(&entry.local_key).await.unwrap_err();
        assert!(matches!(err, Error::SyncIncomplete { .. }));
        assert!(dir.path().join("interview.m4a").exists());

        // Operator asks for another round once the network is back
        let retried = agent.retry_stalled(&entry.local_key).await.unwrap();
        assert_eq!(retried.state, EntryState::Complete);
    }

    #[tokio::test]
    async fn test_phase_one_transient_failure_defers() {
        let transport = ScriptedTransport::default();
        transport
            .submit_errors
            .lock()
            .unwrap()
            .push_back(Error::TransientUpload("offline".into()));
        let agent = agent(transport, 3).await;
        let entry = agent.enqueue(payload(), None).await.unwrap();

        let report = agent.sync_all().await.unwrap();
        assert_eq!(report.deferred, 1);
        let stored = agent.store().require(&entry.local_key).await.unwrap();
        assert_eq!(stored.state, EntryState::Queued);
        assert!(stored.last_error.unwrap().contains("offline"));

        let report = agent.sync_all().await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected_not_retried() {
        let transport = ScriptedTransport::default();
        transport
            .submit_errors
            .lock()
            .unwrap()
            .push_back(Error::Validation("ended_at before started_at".into()));
        let agent = agent(transport, 3).await;
        let entry = agent.enqueue(payload(), None).await.unwrap();

        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::Rejected);
        assert!(agent.store().list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_requires_audio_file() {
        let agent = agent(ScriptedTransport::default(), 3).await;
        let missing = LocalAudio {
            path: "/nonexistent/fsr/audio.m4a".into(),
            format: "m4a".into(),
            duration_seconds: 1.0,
        };
        assert!(matches!(
            agent.enqueue(payload(), Some(missing)).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_local_audio_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(ScriptedTransport::default(), 3).await;
        let audio = audio_file(&dir);
        let entry = agent.enqueue(payload(), Some(audio.clone())).await.unwrap();
        std::fs::remove_file(&audio.path).unwrap();

        let synced = agent.sync_entry(&entry.local_key).await.unwrap();
        assert_eq!(synced.state, EntryState::NeedsAttention);
        assert!(synced.last_error.unwrap().contains("unreadable"));
    }
}
