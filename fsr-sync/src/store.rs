//! Local sync queue
//!
//! One row per captured interview. The row keeps the full phase-1 payload
//! and the path of the recorded audio so either phase can be retried
//! after a restart, and it is the only place that knows whether local
//! data may be released.

use chrono::{DateTime, Utc};
use fsr_common::api::SubmitInterviewRequest;
use fsr_common::time::{now, parse_db_timestamp, to_db_timestamp};
use fsr_common::{Error, Result};
use serde::Serialize;
use fsr_common::db::init::BUSY_TIMEOUT;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Phase 1 not yet acknowledged
    Queued,
    /// Phase 1 acknowledged, audio not yet verified
    AwaitingAudio,
    /// Everything acknowledged and verified; local data may be released
    Complete,
    /// Retry bound exhausted or local evidence unusable; reported upstream
    NeedsAttention,
    /// Server refused the payload as malformed; kept for inspection
    Rejected,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Queued => "queued",
            EntryState::AwaitingAudio => "awaiting_audio",
            EntryState::Complete => "complete",
            EntryState::NeedsAttention => "needs_attention",
            EntryState::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(EntryState::Queued),
            "awaiting_audio" => Ok(EntryState::AwaitingAudio),
            "complete" => Ok(EntryState::Complete),
            "needs_attention" => Ok(EntryState::NeedsAttention),
            "rejected" => Ok(EntryState::Rejected),
            other => Err(Error::Internal(format!("Unknown entry state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPhase {
    NotRequired,
    /// Not uploaded, or the last upload did not verify
    Pending,
    /// Server acknowledged the upload; read-back outstanding
    Uploaded,
    /// Read-back confirmed the object exists server-side
    Verified,
}

impl AudioPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioPhase::NotRequired => "not_required",
            AudioPhase::Pending => "pending",
            AudioPhase::Uploaded => "uploaded",
            AudioPhase::Verified => "verified",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "not_required" => Ok(AudioPhase::NotRequired),
            "pending" => Ok(AudioPhase::Pending),
            "uploaded" => Ok(AudioPhase::Uploaded),
            "verified" => Ok(AudioPhase::Verified),
            other => Err(Error::Internal(format!("Unknown audio phase: {}", other))),
        }
    }
}

/// Recorded audio waiting on the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalAudio {
    pub path: PathBuf,
    pub format: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEntry {
    pub local_key: String,
    pub payload: SubmitInterviewRequest,
    pub audio: Option<LocalAudio>,
    /// Id issued by the server in phase 1; the join point for phase 2
    pub server_id: Option<String>,
    pub state: EntryState,
    pub audio_phase: AudioPhase,
    pub needs_audio_retry: bool,
    pub audio_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncEntry {
    /// Why local data may not be released yet, `None` when it may
    pub fn completion_blocker(&self) -> Option<String> {
        if self.server_id.is_none() {
            return Some("interview not acknowledged by server".to_string());
        }
        if self.audio.is_some() && self.audio_phase != AudioPhase::Verified {
            return Some(format!(
                "audio {} but not verified server-side",
                self.audio_phase.as_str()
            ));
        }
        if self.state != EntryState::Complete {
            return Some(format!("entry is {}", self.state.as_str()));
        }
        None
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<SyncEntry> {
    let payload: String = row.try_get("payload")?;
    let audio_path: Option<String> = row.try_get("audio_path")?;
    let audio_format: Option<String> = row.try_get("audio_format")?;
    let audio_duration: Option<f64> = row.try_get("audio_duration_seconds")?;
    let state: String = row.try_get("state")?;
    let audio_phase: String = row.try_get("audio_phase")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let audio = match (audio_path, audio_format) {
        (Some(path), Some(format)) => Some(LocalAudio {
            path: PathBuf::from(path),
            format,
            duration_seconds: audio_duration.unwrap_or(0.0),
        }),
        _ => None,
    };

    Ok(SyncEntry {
        local_key: row.try_get("local_key")?,
        payload: serde_json::from_str(&payload)?,
        audio,
        server_id: row.try_get("server_id")?,
        state: EntryState::parse(&state)?,
        audio_phase: AudioPhase::parse(&audio_phase)?,
        needs_audio_retry: row.try_get::<i64, _>("needs_audio_retry")? != 0,
        audio_attempts: row.try_get::<i64, _>("audio_attempts")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
        created_at: parse_db_timestamp(&created_at)?,
        updated_at: parse_db_timestamp(&updated_at)?,
    })
}

const SELECT_COLUMNS: &str = r#"
    SELECT local_key, payload, audio_path, audio_format, audio_duration_seconds, server_id,
           state, audio_phase, needs_audio_retry, audio_attempts, last_error, created_at, updated_at
    FROM sync_queue
"#;

#[derive(Clone)]
pub struct SyncStore {
    db: SqlitePool,
}

impl SyncStore {
    /// Open (creating if needed) the queue database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { db };
        store.create_schema().await?;
        tracing::debug!("Opened sync queue: {}", path.display());
        Ok(store)
    }

    pub async fn open_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { db };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                local_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                audio_path TEXT,
                audio_format TEXT,
                audio_duration_seconds REAL,
                server_id TEXT,
                state TEXT NOT NULL,
                audio_phase TEXT NOT NULL,
                needs_audio_retry INTEGER NOT NULL DEFAULT 0,
                audio_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, entry: &SyncEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                local_key, payload, audio_path, audio_format, audio_duration_seconds, server_id,
                state, audio_phase, needs_audio_retry, audio_attempts, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.local_key)
        .bind(serde_json::to_string(&entry.payload)?)
        .bind(entry.audio.as_ref().map(|a| a.path.to_string_lossy().into_owned()))
        .bind(entry.audio.as_ref().map(|a| a.format.clone()))
        .bind(entry.audio.as_ref().map(|a| a.duration_seconds))
        .bind(&entry.server_id)
        .bind(entry.state.as_str())
        .bind(entry.audio_phase.as_str())
        .bind(entry.needs_audio_retry)
        .bind(entry.audio_attempts as i64)
        .bind(&entry.last_error)
        .bind(to_db_timestamp(&entry.created_at))
        .bind(to_db_timestamp(&entry.updated_at))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Persist the progress fields of an entry
    pub async fn save(&self, entry: &mut SyncEntry) -> Result<()> {
        entry.updated_at = now();
        let updated = sqlx::query(
            r#"
            UPDATE sync_queue SET
                server_id = ?, state = ?, audio_phase = ?, needs_audio_retry = ?,
                audio_attempts = ?, last_error = ?, updated_at = ?
            WHERE local_key = ?
            "#,
        )
        .bind(&entry.server_id)
        .bind(entry.state.as_str())
        .bind(entry.audio_phase.as_str())
        .bind(entry.needs_audio_retry)
        .bind(entry.audio_attempts as i64)
        .bind(&entry.last_error)
        .bind(to_db_timestamp(&entry.updated_at))
        .bind(&entry.local_key)
        .execute(&self.db)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::NotFound(format!("Sync entry {}", entry.local_key)));
        }
        Ok(())
    }

    pub async fn load(&self, local_key: &str) -> Result<Option<SyncEntry>> {
        let row = sqlx::query(&format!("{} WHERE local_key = ?", SELECT_COLUMNS))
            .bind(local_key)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn require(&self, local_key: &str) -> Result<SyncEntry> {
        self.load(local_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Sync entry {}", local_key)))
    }

    /// Entries a sync cycle should work on, oldest first
    pub async fn list_unfinished(&self) -> Result<Vec<SyncEntry>> {
        let rows = sqlx::query(&format!(
            "{} WHERE state IN ('queued', 'awaiting_audio') ORDER BY created_at, local_key",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<SyncEntry>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at, local_key", SELECT_COLUMNS))
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn delete(&self, local_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE local_key = ?")
            .bind(local_key)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
