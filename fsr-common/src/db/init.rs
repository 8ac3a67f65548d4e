//! Database initialization
//!
//! Creates the schema on first run and is safe to call on every startup
//! (`CREATE TABLE IF NOT EXISTS` throughout). Settings missing from the
//! `settings` table are filled with defaults.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// SQLite busy wait applied to every pooled connection
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Applied to every connection the pool opens
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database with the full schema (tests, tooling)
///
/// A single connection is used because every `sqlite::memory:` connection
/// opens its own private database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create every server-side table and default setting
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_responses_table(pool).await?;
    create_qc_tables(pool).await?;
    create_operator_queue_table(pool).await?;
    create_status_audit_table(pool).await?;
    init_default_settings(pool).await?;
    Ok(())
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the responses table
///
/// The CHECK on `abandonment_reason` is a storage-level backstop: only
/// valid reasons are ever stored, and a stored reason forces `Abandoned`.
pub async fn create_responses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS responses (
            id TEXT PRIMARY KEY,
            survey_id TEXT NOT NULL,
            interviewer_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('Pending_Approval', 'Approved', 'Rejected', 'Terminated', 'Abandoned')),
            abandonment_reason TEXT,
            answers TEXT NOT NULL,
            audio_attachment TEXT,
            audio_upload_status TEXT NOT NULL DEFAULT 'none' CHECK (audio_upload_status IN ('none', 'pending', 'uploaded', 'failed')),
            needs_audio_retry INTEGER NOT NULL DEFAULT 0,
            verification TEXT,
            qc_batch_id TEXT,
            is_sample INTEGER NOT NULL DEFAULT 0,
            content_fingerprint TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT 'null',
            version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (survey_id, interviewer_id, content_fingerprint),
            CHECK (abandonment_reason IS NULL OR status = 'Abandoned')
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_responses_survey_status ON responses(survey_id, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_responses_batch ON responses(qc_batch_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the QC batch tables
///
/// `qc_batch_members` is the batch's own ledger of who was in it and what
/// happened to each member, independent of the records' current state.
pub async fn create_qc_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qc_batches (
            batch_id TEXT PRIMARY KEY,
            survey_id TEXT NOT NULL,
            sample_size INTEGER NOT NULL CHECK (sample_size >= 0),
            state TEXT NOT NULL CHECK (state IN ('sampling', 'applied', 'partially_applied', 'cleared')),
            remaining_decision TEXT CHECK (remaining_decision IS NULL OR remaining_decision IN ('auto_approve', 'auto_reject', 'queue_for_review')),
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            applied_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qc_batch_members (
            batch_id TEXT NOT NULL REFERENCES qc_batches(batch_id) ON DELETE CASCADE,
            response_id TEXT NOT NULL REFERENCES responses(id),
            is_sample INTEGER NOT NULL DEFAULT 0,
            outcome TEXT CHECK (outcome IS NULL OR outcome IN ('in_progress', 'applied', 'queued', 'skipped', 'failed')),
            detail TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (batch_id, response_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_qc_batches_survey ON qc_batches(survey_id, state)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the operator attention queue
///
/// At most one open item per (response, kind); resolution is manual only.
pub async fn create_operator_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operator_queue (
            item_id TEXT PRIMARY KEY,
            response_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('evidence_missing', 'sync_stalled')),
            detail TEXT NOT NULL,
            raised_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            resolution TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_operator_queue_open
        ON operator_queue(response_id, kind) WHERE resolved_at IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the status audit trail (accepted and rejected transitions)
pub async fn create_status_audit_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS status_audit (
            audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
            response_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            actor TEXT NOT NULL,
            cause TEXT NOT NULL,
            accepted INTEGER NOT NULL,
            version INTEGER,
            detail TEXT,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_status_audit_response ON status_audit(response_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or update default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Total time a write may spend retrying "database is locked"
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;
    // Re-read/re-validate/re-write rounds after a version conflict
    ensure_setting(pool, "cas_max_attempts", "5").await?;
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// A missing setting is created; a NULL value is reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE tolerates several instances initializing at once
    let inserted = sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?
        .rows_affected();

    if inserted > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let reset = sqlx::query("UPDATE settings SET value = ? WHERE key = ? AND value IS NULL")
        .bind(default_value)
        .bind(key)
        .execute(pool)
        .await?
        .rows_affected();

    if reset > 0 {
        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read an integer setting, falling back to `default` when absent or malformed
pub async fn get_int_setting(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value
        .flatten()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default))
}
