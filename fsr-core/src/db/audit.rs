//! Status audit trail
//!
//! Append-only. Both accepted and refused transitions are recorded; the
//! trail is the history that `decision_kind` on the record does not keep.

use fsr_common::api::AuditEntry;
use fsr_common::time::{parse_db_timestamp, to_db_timestamp};
use fsr_common::Result;
use sqlx::{Row, SqlitePool};

pub async fn record_audit(pool: &SqlitePool, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO status_audit (response_id, from_status, to_status, actor, cause, accepted, version, detail, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.response_id)
    .bind(entry.from_status.as_str())
    .bind(entry.to_status.as_str())
    .bind(&entry.actor)
    .bind(&entry.cause)
    .bind(entry.accepted)
    .bind(entry.version)
    .bind(&entry.detail)
    .bind(to_db_timestamp(&entry.recorded_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Audit entries for one record in the order they were written
pub async fn list_audit(pool: &SqlitePool, response_id: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT response_id, from_status, to_status, actor, cause, accepted, version, detail, recorded_at
        FROM status_audit
        WHERE response_id = ?
        ORDER BY audit_id
        "#,
    )
    .bind(response_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let from: String = row.try_get("from_status")?;
            let to: String = row.try_get("to_status")?;
            let recorded_at: String = row.try_get("recorded_at")?;
            Ok(AuditEntry {
                response_id: row.try_get("response_id")?,
                from_status: from.parse()?,
                to_status: to.parse()?,
                actor: row.try_get("actor")?,
                cause: row.try_get("cause")?,
                accepted: row.try_get::<i64, _>("accepted")? != 0,
                version: row.try_get("version")?,
                detail: row.try_get("detail")?,
                recorded_at: parse_db_timestamp(&recorded_at)?,
            })
        })
        .collect()
}
