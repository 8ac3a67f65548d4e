//! Operator attention queue
//!
//! Items are raised automatically and resolved only by a person. Raising
//! an item that is already open for the same record and kind returns the
//! open item instead of creating a second one.

use fsr_common::api::OperatorItem;
use fsr_common::ids::new_item_id;
use fsr_common::time::{now, parse_db_timestamp, to_db_timestamp};
use fsr_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Record said audio was uploaded, object storage disagreed
    EvidenceMissing,
    /// Client exhausted its phase-2 retries
    SyncStalled,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::EvidenceMissing => "evidence_missing",
            ItemKind::SyncStalled => "sync_stalled",
        }
    }
}

fn item_from_row(row: &SqliteRow) -> Result<OperatorItem> {
    let raised_at: String = row.try_get("raised_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    Ok(OperatorItem {
        item_id: row.try_get("item_id")?,
        response_id: row.try_get("response_id")?,
        kind: row.try_get("kind")?,
        detail: row.try_get("detail")?,
        raised_at: parse_db_timestamp(&raised_at)?,
        resolved_at: resolved_at.as_deref().map(parse_db_timestamp).transpose()?,
        resolved_by: row.try_get("resolved_by")?,
        resolution: row.try_get("resolution")?,
    })
}

/// Raise an item, or return the one already open
pub async fn raise_item(
    pool: &SqlitePool,
    response_id: &str,
    kind: ItemKind,
    detail: &str,
) -> Result<OperatorItem> {
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO operator_queue (item_id, response_id, kind, detail, raised_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_item_id())
    .bind(response_id)
    .bind(kind.as_str())
    .bind(detail)
    .bind(to_db_timestamp(&now()))
    .execute(pool)
    .await?
    .rows_affected();

    if inserted > 0 {
        tracing::warn!(
            response_id,
            kind = kind.as_str(),
            "Operator attention required: {}",
            detail
        );
    }

    let row = sqlx::query(
        r#"
        SELECT item_id, response_id, kind, detail, raised_at, resolved_at, resolved_by, resolution
        FROM operator_queue
        WHERE response_id = ? AND kind = ? AND resolved_at IS NULL
        "#,
    )
    .bind(response_id)
    .bind(kind.as_str())
    .fetch_one(pool)
    .await?;

    item_from_row(&row)
}

/// Open items, oldest first
pub async fn list_open_items(pool: &SqlitePool) -> Result<Vec<OperatorItem>> {
    let rows = sqlx::query(
        r#"
        SELECT item_id, response_id, kind, detail, raised_at, resolved_at, resolved_by, resolution
        FROM operator_queue
        WHERE resolved_at IS NULL
        ORDER BY raised_at, item_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Every item ever raised for one record
pub async fn list_items_for_response(
    pool: &SqlitePool,
    response_id: &str,
) -> Result<Vec<OperatorItem>> {
    let rows = sqlx::query(
        r#"
        SELECT item_id, response_id, kind, detail, raised_at, resolved_at, resolved_by, resolution
        FROM operator_queue
        WHERE response_id = ?
        ORDER BY raised_at, item_id
        "#,
    )
    .bind(response_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Resolve an open item by hand
pub async fn resolve_item(
    pool: &SqlitePool,
    item_id: &str,
    actor: &str,
    resolution: &str,
) -> Result<OperatorItem> {
    if resolution.trim().is_empty() {
        return Err(Error::Validation("Resolution must not be empty".into()));
    }

    let updated = sqlx::query(
        r#"
        UPDATE operator_queue
        SET resolved_at = ?, resolved_by = ?, resolution = ?
        WHERE item_id = ? AND resolved_at IS NULL
        "#,
    )
    .bind(to_db_timestamp(&now()))
    .bind(actor)
    .bind(resolution.trim())
    .bind(item_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(Error::NotFound(format!("Open operator item {}", item_id)));
    }

    let row = sqlx::query(
        r#"
        SELECT item_id, response_id, kind, detail, raised_at, resolved_at, resolved_by, resolution
        FROM operator_queue
        WHERE item_id = ?
        "#,
    )
    .bind(item_id)
    .fetch_one(pool)
    .await?;

    item_from_row(&row)
}
