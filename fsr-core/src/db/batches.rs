//! QC batch persistence
//!
//! A batch row plus a member ledger. Claiming a record for a batch is a
//! guarded update on the record (pending, no reason, unbatched, unchanged
//! version) and the member insert, in one transaction.
//!
//! Applying a decision to a member is bracketed by the ledger: the member
//! is first taken `in_progress` by exactly one apply run, and only that run
//! may write its final outcome. Overlapping applies (the sweeper and an
//! operator, say) therefore never decide or record a member twice.

use crate::utils::db_retry::{lock_wait_ms, retry_on_lock};
use fsr_common::api::{QcBatchView, QcMemberView, RemainingDecision};
use fsr_common::time::{now, parse_db_timestamp, to_db_timestamp};
use fsr_common::{Error, ResponseRecord, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// An `in_progress` member older than this is assumed orphaned by a crashed
/// run and may be taken again
pub const APPLY_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Sampling,
    Applied,
    PartiallyApplied,
    Cleared,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Sampling => "sampling",
            BatchState::Applied => "applied",
            BatchState::PartiallyApplied => "partially_applied",
            BatchState::Cleared => "cleared",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "sampling" => Ok(BatchState::Sampling),
            "applied" => Ok(BatchState::Applied),
            "partially_applied" => Ok(BatchState::PartiallyApplied),
            "cleared" => Ok(BatchState::Cleared),
            other => Err(Error::Internal(format!("Unknown batch state: {}", other))),
        }
    }
}

/// What happened to one batch member when the decision was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    /// Taken by a running apply; not yet decided
    InProgress,
    Applied,
    Queued,
    Skipped,
    Failed,
}

impl MemberOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberOutcome::InProgress => "in_progress",
            MemberOutcome::Applied => "applied",
            MemberOutcome::Queued => "queued",
            MemberOutcome::Skipped => "skipped",
            MemberOutcome::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(MemberOutcome::InProgress),
            "applied" => Ok(MemberOutcome::Applied),
            "queued" => Ok(MemberOutcome::Queued),
            "skipped" => Ok(MemberOutcome::Skipped),
            "failed" => Ok(MemberOutcome::Failed),
            other => Err(Error::Internal(format!("Unknown member outcome: {}", other))),
        }
    }

    /// A settled member is never decided again
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            MemberOutcome::Applied | MemberOutcome::Queued | MemberOutcome::Skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub batch_id: String,
    pub survey_id: String,
    pub sample_size: i64,
    pub state: BatchState,
    pub remaining_decision: Option<RemainingDecision>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub response_id: String,
    pub is_sample: bool,
    pub outcome: Option<MemberOutcome>,
    pub detail: Option<String>,
}

impl MemberRow {
    pub fn is_settled(&self) -> bool {
        self.outcome.map(|o| o.is_settled()).unwrap_or(false)
    }
}

/// Insert a new batch in `sampling` state
pub async fn insert_batch(pool: &SqlitePool, batch: &BatchRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO qc_batches (batch_id, survey_id, sample_size, state, remaining_decision, created_by, created_at, applied_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(&batch.batch_id)
    .bind(&batch.survey_id)
    .bind(batch.sample_size)
    .bind(batch.state.as_str())
    .bind(batch.remaining_decision.map(|d| d.as_str()))
    .bind(&batch.created_by)
    .bind(to_db_timestamp(&batch.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_batch(pool: &SqlitePool, batch_id: &str) -> Result<Option<BatchRow>> {
    let row = sqlx::query(
        r#"
        SELECT batch_id, survey_id, sample_size, state, remaining_decision, created_by, created_at, applied_at
        FROM qc_batches
        WHERE batch_id = ?
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let state: String = row.try_get("state")?;
    let decision: Option<String> = row.try_get("remaining_decision")?;
    let created_at: String = row.try_get("created_at")?;
    let applied_at: Option<String> = row.try_get("applied_at")?;

    Ok(Some(BatchRow {
        batch_id: row.try_get("batch_id")?,
        survey_id: row.try_get("survey_id")?,
        sample_size: row.try_get("sample_size")?,
        state: BatchState::parse(&state)?,
        remaining_decision: decision.as_deref().and_then(RemainingDecision::parse),
        created_by: row.try_get("created_by")?,
        created_at: parse_db_timestamp(&created_at)?,
        applied_at: applied_at.as_deref().map(parse_db_timestamp).transpose()?,
    }))
}

pub async fn require_batch(pool: &SqlitePool, batch_id: &str) -> Result<BatchRow> {
    load_batch(pool, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("QC batch {}", batch_id)))
}

/// Claim `record` (as read) for a batch
///
/// Returns `false` when the record changed or became ineligible since it
/// was read; nothing is written in that case.
pub async fn claim_member(
    pool: &SqlitePool,
    batch_id: &str,
    record: &ResponseRecord,
    is_sample: bool,
) -> Result<bool> {
    let max_wait = lock_wait_ms(pool).await;
    let timestamp = to_db_timestamp(&now());
    let timestamp = &timestamp;

    retry_on_lock("claim batch member", max_wait, || async move {
        let mut tx = pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE responses
            SET qc_batch_id = ?, is_sample = ?, version = version + 1, updated_at = ?
            WHERE id = ?
              AND version = ?
              AND status = 'Pending_Approval'
              AND abandonment_reason IS NULL
              AND qc_batch_id IS NULL
            "#,
        )
        .bind(batch_id)
        .bind(is_sample)
        .bind(timestamp)
        .bind(&record.id)
        .bind(record.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO qc_batch_members (batch_id, response_id, is_sample, outcome, detail, updated_at)
            VALUES (?, ?, ?, NULL, NULL, ?)
            "#,
        )
        .bind(batch_id)
        .bind(&record.id)
        .bind(is_sample)
        .bind(timestamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok::<_, Error>(true)
    })
    .await
}

pub async fn list_members(pool: &SqlitePool, batch_id: &str) -> Result<Vec<MemberRow>> {
    let rows = sqlx::query(
        r#"
        SELECT response_id, is_sample, outcome, detail
        FROM qc_batch_members
        WHERE batch_id = ?
        ORDER BY is_sample DESC, response_id
        "#,
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let outcome: Option<String> = row.try_get("outcome")?;
            Ok(MemberRow {
                response_id: row.try_get("response_id")?,
                is_sample: row.try_get::<i64, _>("is_sample")? != 0,
                outcome: outcome.as_deref().map(MemberOutcome::parse).transpose()?,
                detail: row.try_get("detail")?,
            })
        })
        .collect()
}

/// Take an unsettled member for this apply run
///
/// Succeeds for a member with no outcome, a failed one, or one whose
/// `in_progress` lease has expired. Returns `false` when another run holds
/// it or it already settled.
pub async fn begin_member_apply(pool: &SqlitePool, batch_id: &str, response_id: &str) -> Result<bool> {
    let max_wait = lock_wait_ms(pool).await;
    let current = now();
    let timestamp = to_db_timestamp(&current);
    let timestamp = &timestamp;
    let stale_before = to_db_timestamp(&(current - chrono::Duration::seconds(APPLY_LEASE_SECS)));
    let stale_before = &stale_before;

    retry_on_lock("begin member apply", max_wait, || async move {
        let taken = sqlx::query(
            r#"
            UPDATE qc_batch_members
            SET outcome = 'in_progress', detail = NULL, updated_at = ?
            WHERE batch_id = ? AND response_id = ? AND is_sample = 0
              AND (outcome IS NULL
                   OR outcome = 'failed'
                   OR (outcome = 'in_progress' AND updated_at < ?))
            "#,
        )
        .bind(timestamp)
        .bind(batch_id)
        .bind(response_id)
        .bind(stale_before)
        .execute(pool)
        .await?
        .rows_affected();
        Ok::<_, Error>(taken > 0)
    })
    .await
}

/// Record the outcome of a member taken with `begin_member_apply`
///
/// Returns `false` if the member is no longer `in_progress` (its lease
/// expired and another run took it); the ledger is left untouched then.
pub async fn finish_member_apply(
    pool: &SqlitePool,
    batch_id: &str,
    response_id: &str,
    outcome: MemberOutcome,
    detail: Option<&str>,
) -> Result<bool> {
    if outcome == MemberOutcome::InProgress {
        return Err(Error::Internal(
            "in_progress is not a final member outcome".into(),
        ));
    }

    let max_wait = lock_wait_ms(pool).await;
    let timestamp = to_db_timestamp(&now());
    let timestamp = &timestamp;

    retry_on_lock("finish member apply", max_wait, || async move {
        let written = sqlx::query(
            r#"
            UPDATE qc_batch_members
            SET outcome = ?, detail = ?, updated_at = ?
            WHERE batch_id = ? AND response_id = ? AND outcome = 'in_progress'
            "#,
        )
        .bind(outcome.as_str())
        .bind(detail)
        .bind(timestamp)
        .bind(batch_id)
        .bind(response_id)
        .execute(pool)
        .await?
        .rows_affected();
        Ok::<_, Error>(written > 0)
    })
    .await
}

/// Record the remainder decision once; later calls keep the first one
pub async fn record_decision(
    pool: &SqlitePool,
    batch_id: &str,
    decision: RemainingDecision,
) -> Result<RemainingDecision> {
    sqlx::query(
        "UPDATE qc_batches SET remaining_decision = ? WHERE batch_id = ? AND remaining_decision IS NULL",
    )
    .bind(decision.as_str())
    .bind(batch_id)
    .execute(pool)
    .await?;

    let stored: Option<String> =
        sqlx::query_scalar("SELECT remaining_decision FROM qc_batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_one(pool)
            .await?;

    Ok(stored
        .as_deref()
        .and_then(RemainingDecision::parse)
        .unwrap_or(decision))
}

/// Move a batch to `state` unless it has been cleared
///
/// Returns `false` when the batch was cleared; a cleared batch stays
/// cleared.
pub async fn set_batch_state(
    pool: &SqlitePool,
    batch_id: &str,
    state: BatchState,
    applied_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE qc_batches
        SET state = ?, applied_at = COALESCE(?, applied_at)
        WHERE batch_id = ? AND state != 'cleared'
        "#,
    )
    .bind(state.as_str())
    .bind(applied_at.as_ref().map(to_db_timestamp))
    .bind(batch_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated > 0)
}

pub async fn mark_batch_cleared(pool: &SqlitePool, batch_id: &str) -> Result<()> {
    sqlx::query("UPDATE qc_batches SET state = 'cleared' WHERE batch_id = ?")
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Release every still-eligible record from a batch
///
/// Records that reached a final status keep their membership history.
/// Unsettled members of released records are marked skipped.
pub async fn release_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<String>> {
    let max_wait = lock_wait_ms(pool).await;
    let timestamp = to_db_timestamp(&now());
    let timestamp = &timestamp;

    retry_on_lock("release batch", max_wait, || async move {
        let mut tx = pool.begin().await?;

        let released: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE responses
            SET qc_batch_id = NULL, is_sample = 0, version = version + 1, updated_at = ?
            WHERE qc_batch_id = ?
              AND status = 'Pending_Approval'
              AND abandonment_reason IS NULL
            RETURNING id
            "#,
        )
        .bind(timestamp)
        .bind(batch_id)
        .fetch_all(&mut *tx)
        .await?;

        for response_id in &released {
            sqlx::query(
                r#"
                UPDATE qc_batch_members
                SET outcome = 'skipped', detail = 'released when batch was cleared', updated_at = ?
                WHERE batch_id = ? AND response_id = ? AND (outcome IS NULL OR outcome = 'failed')
                "#,
            )
            .bind(timestamp)
            .bind(batch_id)
            .bind(response_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok::<_, Error>(released)
    })
    .await
}

/// Batches the sweeper should look at
pub async fn list_open_batches(pool: &SqlitePool) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar(
        r#"
        SELECT batch_id FROM qc_batches
        WHERE state IN ('sampling', 'partially_applied')
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?)
}

/// Assemble the read model returned by the API
pub async fn batch_view(pool: &SqlitePool, batch_id: &str) -> Result<QcBatchView> {
    let batch = require_batch(pool, batch_id).await?;
    let members = list_members(pool, batch_id).await?;

    Ok(QcBatchView {
        batch_id: batch.batch_id,
        survey_id: batch.survey_id,
        sample_size: batch.sample_size.max(0) as usize,
        state: batch.state.as_str().to_string(),
        remaining_decision: batch.remaining_decision,
        created_by: batch.created_by,
        created_at: batch.created_at,
        applied_at: batch.applied_at,
        members: members
            .into_iter()
            .map(|m| QcMemberView {
                response_id: m.response_id,
                is_sample: m.is_sample,
                outcome: m.outcome.map(|o| o.as_str().to_string()),
                detail: m.detail,
            })
            .collect(),
    })
}
