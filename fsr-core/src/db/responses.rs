//! Record store: response persistence
//!
//! Every update is a compare-and-swap on `version` (and on `status`, so a
//! stale status can never be overwritten even if versions were reused).
//! Status only changes through a `StatusTransition`; a plain write keeps
//! the stored status as it was read.

use crate::services::status_machine::StatusTransition;
use crate::utils::db_retry::{lock_wait_ms, retry_on_lock};
use fsr_common::time::{parse_db_timestamp, to_db_timestamp};
use fsr_common::{
    normalize_abandonment_reason, AudioUploadStatus, Error, ResponseRecord, ResponseStatus,
    Result, SyncMetadata,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const SELECT_COLUMNS: &str = r#"
    SELECT id, survey_id, interviewer_id, status, abandonment_reason, answers,
           audio_attachment, audio_upload_status, needs_audio_retry, verification,
           qc_batch_id, is_sample, content_fingerprint, started_at, ended_at,
           metadata, version, created_at, updated_at
    FROM responses
"#;

/// Result of an insert attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already stored this (survey, interviewer, fingerprint)
    FingerprintExists,
}

fn record_from_row(row: &SqliteRow) -> Result<ResponseRecord> {
    let status: String = row.try_get("status")?;
    let upload_status: String = row.try_get("audio_upload_status")?;
    let answers: String = row.try_get("answers")?;
    let attachment: Option<String> = row.try_get("audio_attachment")?;
    let verification: Option<String> = row.try_get("verification")?;
    let metadata: String = row.try_get("metadata")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: String = row.try_get("ended_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ResponseRecord {
        id: row.try_get("id")?,
        survey_id: row.try_get("survey_id")?,
        interviewer_id: row.try_get("interviewer_id")?,
        status: status.parse()?,
        abandonment_reason: row.try_get("abandonment_reason")?,
        answers: serde_json::from_str(&answers)?,
        audio_attachment: attachment.as_deref().map(serde_json::from_str).transpose()?,
        sync_metadata: SyncMetadata {
            audio_upload_status: upload_status.parse()?,
            needs_audio_retry: row.try_get::<i64, _>("needs_audio_retry")? != 0,
        },
        verification: verification.as_deref().map(serde_json::from_str).transpose()?,
        qc_batch_ref: row.try_get("qc_batch_id")?,
        is_sample_response: row.try_get::<i64, _>("is_sample")? != 0,
        content_fingerprint: row.try_get("content_fingerprint")?,
        started_at: parse_db_timestamp(&started_at)?,
        ended_at: parse_db_timestamp(&ended_at)?,
        metadata: serde_json::from_str(&metadata)?,
        version: row.try_get("version")?,
        created_at: parse_db_timestamp(&created_at)?,
        updated_at: parse_db_timestamp(&updated_at)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Insert a new record at version 1
///
/// The stored abandonment reason is normalized; a valid reason on anything
/// but an `Abandoned` record is refused before it reaches SQLite.
pub async fn insert_response(pool: &SqlitePool, record: &ResponseRecord) -> Result<InsertOutcome> {
    let reason = normalize_abandonment_reason(record.abandonment_reason.as_deref());
    if reason.is_some() && record.status != ResponseStatus::Abandoned {
        return Err(Error::Internal(format!(
            "Refusing to store abandonment reason on {} record {}",
            record.status, record.id
        )));
    }

    let answers = serde_json::to_string(&record.answers)?;
    let attachment = record
        .audio_attachment
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let verification = record
        .verification
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let metadata = serde_json::to_string(&record.metadata)?;
    let (reason, answers, attachment, verification, metadata) =
        (&reason, &answers, &attachment, &verification, &metadata);
    let max_wait = lock_wait_ms(pool).await;

    let result = retry_on_lock("insert response", max_wait, || async move {
        sqlx::query(
            r#"
            INSERT INTO responses (
                id, survey_id, interviewer_id, status, abandonment_reason, answers,
                audio_attachment, audio_upload_status, needs_audio_retry, verification,
                qc_batch_id, is_sample, content_fingerprint, started_at, ended_at,
                metadata, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.survey_id)
        .bind(&record.interviewer_id)
        .bind(record.status.as_str())
        .bind(reason)
        .bind(answers)
        .bind(attachment)
        .bind(record.sync_metadata.audio_upload_status.as_str())
        .bind(record.sync_metadata.needs_audio_retry as i64)
        .bind(verification)
        .bind(&record.content_fingerprint)
        .bind(to_db_timestamp(&record.started_at))
        .bind(to_db_timestamp(&record.ended_at))
        .bind(metadata)
        .bind(to_db_timestamp(&record.created_at))
        .bind(to_db_timestamp(&record.updated_at))
        .execute(pool)
        .await
        .map_err(Error::from)
    })
    .await;

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(Error::Database(ref e)) if is_unique_violation(e) => Ok(InsertOutcome::FingerprintExists),
        Err(e) => Err(e),
    }
}

/// Load a record by id
pub async fn load_response(pool: &SqlitePool, id: &str) -> Result<Option<ResponseRecord>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Load a record by id, `NotFound` if absent
pub async fn require_response(pool: &SqlitePool, id: &str) -> Result<ResponseRecord> {
    load_response(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Response {}", id)))
}

/// Look up the record a submission fingerprint already resolved to
pub async fn find_by_fingerprint(
    pool: &SqlitePool,
    survey_id: &str,
    interviewer_id: &str,
    fingerprint: &str,
) -> Result<Option<ResponseRecord>> {
    let row = sqlx::query(&format!(
        "{} WHERE survey_id = ? AND interviewer_id = ? AND content_fingerprint = ?",
        SELECT_COLUMNS
    ))
    .bind(survey_id)
    .bind(interviewer_id)
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Records a QC batch may claim: pending, not abandoned, not already batched
pub async fn list_qc_candidates(pool: &SqlitePool, survey_id: &str) -> Result<Vec<ResponseRecord>> {
    let rows = sqlx::query(&format!(
        r#"{} WHERE survey_id = ?
              AND status = 'Pending_Approval'
              AND abandonment_reason IS NULL
              AND qc_batch_id IS NULL
            ORDER BY created_at, id"#,
        SELECT_COLUMNS
    ))
    .bind(survey_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Current version of a record, `None` if it does not exist
pub async fn current_version(pool: &SqlitePool, id: &str) -> Result<Option<i64>> {
    Ok(sqlx::query_scalar("SELECT version FROM responses WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

async fn conflict_or_missing(pool: &SqlitePool, id: &str, expected_version: i64) -> Error {
    match current_version(pool, id).await {
        Ok(None) => Error::NotFound(format!("Response {}", id)),
        Ok(actual) => Error::ConcurrentModification {
            response_id: id.to_string(),
            expected_version,
            actual_version: actual,
        },
        Err(e) => e,
    }
}

/// Write back a record that was read at `record.version`
///
/// With `transition = None` the status stays what it was read as. With a
/// transition, the transition must have been decided on this same record
/// and version. Answers, metadata, audio, sync metadata, verification and
/// the abandonment reason are written from `record`. QC membership is
/// never written here except for the release a revert implies.
///
/// Returns the new version.
pub async fn write_response(
    pool: &SqlitePool,
    record: &ResponseRecord,
    transition: Option<&StatusTransition>,
) -> Result<i64> {
    let new_status = match transition {
        Some(t) => {
            if t.response_id() != record.id
                || t.read_version() != record.version
                || t.from() != record.status
            {
                return Err(Error::Internal(format!(
                    "Transition for {}@{} does not match record {}@{}",
                    t.response_id(),
                    t.read_version(),
                    record.id,
                    record.version
                )));
            }
            t.to()
        }
        None => record.status,
    };

    let reason = normalize_abandonment_reason(record.abandonment_reason.as_deref());
    if reason.is_some() && new_status != ResponseStatus::Abandoned {
        return Err(Error::IllegalTransition {
            response_id: record.id.clone(),
            from: record.status,
            to: new_status,
            reason: "abandonment reason requires Abandoned status".to_string(),
        });
    }

    let release_batch = transition.map(|t| t.releases_batch()).unwrap_or(false);
    let answers = serde_json::to_string(&record.answers)?;
    let attachment = record
        .audio_attachment
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let verification = record
        .verification
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let metadata = serde_json::to_string(&record.metadata)?;
    let updated_at = to_db_timestamp(&fsr_common::time::now());
    let (reason, answers, attachment, verification, metadata, updated_at) = (
        &reason,
        &answers,
        &attachment,
        &verification,
        &metadata,
        &updated_at,
    );
    let max_wait = lock_wait_ms(pool).await;

    let rows = retry_on_lock("write response", max_wait, || async move {
        Ok::<_, Error>(sqlx::query(
            r#"
            UPDATE responses SET
                status = ?,
                abandonment_reason = ?,
                answers = ?,
                audio_attachment = ?,
                audio_upload_status = ?,
                needs_audio_retry = ?,
                verification = ?,
                metadata = ?,
                qc_batch_id = CASE WHEN ? THEN NULL ELSE qc_batch_id END,
                is_sample = CASE WHEN ? THEN 0 ELSE is_sample END,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND version = ? AND status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(reason)
        .bind(answers)
        .bind(attachment)
        .bind(record.sync_metadata.audio_upload_status.as_str())
        .bind(record.sync_metadata.needs_audio_retry as i64)
        .bind(verification)
        .bind(metadata)
        .bind(release_batch)
        .bind(release_batch)
        .bind(updated_at)
        .bind(&record.id)
        .bind(record.version)
        .bind(record.status.as_str())
        .execute(pool)
        .await?
        .rows_affected())
    })
    .await?;

    if rows == 0 {
        return Err(conflict_or_missing(pool, &record.id, record.version).await);
    }

    Ok(record.version + 1)
}

/// Update only the phase-2 bookkeeping of a record (audio attachment and
/// sync metadata), leaving status and answers alone
pub async fn write_audio_state(
    pool: &SqlitePool,
    record: &ResponseRecord,
    attachment: Option<&fsr_common::AudioAttachment>,
    upload_status: AudioUploadStatus,
    needs_retry: bool,
) -> Result<i64> {
    let mut updated = record.clone();
    updated.audio_attachment = attachment.cloned();
    updated.sync_metadata = SyncMetadata {
        audio_upload_status: upload_status,
        needs_audio_retry: needs_retry,
    };
    write_response(pool, &updated, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::status_machine::{transition, TransitionCause};
    use fsr_common::db::init::init_memory_database;
    use fsr_common::Answer;

    fn new_record(id: &str, fingerprint: &str) -> ResponseRecord {
        let now = fsr_common::time::now();
        ResponseRecord {
            id: id.into(),
            survey_id: "s1".into(),
            interviewer_id: "i1".into(),
            status: ResponseStatus::PendingApproval,
            abandonment_reason: None,
            answers: vec![Answer {
                question_id: "q1".into(),
                value: serde_json::json!("yes"),
                skipped: false,
            }],
            audio_attachment: None,
            sync_metadata: SyncMetadata::for_submission(true),
            verification: None,
            qc_batch_ref: None,
            is_sample_response: false,
            content_fingerprint: fingerprint.into(),
            started_at: now,
            ended_at: now,
            metadata: serde_json::json!({"device": "tab-3"}),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let pool = init_memory_database().await.unwrap();
        let record = new_record("r1", "fp1");
        assert_eq!(insert_response(&pool, &record).await.unwrap(), InsertOutcome::Inserted);

        let loaded = require_response(&pool, "r1").await.unwrap();
        assert_eq!(loaded.answers, record.answers);
        assert_eq!(loaded.metadata, record.metadata);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.sync_metadata.audio_upload_status, AudioUploadStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_reported() {
        let pool = init_memory_database().await.unwrap();
        insert_response(&pool, &new_record("r1", "fp1")).await.unwrap();
        let outcome = insert_response(&pool, &new_record("r2", "fp1")).await.unwrap();
        assert_eq!(outcome, InsertOutcome::FingerprintExists);

        let found = find_by_fingerprint(&pool, "s1", "i1", "fp1").await.unwrap().unwrap();
        assert_eq!(found.id, "r1");
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let pool = init_memory_database().await.unwrap();
        insert_response(&pool, &new_record("r1", "fp1")).await.unwrap();

        let first = require_response(&pool, "r1").await.unwrap();
        let second = first.clone();
        assert_eq!(write_response(&pool, &first, None).await.unwrap(), 2);

        match write_response(&pool, &second, None).await {
            Err(Error::ConcurrentModification { actual_version, .. }) => {
                assert_eq!(actual_version, Some(2))
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_to_missing_record_is_not_found() {
        let pool = init_memory_database().await.unwrap();
        let ghost = new_record("ghost", "fp");
        assert!(matches!(
            write_response(&pool, &ghost, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reason_without_transition_is_refused() {
        let pool = init_memory_database().await.unwrap();
        insert_response(&pool, &new_record("r1", "fp1")).await.unwrap();

        let mut record = require_response(&pool, "r1").await.unwrap();
        record.abandonment_reason = Some("Respondent refused".into());
        assert!(matches!(
            write_response(&pool, &record, None).await,
            Err(Error::IllegalTransition { .. })
        ));
        let stored = require_response(&pool, "r1").await.unwrap();
        assert_eq!(stored.abandonment_reason, None);
        assert_eq!(stored.status, ResponseStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_transition_applies_status() {
        let pool = init_memory_database().await.unwrap();
        insert_response(&pool, &new_record("r1", "fp1")).await.unwrap();

        let record = require_response(&pool, "r1").await.unwrap();
        let t = transition(&record, ResponseStatus::Approved, "rev", TransitionCause::ManualReview)
            .unwrap();
        write_response(&pool, &record, Some(&t)).await.unwrap();

        let stored = require_response(&pool, "r1").await.unwrap();
        assert_eq!(stored.status, ResponseStatus::Approved);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_mismatched_transition_is_refused() {
        let pool = init_memory_database().await.unwrap();
        insert_response(&pool, &new_record("r1", "fp1")).await.unwrap();

        let record = require_response(&pool, "r1").await.unwrap();
        let t = transition(&record, ResponseStatus::Approved, "rev", TransitionCause::ManualReview)
            .unwrap();
        let mut other = record.clone();
        other.version = 7;
        assert!(matches!(
            write_response(&pool, &other, Some(&t)).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_qc_candidates_exclude_final_and_batched() {
        let pool = init_memory_database().await.unwrap();
        for (id, fp) in [("r1", "a"), ("r2", "b"), ("r3", "c")] {
            insert_response(&pool, &new_record(id, fp)).await.unwrap();
        }
        let r2 = require_response(&pool, "r2").await.unwrap();
        let t = transition(&r2, ResponseStatus::Rejected, "rev", TransitionCause::ManualReview)
            .unwrap();
        write_response(&pool, &r2, Some(&t)).await.unwrap();
        sqlx::query("UPDATE responses SET qc_batch_id = 'qc-x' WHERE id = 'r3'")
            .execute(&pool)
            .await
            .unwrap();

        let candidates = list_qc_candidates(&pool, "s1").await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
    }
}
