//! Database retry logic
//!
//! Two kinds of retry live here and they must not be confused:
//! - `retry_on_lock`: SQLite "database is locked". The same statement is
//!   re-run after a backoff, bounded by `database_max_lock_wait_ms`.
//! - `retry_on_conflict`: optimistic version mismatch. The closure is
//!   re-run from the top, so it must re-read the record and re-validate
//!   before it writes again. Bounded by an attempt count.

use fsr_common::{Error, Result};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};

const INITIAL_LOCK_BACKOFF_MS: u64 = 10;
const MAX_LOCK_BACKOFF_MS: u64 = 1000;

/// Read `database_max_lock_wait_ms` (default 5000)
pub async fn lock_wait_ms(pool: &SqlitePool) -> u64 {
    fsr_common::db::init::get_int_setting(pool, "database_max_lock_wait_ms", 5000)
        .await
        .map(|v| v.max(0) as u64)
        .unwrap_or(5000)
}

/// Read `cas_max_attempts` (default 5, never below 1)
pub async fn cas_max_attempts(pool: &SqlitePool) -> u32 {
    fsr_common::db::init::get_int_setting(pool, "cas_max_attempts", 5)
        .await
        .map(|v| v.clamp(1, 100) as u32)
        .unwrap_or(5)
}

fn is_lock_error(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => db_err.to_string().contains("database is locked"),
        _ => false,
    }
}

/// Retry a database operation with exponential backoff until `max_wait_ms` elapses
///
/// Backoff starts at 10ms and doubles up to 1000ms. Errors other than
/// "database is locked" are returned immediately.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_LOCK_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !is_lock_error(&err) => return Err(err),
            Err(_) => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database still locked, giving up"
                    );
                    return Err(Error::Internal(format!(
                        "{}: database locked after {} attempts ({} ms)",
                        operation_name,
                        attempt,
                        elapsed.as_millis()
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_LOCK_BACKOFF_MS);
            }
        }
    }
}

/// Re-run a read-validate-write closure while it loses version races
///
/// Only `ConcurrentModification` is retried. After `max_attempts` the last
/// conflict is returned to the caller.
pub async fn retry_on_conflict<F, Fut, T>(
    operation_name: &str,
    max_attempts: u32,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Err(err @ Error::ConcurrentModification { .. }) => {
                if attempt >= max_attempts {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        "Version conflict persisted, giving up: {}",
                        err
                    );
                    return Err(err);
                }
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    "Version conflict, re-reading: {}",
                    err
                );
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
