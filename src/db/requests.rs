//! Queue operations on the `requests` table.
//!
//! The atomic dequeue is the contract everything else leans on: a single
//! `UPDATE ... RETURNING` claims the best pending row, so two workers can
//! never hold the same request.

use sqlx::{QueryBuilder, SqlitePool};

use super::{now_ms, Page};
use crate::error::Result;

/// Scheduling status of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Held,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Held => "held",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "in_progress" => Some(RequestStatus::InProgress),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            "held" => Some(RequestStatus::Held),
            _ => None,
        }
    }
}

/// A `requests` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestRecord {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub queue_counter: i64,
    pub request_type: String,
    pub method: String,
    pub url: String,
    pub headers_json: Option<String>,
    pub cookies_json: Option<String>,
    pub body: Option<Vec<u8>>,
    pub body_is_json: bool,
    pub continuation: String,
    pub current_location: Option<String>,
    pub accumulated_data_json: Option<String>,
    pub aux_data_json: Option<String>,
    pub permanent_json: Option<String>,
    pub expected_type: Option<String>,
    pub priority: i64,
    pub dedup_key: Option<String>,
    pub status: String,
    pub retry_count: i64,
    pub cumulative_backoff: f64,
    pub next_ready_at: Option<i64>,
    pub last_error: Option<String>,
    pub is_speculative: bool,
    pub speculation_id: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Serialized form of a request about to be inserted.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub parent_id: Option<i64>,
    pub queue_counter: i64,
    pub request_type: String,
    pub method: String,
    pub url: String,
    pub headers_json: Option<String>,
    pub cookies_json: Option<String>,
    pub body: Option<Vec<u8>>,
    pub body_is_json: bool,
    pub continuation: String,
    pub current_location: Option<String>,
    pub accumulated_data_json: Option<String>,
    pub aux_data_json: Option<String>,
    pub permanent_json: Option<String>,
    pub expected_type: Option<String>,
    pub priority: i64,
    pub dedup_key: Option<String>,
    pub is_speculative: bool,
    pub speculation_id: Option<String>,
}

/// Insert a pending request row.
///
/// Dedup is decided by the caller before this point; the unique index on
/// `dedup_key` is the backstop.
pub async fn insert_request(pool: &SqlitePool, new: &NewRequest) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO requests (
            parent_id, queue_counter, request_type, method, url,
            headers_json, cookies_json, body, body_is_json, continuation,
            current_location, accumulated_data_json, aux_data_json,
            permanent_json, expected_type, priority, dedup_key, status,
            is_speculative, speculation_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                   ?14, ?15, ?16, ?17, 'pending', ?18, ?19, ?20)
         RETURNING id",
    )
    .bind(new.parent_id)
    .bind(new.queue_counter)
    .bind(&new.request_type)
    .bind(&new.method)
    .bind(&new.url)
    .bind(&new.headers_json)
    .bind(&new.cookies_json)
    .bind(&new.body)
    .bind(new.body_is_json)
    .bind(&new.continuation)
    .bind(&new.current_location)
    .bind(&new.accumulated_data_json)
    .bind(&new.aux_data_json)
    .bind(&new.permanent_json)
    .bind(&new.expected_type)
    .bind(new.priority)
    .bind(&new.dedup_key)
    .bind(new.is_speculative)
    .bind(&new.speculation_id)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Whether any row already carries this dedup key.
pub async fn dedup_key_exists(pool: &SqlitePool, key: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM requests WHERE dedup_key = ?1)",
    )
    .bind(key)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Atomically claim the next pending request.
///
/// Picks the lowest `(priority, queue_counter)` among pending rows whose
/// `next_ready_at` is null or in the past, flips it to `in_progress`, stamps
/// `started_at`, and returns the row. One statement, one transaction.
pub async fn dequeue_next(pool: &SqlitePool) -> Result<Option<RequestRecord>> {
    let now = now_ms();
    let row = sqlx::query_as::<_, RequestRecord>(
        "UPDATE requests SET status = 'in_progress', started_at = ?1
         WHERE id = (
             SELECT id FROM requests
             WHERE status = 'pending'
               AND (next_ready_at IS NULL OR next_ready_at <= ?1)
             ORDER BY priority ASC, queue_counter ASC
             LIMIT 1
         )
         RETURNING *",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn get_request(pool: &SqlitePool, id: i64) -> Result<Option<RequestRecord>> {
    let row = sqlx::query_as::<_, RequestRecord>("SELECT * FROM requests WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn mark_completed(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE requests SET status = 'completed', finished_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE requests SET status = 'failed', last_error = ?2, finished_at = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(error)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Current `(retry_count, cumulative_backoff)` for a request.
pub async fn retry_state(pool: &SqlitePool, id: i64) -> Result<Option<(i64, f64)>> {
    let row = sqlx::query_as::<_, (i64, f64)>(
        "SELECT retry_count, cumulative_backoff FROM requests WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Return a request to pending with updated backoff tracking.
///
/// `next_ready_at` keeps the row invisible to the dequeue until the retry
/// delay has elapsed.
pub async fn schedule_retry(
    pool: &SqlitePool,
    id: i64,
    cumulative_backoff: f64,
    next_ready_at: i64,
    last_error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE requests
         SET status = 'pending', retry_count = retry_count + 1,
             cumulative_backoff = ?2, next_ready_at = ?3, last_error = ?4,
             started_at = NULL
         WHERE id = ?1",
    )
    .bind(id)
    .bind(cumulative_backoff)
    .bind(next_ready_at)
    .bind(last_error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Milliseconds until the earliest scheduled retry, if any is in the future.
pub async fn next_retry_delay_ms(pool: &SqlitePool) -> Result<Option<i64>> {
    let now = now_ms();
    let next = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MIN(next_ready_at) FROM requests
         WHERE status = 'pending' AND next_ready_at > ?1",
    )
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(next.map(|at| at - now))
}

pub async fn count_pending(pool: &SqlitePool) -> Result<i64> {
    let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM requests WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn count_in_progress(pool: &SqlitePool) -> Result<i64> {
    let n =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM requests WHERE status = 'in_progress'")
            .fetch_one(pool)
            .await?;
    Ok(n)
}

pub async fn has_any_requests(pool: &SqlitePool) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM requests)")
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

/// Highest allocated queue counter, for seeding the in-memory allocator.
pub async fn max_queue_counter(pool: &SqlitePool) -> Result<i64> {
    let max = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(queue_counter) FROM requests")
        .fetch_one(pool)
        .await?;
    Ok(max.unwrap_or(0))
}

/// Reset rows left `in_progress` by a previous unclean shutdown.
///
/// Called once at startup so interrupted work is resumed, not lost.
///
/// # Returns
/// The number of rows reset to pending.
pub async fn reset_in_progress(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE requests SET status = 'pending', started_at = NULL WHERE status = 'in_progress'",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// List requests with optional status/continuation filters.
pub async fn list_requests(
    pool: &SqlitePool,
    status: Option<RequestStatus>,
    continuation: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Page<RequestRecord>> {
    let mut query = QueryBuilder::new("SELECT * FROM requests WHERE 1 = 1");
    if let Some(status) = status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(continuation) = continuation {
        query.push(" AND continuation = ").push_bind(continuation);
    }
    query
        .push(" ORDER BY id ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let items = query
        .build_query_as::<RequestRecord>()
        .fetch_all(pool)
        .await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM requests WHERE 1 = 1");
    if let Some(status) = status {
        count.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(continuation) = continuation {
        count.push(" AND continuation = ").push_bind(continuation);
    }
    let total = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok(Page {
        items,
        total,
        offset,
        limit,
    })
}

/// Cancel a single request. Only pending and held rows can be cancelled;
/// in-flight work is never interrupted.
///
/// # Returns
/// `true` if the row transitioned to failed.
pub async fn cancel_request(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE requests
         SET status = 'failed', last_error = 'cancelled', finished_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'held')",
    )
    .bind(id)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Cancel every pending/held request for a continuation.
pub async fn cancel_by_continuation(pool: &SqlitePool, continuation: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE requests
         SET status = 'failed', last_error = 'cancelled', finished_at = ?2
         WHERE continuation = ?1 AND status IN ('pending', 'held')",
    )
    .bind(continuation)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Clone a request into a fresh pending row for the requeue workflow.
///
/// Retry counters reset, the dedup key is cleared (the clone must be allowed
/// to run again), and `parent_id` points at the originating row.
pub async fn clone_for_requeue(
    pool: &SqlitePool,
    id: i64,
    queue_counter: i64,
) -> Result<Option<i64>> {
    let new_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO requests (
            parent_id, queue_counter, request_type, method, url,
            headers_json, cookies_json, body, body_is_json, continuation,
            current_location, accumulated_data_json, aux_data_json,
            permanent_json, expected_type, priority, dedup_key, status,
            is_speculative, speculation_id, created_at
         )
         SELECT id, ?2, request_type, method, url,
                headers_json, cookies_json, body, body_is_json, continuation,
                current_location, accumulated_data_json, aux_data_json,
                permanent_json, expected_type, priority, NULL, 'pending',
                is_speculative, speculation_id, ?3
         FROM requests WHERE id = ?1
         RETURNING id",
    )
    .bind(id)
    .bind(queue_counter)
    .bind(now_ms())
    .fetch_optional(pool)
    .await?;

    Ok(new_id)
}
