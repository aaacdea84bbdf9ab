//! Persisted rate-limiter and speculation state.

use sqlx::SqlitePool;

use crate::error::Result;

/// The single rate-limiter state row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RateLimiterRow {
    pub tokens: f64,
    pub rate: f64,
    pub bucket_size: f64,
    pub last_congestion_rate: f64,
    pub last_used_at: f64,
    pub total_requests: i64,
    pub total_successes: i64,
    pub total_rate_limited: i64,
}

pub async fn get_rate_limiter_state(pool: &SqlitePool) -> Result<Option<RateLimiterRow>> {
    let row = sqlx::query_as::<_, RateLimiterRow>(
        "SELECT tokens, rate, bucket_size, last_congestion_rate, last_used_at,
                total_requests, total_successes, total_rate_limited
         FROM rate_limiter_state WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Write the full state row. Called on every rate adjustment.
pub async fn upsert_rate_limiter_state(pool: &SqlitePool, state: &RateLimiterRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO rate_limiter_state (
            id, tokens, rate, bucket_size, last_congestion_rate, last_used_at,
            total_requests, total_successes, total_rate_limited
         ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            tokens = excluded.tokens,
            rate = excluded.rate,
            bucket_size = excluded.bucket_size,
            last_congestion_rate = excluded.last_congestion_rate,
            last_used_at = excluded.last_used_at,
            total_requests = excluded.total_requests,
            total_successes = excluded.total_successes,
            total_rate_limited = excluded.total_rate_limited",
    )
    .bind(state.tokens)
    .bind(state.rate)
    .bind(state.bucket_size)
    .bind(state.last_congestion_rate)
    .bind(state.last_used_at)
    .bind(state.total_requests)
    .bind(state.total_successes)
    .bind(state.total_rate_limited)
    .execute(pool)
    .await?;
    Ok(())
}

/// One `speculation_state` row per speculative entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SpeculationRow {
    pub func_name: String,
    pub highest_successful_id: i64,
    pub consecutive_failures: i64,
    pub current_ceiling: i64,
    pub stopped: bool,
}

pub async fn save_speculation_state(pool: &SqlitePool, row: &SpeculationRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO speculation_state (
            func_name, highest_successful_id, consecutive_failures,
            current_ceiling, stopped
         ) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(func_name) DO UPDATE SET
            highest_successful_id = excluded.highest_successful_id,
            consecutive_failures = excluded.consecutive_failures,
            current_ceiling = excluded.current_ceiling,
            stopped = excluded.stopped",
    )
    .bind(&row.func_name)
    .bind(row.highest_successful_id)
    .bind(row.consecutive_failures)
    .bind(row.current_ceiling)
    .bind(row.stopped)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_speculation_states(pool: &SqlitePool) -> Result<Vec<SpeculationRow>> {
    let rows = sqlx::query_as::<_, SpeculationRow>("SELECT * FROM speculation_state")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
