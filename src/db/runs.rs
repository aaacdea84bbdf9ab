//! Run metadata: one row per driver run.

use sqlx::SqlitePool;

use super::now_ms;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub scraper_name: String,
    pub scraper_version: Option<String>,
    pub num_workers: i64,
    pub max_workers: i64,
    pub seed_invocations: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Insert the active run row. Called once at open.
pub async fn init_run(
    pool: &SqlitePool,
    scraper_name: &str,
    scraper_version: Option<&str>,
    num_workers: i64,
    max_workers: i64,
    seed_invocations: Option<&str>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO runs (
            scraper_name, scraper_version, num_workers, max_workers,
            seed_invocations, status, started_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)
         RETURNING id",
    )
    .bind(scraper_name)
    .bind(scraper_version)
    .bind(num_workers)
    .bind(max_workers)
    .bind(seed_invocations)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn set_run_status(pool: &SqlitePool, run_id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET status = ?2 WHERE id = ?1")
        .bind(run_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the run's final status and error, stamping `finished_at`.
pub async fn finalize_run(
    pool: &SqlitePool,
    run_id: i64,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE runs SET status = ?2, error = ?3, finished_at = ?4 WHERE id = ?1")
        .bind(run_id)
        .bind(status)
        .bind(error)
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_run(pool: &SqlitePool, run_id: i64) -> Result<Option<RunRecord>> {
    let row = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = ?1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Seed invocations stored by the earliest run, if any. A resumed run
/// reuses the original selection.
pub async fn stored_seed_invocations(pool: &SqlitePool) -> Result<Option<String>> {
    let row = sqlx::query_scalar::<_, Option<String>>(
        "SELECT seed_invocations FROM runs
         WHERE seed_invocations IS NOT NULL
         ORDER BY id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.flatten())
}
