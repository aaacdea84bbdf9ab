//! Storage for responses, results, archived files and estimates.

use sqlx::{QueryBuilder, SqlitePool};

use super::{now_ms, Page};
use crate::error::Result;

/// A stored response row. `content_compressed` is a raw zstd frame;
/// archive responses store no content (the file lives on disk).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResponseRecord {
    pub id: i64,
    pub request_id: i64,
    pub status_code: i64,
    pub headers_json: Option<String>,
    pub final_url: String,
    pub content_compressed: Option<Vec<u8>>,
    pub content_size_original: i64,
    pub content_size_compressed: i64,
    pub dict_id: Option<i64>,
    pub continuation: String,
    pub warc_record_id: String,
    pub speculation_outcome: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewResponse {
    pub request_id: i64,
    pub status_code: i64,
    pub headers_json: Option<String>,
    pub final_url: String,
    pub content_compressed: Option<Vec<u8>>,
    pub content_size_original: i64,
    pub content_size_compressed: i64,
    pub dict_id: Option<i64>,
    pub continuation: String,
    pub warc_record_id: String,
    pub speculation_outcome: Option<String>,
}

pub async fn store_response(pool: &SqlitePool, new: &NewResponse) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO responses (
            request_id, status_code, headers_json, final_url,
            content_compressed, content_size_original, content_size_compressed,
            dict_id, continuation, warc_record_id, speculation_outcome, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         RETURNING id",
    )
    .bind(new.request_id)
    .bind(new.status_code)
    .bind(&new.headers_json)
    .bind(&new.final_url)
    .bind(&new.content_compressed)
    .bind(new.content_size_original)
    .bind(new.content_size_compressed)
    .bind(new.dict_id)
    .bind(&new.continuation)
    .bind(&new.warc_record_id)
    .bind(&new.speculation_outcome)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_response(pool: &SqlitePool, id: i64) -> Result<Option<ResponseRecord>> {
    let row = sqlx::query_as::<_, ResponseRecord>("SELECT * FROM responses WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_responses(
    pool: &SqlitePool,
    continuation: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Page<ResponseRecord>> {
    let mut query = QueryBuilder::new("SELECT * FROM responses WHERE 1 = 1");
    if let Some(continuation) = continuation {
        query.push(" AND continuation = ").push_bind(continuation);
    }
    query
        .push(" ORDER BY id ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let items = query
        .build_query_as::<ResponseRecord>()
        .fetch_all(pool)
        .await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM responses WHERE 1 = 1");
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

/// Most recent original bodies stored for a continuation, for dictionary
/// training. Returns `(content_compressed, dict_id, content_size_original)`.
pub async fn recent_bodies_for_continuation(
    pool: &SqlitePool,
    continuation: &str,
    limit: i64,
) -> Result<Vec<(Vec<u8>, Option<i64>, i64)>> {
    let rows = sqlx::query_as::<_, (Vec<u8>, Option<i64>, i64)>(
        "SELECT content_compressed, dict_id, content_size_original
         FROM responses
         WHERE continuation = ?1 AND content_compressed IS NOT NULL
           AND content_size_original > 0
         ORDER BY id DESC LIMIT ?2",
    )
    .bind(continuation)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_responses_for_continuation(
    pool: &SqlitePool,
    continuation: &str,
) -> Result<i64> {
    let n = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM responses
         WHERE continuation = ?1 AND content_compressed IS NOT NULL",
    )
    .bind(continuation)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

// ── results ─────────────────────────────────────────────────────────────

/// A scraped result. Both valid and invalid results are persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResultRecord {
    pub id: i64,
    pub request_id: i64,
    pub result_type: String,
    pub data_json: String,
    pub is_valid: bool,
    pub validation_errors_json: Option<String>,
    pub created_at: i64,
}

pub async fn store_result(
    pool: &SqlitePool,
    request_id: i64,
    result_type: &str,
    data_json: &str,
    is_valid: bool,
    validation_errors_json: Option<&str>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO results (
            request_id, result_type, data_json, is_valid,
            validation_errors_json, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING id",
    )
    .bind(request_id)
    .bind(result_type)
    .bind(data_json)
    .bind(is_valid)
    .bind(validation_errors_json)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_result(pool: &SqlitePool, id: i64) -> Result<Option<ResultRecord>> {
    let row = sqlx::query_as::<_, ResultRecord>("SELECT * FROM results WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_results(
    pool: &SqlitePool,
    result_type: Option<&str>,
    is_valid: Option<bool>,
    offset: i64,
    limit: i64,
) -> Result<Page<ResultRecord>> {
    let mut query = QueryBuilder::new("SELECT * FROM results WHERE 1 = 1");
    if let Some(result_type) = result_type {
        query.push(" AND result_type = ").push_bind(result_type);
    }
    if let Some(is_valid) = is_valid {
        query.push(" AND is_valid = ").push_bind(is_valid);
    }
    query
        .push(" ORDER BY id ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let items = query.build_query_as::<ResultRecord>().fetch_all(pool).await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM results WHERE 1 = 1");
    if let Some(result_type) = result_type {
        count.push(" AND result_type = ").push_bind(result_type);
    }
    if let Some(is_valid) = is_valid {
        count.push(" AND is_valid = ").push_bind(is_valid);
    }
    let total = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok(Page {
        items,
        total,
        offset,
        limit,
    })
}

// ── archived files ──────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArchivedFileRecord {
    pub id: i64,
    pub request_id: i64,
    pub file_path: String,
    pub original_url: String,
    pub expected_type: Option<String>,
    pub file_size: i64,
    pub content_hash: Option<String>,
    pub created_at: i64,
}

pub async fn store_archived_file(
    pool: &SqlitePool,
    request_id: i64,
    file_path: &str,
    original_url: &str,
    expected_type: Option<&str>,
    file_size: i64,
    content_hash: Option<&str>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO archived_files (
            request_id, file_path, original_url, expected_type,
            file_size, content_hash, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id",
    )
    .bind(request_id)
    .bind(file_path)
    .bind(original_url)
    .bind(expected_type)
    .bind(file_size)
    .bind(content_hash)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn list_archived_files(pool: &SqlitePool) -> Result<Vec<ArchivedFileRecord>> {
    let rows =
        sqlx::query_as::<_, ArchivedFileRecord>("SELECT * FROM archived_files ORDER BY id ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

// ── estimates ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EstimateRecord {
    pub id: i64,
    pub request_id: i64,
    pub expected_types_json: String,
    pub min_count: i64,
    pub max_count: Option<i64>,
    pub created_at: i64,
}

pub async fn store_estimate(
    pool: &SqlitePool,
    request_id: i64,
    expected_types_json: &str,
    min_count: i64,
    max_count: Option<i64>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO estimates (request_id, expected_types_json, min_count, max_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id",
    )
    .bind(request_id)
    .bind(expected_types_json)
    .bind(min_count)
    .bind(max_count)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn list_estimates(pool: &SqlitePool) -> Result<Vec<EstimateRecord>> {
    let rows = sqlx::query_as::<_, EstimateRecord>("SELECT * FROM estimates ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
