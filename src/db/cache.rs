//! Request-fingerprint response cache.
//!
//! A cache hit short-circuits the HTTP fetch entirely: no token consumed,
//! no rate adjustment. Lookups are read-only.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::now_ms;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CachedResponseRecord {
    pub id: i64,
    pub cache_key: String,
    pub status_code: i64,
    pub headers_json: Option<String>,
    pub final_url: String,
    pub content_compressed: Option<Vec<u8>>,
    pub content_size_original: i64,
    pub dict_id: Option<i64>,
    pub created_at: i64,
}

/// Cache key: SHA-256 over method, URL, body (or empty) and the
/// sorted-headers JSON.
pub fn compute_cache_key(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    headers_json: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.unwrap_or_default());
    hasher.update(b"\n");
    hasher.update(headers_json.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn get_cached(pool: &SqlitePool, cache_key: &str) -> Result<Option<CachedResponseRecord>> {
    let row = sqlx::query_as::<_, CachedResponseRecord>(
        "SELECT * FROM cached_responses WHERE cache_key = ?1",
    )
    .bind(cache_key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert or replace a cached response.
pub async fn put_cached(
    pool: &SqlitePool,
    cache_key: &str,
    status_code: i64,
    headers_json: Option<&str>,
    final_url: &str,
    content_compressed: Option<&[u8]>,
    content_size_original: i64,
    dict_id: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cached_responses (
            cache_key, status_code, headers_json, final_url,
            content_compressed, content_size_original, dict_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(cache_key) DO UPDATE SET
            status_code = excluded.status_code,
            headers_json = excluded.headers_json,
            final_url = excluded.final_url,
            content_compressed = excluded.content_compressed,
            content_size_original = excluded.content_size_original,
            dict_id = excluded.dict_id,
            created_at = excluded.created_at",
    )
    .bind(cache_key)
    .bind(status_code)
    .bind(headers_json)
    .bind(final_url)
    .bind(content_compressed)
    .bind(content_size_original)
    .bind(dict_id)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}
