//! Error tracking: capture, listing, and the resolve/requeue workflow.
//!
//! Every failed request leaves a row here with type-specific detail columns
//! so the UI surface can explain structural, validation and transient
//! failures without re-parsing messages.

use sqlx::{QueryBuilder, SqlitePool};

use super::{now_ms, Page};
use crate::error::{classify, ErrorKind, Result, ScrapeError, TransientError};

/// An `errors` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ErrorRecord {
    pub id: i64,
    pub request_id: Option<i64>,
    pub error_type: String,
    pub error_class: String,
    pub message: String,
    pub request_url: String,
    pub context_json: Option<String>,
    pub selector: Option<String>,
    pub selector_type: Option<String>,
    pub expected_min: Option<i64>,
    pub expected_max: Option<i64>,
    pub actual_count: Option<i64>,
    pub model_name: Option<String>,
    pub validation_errors_json: Option<String>,
    pub failed_doc_json: Option<String>,
    pub status_code: Option<i64>,
    pub timeout_seconds: Option<f64>,
    pub traceback: Option<String>,
    pub is_resolved: bool,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
    pub created_at: i64,
}

/// Store a classified error, extracting type-specific fields by downcast.
///
/// `traceback` is the full display chain of the error.
pub async fn store_error(
    pool: &SqlitePool,
    err: &anyhow::Error,
    request_id: Option<i64>,
    request_url: &str,
) -> Result<i64> {
    let kind = classify(err);
    let message = err.to_string();
    let traceback = format!("{err:?}");

    let mut error_class = "anyhow::Error".to_string();
    let mut context_json: Option<String> = None;
    let mut selector: Option<String> = None;
    let mut selector_type: Option<String> = None;
    let mut expected_min: Option<i64> = None;
    let mut expected_max: Option<i64> = None;
    let mut actual_count: Option<i64> = None;
    let mut model_name: Option<String> = None;
    let mut validation_errors_json: Option<String> = None;
    let mut failed_doc_json: Option<String> = None;
    let mut status_code: Option<i64> = None;
    let mut timeout_seconds: Option<f64> = None;

    if let Some(scrape) = err.downcast_ref::<ScrapeError>() {
        match scrape {
            ScrapeError::Structural(m) => {
                error_class = "ScrapeError::Structural".to_string();
                selector = Some(m.selector.clone());
                selector_type = Some(m.selector_type.as_str().to_string());
                expected_min = Some(i64::from(m.expected_min));
                expected_max = m.expected_max.map(i64::from);
                actual_count = Some(i64::from(m.actual_count));
                context_json = serde_json::to_string(m).ok();
            }
            ScrapeError::Validation(v) => {
                error_class = "ScrapeError::Validation".to_string();
                model_name = Some(v.model_name.clone());
                validation_errors_json = serde_json::to_string(&v.errors).ok();
                failed_doc_json = Some(v.failed_doc.to_string());
            }
            ScrapeError::Transient { detail, .. } => {
                error_class = "ScrapeError::Transient".to_string();
                match detail {
                    TransientError::HttpStatus(code) => status_code = Some(i64::from(*code)),
                    TransientError::Timeout { seconds } => timeout_seconds = Some(*seconds),
                }
            }
        }
    }

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO errors (
            request_id, error_type, error_class, message, request_url,
            context_json, selector, selector_type, expected_min, expected_max,
            actual_count, model_name, validation_errors_json, failed_doc_json,
            status_code, timeout_seconds, traceback, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                   ?14, ?15, ?16, ?17, ?18)
         RETURNING id",
    )
    .bind(request_id)
    .bind(kind.as_str())
    .bind(&error_class)
    .bind(&message)
    .bind(request_url)
    .bind(&context_json)
    .bind(&selector)
    .bind(&selector_type)
    .bind(expected_min)
    .bind(expected_max)
    .bind(actual_count)
    .bind(&model_name)
    .bind(&validation_errors_json)
    .bind(&failed_doc_json)
    .bind(status_code)
    .bind(timeout_seconds)
    .bind(&traceback)
    .bind(now_ms())
    .fetch_one(pool)
    .await?;

    Ok(id)
}

pub async fn get_error(pool: &SqlitePool, id: i64) -> Result<Option<ErrorRecord>> {
    let row = sqlx::query_as::<_, ErrorRecord>("SELECT * FROM errors WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// List errors with optional filters. The continuation filter joins through
/// the originating request.
pub async fn list_errors(
    pool: &SqlitePool,
    error_type: Option<ErrorKind>,
    continuation: Option<&str>,
    unresolved_only: bool,
    offset: i64,
    limit: i64,
) -> Result<Page<ErrorRecord>> {
    let mut query = QueryBuilder::new("SELECT e.* FROM errors e");
    if continuation.is_some() {
        query.push(" JOIN requests r ON e.request_id = r.id");
    }
    query.push(" WHERE 1 = 1");
    if let Some(kind) = error_type {
        query.push(" AND e.error_type = ").push_bind(kind.as_str());
    }
    if let Some(continuation) = continuation {
        query.push(" AND r.continuation = ").push_bind(continuation);
    }
    if unresolved_only {
        query.push(" AND e.is_resolved = 0");
    }
    query
        .push(" ORDER BY e.id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let items = query.build_query_as::<ErrorRecord>().fetch_all(pool).await?;

    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM errors e");
    if continuation.is_some() {
        count.push(" JOIN requests r ON e.request_id = r.id");
    }
    count.push(" WHERE 1 = 1");
    if let Some(kind) = error_type {
        count.push(" AND e.error_type = ").push_bind(kind.as_str());
    }
    if let Some(continuation) = continuation {
        count.push(" AND r.continuation = ").push_bind(continuation);
    }
    if unresolved_only {
        count.push(" AND e.is_resolved = 0");
    }
    let total = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    Ok(Page {
        items,
        total,
        offset,
        limit,
    })
}

pub async fn count_errors(
    pool: &SqlitePool,
    error_type: Option<ErrorKind>,
    unresolved_only: bool,
) -> Result<i64> {
    let mut count = QueryBuilder::new("SELECT COUNT(*) FROM errors WHERE 1 = 1");
    if let Some(kind) = error_type {
        count.push(" AND error_type = ").push_bind(kind.as_str());
    }
    if unresolved_only {
        count.push(" AND is_resolved = 0");
    }
    let n = count.build_query_scalar::<i64>().fetch_one(pool).await?;
    Ok(n)
}

/// Mark an error resolved.
///
/// # Returns
/// `true` if the error existed and was previously unresolved.
pub async fn resolve_error(pool: &SqlitePool, id: i64, notes: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE errors
         SET is_resolved = 1, resolved_at = ?2, resolution_notes = ?3
         WHERE id = ?1 AND is_resolved = 0",
    )
    .bind(id)
    .bind(now_ms())
    .bind(notes)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Unresolved errors of a type/continuation, oldest first, for batch requeue.
pub async fn unresolved_error_ids(
    pool: &SqlitePool,
    error_type: Option<ErrorKind>,
    continuation: Option<&str>,
) -> Result<Vec<i64>> {
    let mut query = QueryBuilder::new("SELECT e.id FROM errors e");
    if continuation.is_some() {
        query.push(" JOIN requests r ON e.request_id = r.id");
    }
    query.push(" WHERE e.is_resolved = 0 AND e.request_id IS NOT NULL");
    if let Some(kind) = error_type {
        query.push(" AND e.error_type = ").push_bind(kind.as_str());
    }
    if let Some(continuation) = continuation {
        query.push(" AND r.continuation = ").push_bind(continuation);
    }
    query.push(" ORDER BY e.id ASC");
    let ids = query.build_query_scalar::<i64>().fetch_all(pool).await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_pool;
    use crate::error::{SelectorKind, StructuralMismatch};

    #[tokio::test]
    async fn structural_errors_store_selector_fields() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();

        let err = anyhow::Error::new(ScrapeError::Structural(StructuralMismatch {
            selector: "//tr".into(),
            selector_type: SelectorKind::Xpath,
            description: "rows".into(),
            expected_min: 2,
            expected_max: Some(5),
            actual_count: 0,
            request_url: "http://x/t".into(),
        }));
        let id = store_error(&pool, &err, None, "http://x/t").await.unwrap();

        let record = get_error(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.error_type, "structural");
        assert_eq!(record.selector.as_deref(), Some("//tr"));
        assert_eq!(record.expected_min, Some(2));
        assert_eq!(record.expected_max, Some(5));
        assert_eq!(record.actual_count, Some(0));
        assert!(!record.is_resolved);
    }

    #[tokio::test]
    async fn transient_errors_store_status_code() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();

        let err = anyhow::Error::new(ScrapeError::http_status(429, "http://x/q"));
        let id = store_error(&pool, &err, None, "http://x/q").await.unwrap();

        let record = get_error(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.error_type, "transient");
        assert_eq!(record.status_code, Some(429));
    }

    #[tokio::test]
    async fn resolve_error_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();

        let err = anyhow::anyhow!("mystery");
        let id = store_error(&pool, &err, None, "http://x/").await.unwrap();

        assert!(resolve_error(&pool, id, Some("requeued")).await.unwrap());
        assert!(!resolve_error(&pool, id, None).await.unwrap());

        let record = get_error(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.error_type, "unknown");
        assert!(record.is_resolved);
        assert_eq!(record.resolution_notes.as_deref(), Some("requeued"));
    }

    #[tokio::test]
    async fn list_errors_filters_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();

        store_error(
            &pool,
            &anyhow::Error::new(ScrapeError::http_status(503, "http://x/a")),
            None,
            "http://x/a",
        )
        .await
        .unwrap();
        store_error(&pool, &anyhow::anyhow!("boom"), None, "http://x/b")
            .await
            .unwrap();

        let page = list_errors(&pool, Some(ErrorKind::Transient), None, true, 0, 50)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].error_type, "transient");

        assert_eq!(count_errors(&pool, None, true).await.unwrap(), 2);
    }
}
