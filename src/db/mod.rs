//! SQLite storage layer: schema, connection lifecycle, and one module of
//! query functions per table family.
//!
//! All timestamps are Unix epoch milliseconds. JSON fields are UTF-8 text.
//! Stored bodies are raw zstd frames with an optional dictionary reference.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::Result;

pub mod cache;
pub mod errors;
pub mod requests;
pub mod responses;
pub mod runs;
pub mod state;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall-clock time in epoch seconds, fractional. Used by the rate
/// limiter's token accounting.
pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One page of a listing query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// Open (creating if missing) the database file and initialize the schema.
///
/// WAL journal mode for durability with concurrent readers; foreign keys
/// enforced; a busy timeout so overlapping writers queue instead of failing.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent schema creation.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scraper_name TEXT NOT NULL,
    scraper_version TEXT,
    num_workers INTEGER NOT NULL,
    max_workers INTEGER NOT NULL,
    seed_invocations TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER REFERENCES requests(id),
    queue_counter INTEGER NOT NULL,
    request_type TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers_json TEXT,
    cookies_json TEXT,
    body BLOB,
    body_is_json INTEGER NOT NULL DEFAULT 0,
    continuation TEXT NOT NULL,
    current_location TEXT,
    accumulated_data_json TEXT,
    aux_data_json TEXT,
    permanent_json TEXT,
    expected_type TEXT,
    priority INTEGER NOT NULL,
    dedup_key TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    cumulative_backoff REAL NOT NULL DEFAULT 0,
    next_ready_at INTEGER,
    last_error TEXT,
    is_speculative INTEGER NOT NULL DEFAULT 0,
    speculation_id TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_requests_dequeue
    ON requests(status, priority, queue_counter);
CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_dedup
    ON requests(dedup_key) WHERE dedup_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_requests_continuation
    ON requests(continuation, status);
CREATE INDEX IF NOT EXISTS idx_requests_speculation
    ON requests(is_speculative, speculation_id);
CREATE INDEX IF NOT EXISTS idx_requests_next_ready
    ON requests(next_ready_at);

CREATE TABLE IF NOT EXISTS responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    status_code INTEGER NOT NULL,
    headers_json TEXT,
    final_url TEXT NOT NULL,
    content_compressed BLOB,
    content_size_original INTEGER NOT NULL DEFAULT 0,
    content_size_compressed INTEGER NOT NULL DEFAULT 0,
    dict_id INTEGER REFERENCES compression_dicts(id),
    continuation TEXT NOT NULL,
    warc_record_id TEXT NOT NULL,
    speculation_outcome TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_responses_request ON responses(request_id);
CREATE INDEX IF NOT EXISTS idx_responses_continuation ON responses(continuation);

CREATE TABLE IF NOT EXISTS archived_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    file_path TEXT NOT NULL,
    original_url TEXT NOT NULL,
    expected_type TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archived_files_request ON archived_files(request_id);

CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    result_type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    validation_errors_json TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_type ON results(result_type, is_valid);
CREATE INDEX IF NOT EXISTS idx_results_request ON results(request_id);

CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER REFERENCES requests(id),
    error_type TEXT NOT NULL,
    error_class TEXT NOT NULL,
    message TEXT NOT NULL,
    request_url TEXT NOT NULL,
    context_json TEXT,
    selector TEXT,
    selector_type TEXT,
    expected_min INTEGER,
    expected_max INTEGER,
    actual_count INTEGER,
    model_name TEXT,
    validation_errors_json TEXT,
    failed_doc_json TEXT,
    status_code INTEGER,
    timeout_seconds REAL,
    traceback TEXT,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at INTEGER,
    resolution_notes TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_type ON errors(error_type, is_resolved);

CREATE TABLE IF NOT EXISTS estimates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    expected_types_json TEXT NOT NULL,
    min_count INTEGER NOT NULL,
    max_count INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cached_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_key TEXT NOT NULL UNIQUE,
    status_code INTEGER NOT NULL,
    headers_json TEXT,
    final_url TEXT NOT NULL,
    content_compressed BLOB,
    content_size_original INTEGER NOT NULL DEFAULT 0,
    dict_id INTEGER REFERENCES compression_dicts(id),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS compression_dicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    continuation TEXT NOT NULL,
    dict BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_compression_dicts_continuation
    ON compression_dicts(continuation);

CREATE TABLE IF NOT EXISTS rate_limiter_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    tokens REAL NOT NULL,
    rate REAL NOT NULL,
    bucket_size REAL NOT NULL,
    last_congestion_rate REAL NOT NULL,
    last_used_at REAL NOT NULL,
    total_requests INTEGER NOT NULL DEFAULT 0,
    total_successes INTEGER NOT NULL DEFAULT 0,
    total_rate_limited INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS speculation_state (
    func_name TEXT PRIMARY KEY,
    highest_successful_id INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    current_ceiling INTEGER NOT NULL DEFAULT 0,
    stopped INTEGER NOT NULL DEFAULT 0
);
"#;
