//! Adaptive Token Bucket rate limiter.
//!
//! Client-side rate adaptation: successes multiply the rate up (aggressively
//! below the last congestion level, conservatively at or above it), server
//! congestion signals halve it and drain the bucket. The full state row is
//! persisted on every adjustment so a resumed run picks up where the last
//! one left off.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::compression::DictRegistry;
use crate::config::AtbConfig;
use crate::db;
use crate::db::state::RateLimiterRow;
use crate::error::{is_transient_status, Result, ScrapeError};
use crate::http::RequestManager;
use crate::types::{Request, Response};

const MIN_INCREASE: f64 = 0.01;

#[derive(Debug, Clone)]
struct AtbState {
    tokens: f64,
    rate: f64,
    bucket_size: f64,
    last_congestion_rate: f64,
    last_used_at: f64,
    total_requests: i64,
    total_successes: i64,
    total_rate_limited: i64,
}

impl AtbState {
    fn row(&self) -> RateLimiterRow {
        RateLimiterRow {
            tokens: self.tokens,
            rate: self.rate,
            bucket_size: self.bucket_size,
            last_congestion_rate: self.last_congestion_rate,
            last_used_at: self.last_used_at,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_rate_limited: self.total_rate_limited,
        }
    }
}

/// Monitoring snapshot of the limiter.
#[derive(Debug, Clone)]
pub struct LimiterSnapshot {
    pub tokens: f64,
    pub rate: f64,
    pub bucket_size: f64,
    pub last_congestion_rate: f64,
    pub total_requests: i64,
    pub total_successes: i64,
    pub total_rate_limited: i64,
    /// "healthy", "throttled" or "recovering".
    pub status: &'static str,
}

impl LimiterSnapshot {
    pub fn requests_per_minute(&self) -> f64 {
        self.rate * 60.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.total_successes as f64 / self.total_requests as f64 * 100.0
        }
    }
}

/// Wraps the HTTP transport with token acquisition, cache short-circuit and
/// server-feedback rate adjustment. All fetches go through [`Self::resolve`].
pub struct AtbLimiter {
    config: AtbConfig,
    pool: SqlitePool,
    dicts: Arc<DictRegistry>,
    manager: Arc<dyn RequestManager>,
    populate_cache: bool,
    state: Mutex<AtbState>,
}

impl AtbLimiter {
    pub fn new(
        config: AtbConfig,
        pool: SqlitePool,
        dicts: Arc<DictRegistry>,
        manager: Arc<dyn RequestManager>,
        populate_cache: bool,
    ) -> Self {
        let state = AtbState {
            tokens: config.initial_tokens,
            rate: config.initial_rate,
            bucket_size: config.bucket_size,
            last_congestion_rate: config.initial_congestion,
            last_used_at: db::now_secs(),
            total_requests: 0,
            total_successes: 0,
            total_rate_limited: 0,
        };
        Self {
            config,
            pool,
            dicts,
            manager,
            populate_cache,
            state: Mutex::new(state),
        }
    }

    /// Restore persisted state, regenerating tokens for the idle interval,
    /// or persist the config defaults on first run.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match db::state::get_rate_limiter_state(&self.pool).await? {
            Some(row) => {
                state.tokens = row.tokens;
                state.rate = row.rate;
                state.bucket_size = row.bucket_size;
                state.last_congestion_rate = row.last_congestion_rate;
                state.last_used_at = row.last_used_at;
                state.total_requests = row.total_requests;
                state.total_successes = row.total_successes;
                state.total_rate_limited = row.total_rate_limited;

                let elapsed = (db::now_secs() - state.last_used_at).max(0.0);
                state.tokens = (state.tokens + elapsed * state.rate).min(state.bucket_size);

                info!(
                    rate = state.rate,
                    per_minute = state.rate * 60.0,
                    tokens = state.tokens,
                    congestion_rate = state.last_congestion_rate,
                    "rate limiter restored"
                );
            }
            None => {
                db::state::upsert_rate_limiter_state(&self.pool, &state.row()).await?;
                info!(
                    rate = state.rate,
                    bucket_size = state.bucket_size,
                    "rate limiter initialized"
                );
            }
        }
        Ok(())
    }

    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    pub async fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().await;
        let status = if state.total_rate_limited == 0 {
            "healthy"
        } else if state.rate < state.last_congestion_rate {
            "recovering"
        } else {
            "throttled"
        };
        LimiterSnapshot {
            tokens: state.tokens,
            rate: state.rate,
            bucket_size: state.bucket_size,
            last_congestion_rate: state.last_congestion_rate,
            total_requests: state.total_requests,
            total_successes: state.total_successes,
            total_rate_limited: state.total_rate_limited,
            status,
        }
    }

    /// Flush the current state row. Called at shutdown.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.lock().await;
        db::state::upsert_rate_limiter_state(&self.pool, &state.row()).await
    }

    /// Acquire a token, waiting when the bucket is empty.
    ///
    /// A waiter reserves its slot by pushing the token count negative while
    /// still holding the lock, then sleeps outside it. N concurrent workers
    /// therefore stagger 1/rate apart instead of stampeding on refill.
    async fn acquire_token(&self) {
        let wait_secs = {
            let mut state = self.state.lock().await;
            let now = db::now_secs();
            let elapsed = now - state.last_used_at;
            if elapsed > 0.0 {
                state.tokens = (state.tokens + elapsed * state.rate).min(state.bucket_size);
                state.last_used_at = now;
            }

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                0.0
            } else {
                let wait = (1.0 - state.tokens) / state.rate;
                state.tokens -= 1.0;
                wait
            }
        };

        if wait_secs > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait_secs)).await;
        }
    }

    /// Adjust the rate for a response status and persist the state row.
    async fn adjust_for_status(&self, status: u16) -> Result<()> {
        let row = {
            let mut state = self.state.lock().await;
            state.total_requests += 1;

            if (200..300).contains(&status) {
                state.total_successes += 1;
                let (new_rate, step) = if state.rate < state.last_congestion_rate {
                    (
                        f64::max(state.rate + MIN_INCREASE, state.rate * self.config.first_step),
                        "aggressive",
                    )
                } else {
                    (
                        f64::max(state.rate + MIN_INCREASE, state.rate * self.config.second_step),
                        "conservative",
                    )
                };
                let old_rate = state.rate;
                state.rate = round4(new_rate.min(self.config.max_rate));
                debug!(step, old_rate, new_rate = state.rate, "rate increased");
            } else if is_transient_status(status) {
                state.total_rate_limited += 1;
                let old_rate = state.rate;
                state.last_congestion_rate = state.rate;
                state.rate = round4(f64::max(self.config.min_rate, state.rate / 2.0));
                state.tokens = 0.0;
                info!(
                    status,
                    old_rate,
                    new_rate = state.rate,
                    congestion_rate = state.last_congestion_rate,
                    "rate decreased on congestion"
                );
            }
            // Other codes: counters only

            state.row()
        };

        db::state::upsert_rate_limiter_state(&self.pool, &row).await
    }

    /// Fetch a request with caching, rate limiting and feedback adjustment.
    ///
    /// A cache hit returns immediately without a token or adjustment.
    /// Retryable statuses ({408, 425, 429} and 5xx) adjust the rate first
    /// and then surface as transient errors for the retry machine.
    pub async fn resolve(&self, request: &Request) -> Result<Response> {
        if let Some(hit) = self.cached_response(request).await? {
            debug!(url = %request.http.url, "cache hit");
            return Ok(hit);
        }

        self.acquire_token().await;

        let response = self.manager.fetch(request).await?;
        self.adjust_for_status(response.status).await?;

        if is_transient_status(response.status) {
            return Err(anyhow::Error::new(ScrapeError::http_status(
                response.status,
                response.url.clone(),
            )));
        }

        if self.populate_cache && response.is_success() {
            self.store_in_cache(request, &response).await?;
        }

        Ok(response)
    }

    fn cache_key(&self, request: &Request) -> String {
        let headers = request.effective_headers();
        let headers_json = if headers.is_empty() {
            None
        } else {
            serde_json::to_string(&headers).ok()
        };
        let body = request.http.body.as_ref().map(|b| b.canonical_bytes());
        db::cache::compute_cache_key(
            request.http.method.as_str(),
            &request.http.url,
            body.as_deref(),
            headers_json.as_deref(),
        )
    }

    async fn cached_response(&self, request: &Request) -> Result<Option<Response>> {
        let key = self.cache_key(request);
        let Some(row) = db::cache::get_cached(&self.pool, &key).await? else {
            return Ok(None);
        };

        let body = match &row.content_compressed {
            Some(frame) => {
                self.dicts
                    .decompress(frame, row.content_size_original as usize, row.dict_id)
                    .await?
            }
            None => Vec::new(),
        };
        let headers = row
            .headers_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default();

        Ok(Some(Response {
            status: row.status_code as u16,
            headers,
            body,
            url: row.final_url,
            request: request.clone(),
            request_id: None,
            file_path: None,
        }))
    }

    async fn store_in_cache(&self, request: &Request, response: &Response) -> Result<()> {
        let key = self.cache_key(request);
        let (frame, dict_id) = self
            .dicts
            .compress_for(&request.continuation, &response.body)
            .await?;
        let headers_json = serde_json::to_string(&response.headers).ok();
        db::cache::put_cached(
            &self.pool,
            &key,
            i64::from(response.status),
            headers_json.as_deref(),
            &response.url,
            Some(&frame),
            response.body.len() as i64,
            dict_id,
        )
        .await
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_pool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU16, Ordering};

    struct FixedStatus(AtomicU16);

    #[async_trait]
    impl RequestManager for FixedStatus {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            Ok(Response {
                status: self.0.load(Ordering::SeqCst),
                headers: Default::default(),
                body: b"ok".to_vec(),
                url: request.http.url.clone(),
                request: request.clone(),
                request_id: None,
                file_path: None,
            })
        }
    }

    async fn limiter_with_status(status: u16) -> (tempfile::TempDir, Arc<AtbLimiter>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();
        let dicts = Arc::new(DictRegistry::new(pool.clone()));
        let manager = Arc::new(FixedStatus(AtomicU16::new(status)));
        let limiter = Arc::new(AtbLimiter::new(
            AtbConfig {
                initial_tokens: 4.0,
                ..AtbConfig::default()
            },
            pool,
            dicts,
            manager,
            false,
        ));
        limiter.initialize().await.unwrap();
        (dir, limiter)
    }

    // ── rate adjustment ─────────────────────────────────────────────────

    #[tokio::test]
    async fn successes_increase_rate_aggressively_below_congestion() {
        let (_dir, limiter) = limiter_with_status(200).await;
        // initial rate 0.1, congestion 1.0 → aggressive ×1.5
        limiter.adjust_for_status(200).await.unwrap();
        assert!((limiter.current_rate().await - 0.15).abs() < 1e-9);
        limiter.adjust_for_status(200).await.unwrap();
        assert!((limiter.current_rate().await - 0.225).abs() < 1e-9);
    }

    #[tokio::test]
    async fn successes_above_congestion_are_conservative() {
        let (_dir, limiter) = limiter_with_status(200).await;
        {
            let mut state = limiter.state.lock().await;
            state.rate = 2.0;
            state.last_congestion_rate = 1.0;
        }
        limiter.adjust_for_status(200).await.unwrap();
        assert!((limiter.current_rate().await - 2.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn congestion_halves_rate_and_drains_bucket() {
        let (_dir, limiter) = limiter_with_status(429).await;
        {
            let mut state = limiter.state.lock().await;
            state.rate = 0.8;
        }
        limiter.adjust_for_status(429).await.unwrap();
        let state = limiter.state.lock().await;
        assert!((state.rate - 0.4).abs() < 1e-9);
        assert!((state.last_congestion_rate - 0.8).abs() < 1e-9);
        assert_eq!(state.tokens, 0.0);
        assert_eq!(state.total_rate_limited, 1);
    }

    #[tokio::test]
    async fn rate_stays_within_bounds() {
        let (_dir, limiter) = limiter_with_status(200).await;
        for _ in 0..50 {
            limiter.adjust_for_status(200).await.unwrap();
        }
        assert!(limiter.current_rate().await <= 40.0);

        for _ in 0..50 {
            limiter.adjust_for_status(503).await.unwrap();
        }
        assert!(limiter.current_rate().await >= 0.01);
    }

    #[tokio::test]
    async fn non_retryable_codes_leave_rate_alone() {
        let (_dir, limiter) = limiter_with_status(404).await;
        limiter.adjust_for_status(404).await.unwrap();
        assert!((limiter.current_rate().await - 0.1).abs() < 1e-9);
        let snap = limiter.snapshot().await;
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.total_successes, 0);
        assert_eq!(snap.total_rate_limited, 0);
    }

    // ── resolve classification ──────────────────────────────────────────

    #[tokio::test]
    async fn retryable_status_surfaces_as_transient_after_adjustment() {
        let (_dir, limiter) = limiter_with_status(503).await;
        let request = Request::get("http://x/flaky", "parse");
        let err = limiter.resolve(&request).await.unwrap_err();
        let scrape = err.downcast_ref::<ScrapeError>().expect("scrape error");
        assert!(matches!(scrape, ScrapeError::Transient { .. }));
        // The adjustment happened before the error surfaced
        assert!((limiter.current_rate().await - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn plain_404_flows_through_as_response() {
        let (_dir, limiter) = limiter_with_status(404).await;
        let request = Request::get("http://x/missing", "parse");
        let response = limiter.resolve(&request).await.unwrap();
        assert_eq!(response.status, 404);
    }

    // ── persistence ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn state_persists_and_regenerates_tokens_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).await.unwrap();

        db::state::upsert_rate_limiter_state(
            &pool,
            &RateLimiterRow {
                tokens: 0.0,
                rate: 2.0,
                bucket_size: 4.0,
                last_congestion_rate: 1.0,
                last_used_at: db::now_secs() - 1.0,
                total_requests: 5,
                total_successes: 5,
                total_rate_limited: 0,
            },
        )
        .await
        .unwrap();

        let dicts = Arc::new(DictRegistry::new(pool.clone()));
        let limiter = AtbLimiter::new(
            AtbConfig::default(),
            pool,
            dicts,
            Arc::new(FixedStatus(AtomicU16::new(200))),
            false,
        );
        limiter.initialize().await.unwrap();

        let state = limiter.state.lock().await;
        assert!((state.rate - 2.0).abs() < 1e-9);
        // ~1s elapsed at 2 tokens/s, capped by the bucket
        assert!(state.tokens >= 1.9 && state.tokens <= 4.0);
        assert_eq!(state.total_successes, 5);
    }

    // ── token staggering ────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_bucket_reserves_future_slots() {
        let (_dir, limiter) = limiter_with_status(200).await;
        {
            let mut state = limiter.state.lock().await;
            state.tokens = 0.5;
            state.rate = 10.0; // fast, so the test does not sleep long
            state.last_used_at = db::now_secs();
        }

        let start = std::time::Instant::now();
        limiter.acquire_token().await; // waits (1 - 0.5)/10 = 50ms
        limiter.acquire_token().await; // debt grows, waits ~100ms more
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(120), "{elapsed:?}");
    }
}
