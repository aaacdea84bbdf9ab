//! The driver: owns the queue, the workers, the rate limiter and the
//! public observability API.
//!
//! ```no_run
//! use trawl::config::DriverConfig;
//! use trawl::callbacks::Callbacks;
//! use trawl::driver::Driver;
//! # async fn example(scraper: std::sync::Arc<dyn trawl::scraper::Scraper>) -> anyhow::Result<()> {
//! let driver = Driver::open(scraper, "run.db", DriverConfig::default(), Callbacks::new()).await?;
//! driver.run(true).await?;
//! driver.close().await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callbacks::Callbacks;
use crate::compression::DictRegistry;
use crate::config::DriverConfig;
use crate::db;
use crate::db::errors::ErrorRecord;
use crate::db::requests::{RequestRecord, RequestStatus};
use crate::db::responses::{ResponseRecord, ResultRecord};
use crate::db::Page;
use crate::error::{ErrorKind, Result};
use crate::events::{ProgressEvent, ProgressKind};
use crate::http::{HttpRequestManager, RequestManager};
use crate::limiter::{AtbLimiter, LimiterSnapshot};
use crate::queue::{self, EnqueueContext};
use crate::scraper::{default_invocations, Invocation, Scraper};
use crate::speculation::{SeedBatch, SpeculationEngine};
use crate::types::{Request, Response};
use crate::worker;

/// Coarse state of the scrape, derived from queue contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No requests in the database.
    Unstarted,
    /// Pending or in-progress requests exist.
    InProgress,
    /// Work exists and none of it is outstanding.
    Done,
}

/// A stored response with its body decompressed.
#[derive(Debug, Clone)]
pub struct ResponseView {
    pub record: ResponseRecord,
    pub body: Vec<u8>,
}

/// Shared driver state; everything the workers touch.
pub(crate) struct DriverInner {
    pub(crate) scraper: Arc<dyn Scraper>,
    pub(crate) pool: SqlitePool,
    pub(crate) config: DriverConfig,
    pub(crate) callbacks: Callbacks,
    pub(crate) limiter: AtbLimiter,
    pub(crate) dicts: Arc<DictRegistry>,
    pub(crate) stop: CancellationToken,
    pub(crate) speculation: SpeculationEngine,
    pub(crate) retry: crate::retry::RetryPolicy,
    pub(crate) storage_dir: PathBuf,
    pub(crate) run_id: i64,
    pub(crate) active_workers: AtomicUsize,
    queue_counter: Mutex<i64>,
}

impl DriverInner {
    /// Emit a progress event. Best-effort: the callback cannot fail the
    /// driver.
    pub(crate) async fn emit(&self, kind: ProgressKind, data: serde_json::Value) {
        if let Some(on_progress) = &self.callbacks.on_progress {
            on_progress(ProgressEvent::new(kind, data)).await;
        }
    }

    pub(crate) async fn next_counter(&self) -> i64 {
        let mut counter = self.queue_counter.lock().await;
        *counter += 1;
        *counter
    }

    /// Resolve, dedup and persist a new request.
    ///
    /// Returns the new row id, or `None` when the enqueue was dropped as a
    /// duplicate (silently, per the dedup contract).
    pub(crate) async fn enqueue(
        &self,
        request: Request,
        context: EnqueueContext<'_>,
        parent_id: Option<i64>,
    ) -> Result<Option<i64>> {
        let resolved = queue::resolve_request(request, &context)?;
        let dedup_key = queue::effective_dedup_key(&resolved);

        if let Some(key) = &dedup_key {
            if let Some(duplicate_check) = &self.callbacks.duplicate_check {
                if !duplicate_check(key.clone()).await {
                    debug!(url = %resolved.http.url, "enqueue vetoed by duplicate_check");
                    return Ok(None);
                }
            }
        }

        // The counter lock also serializes the dedup check against the
        // insert, so two concurrent enqueues cannot both pass it.
        let mut counter = self.queue_counter.lock().await;
        if let Some(key) = &dedup_key {
            if db::requests::dedup_key_exists(&self.pool, key).await? {
                debug!(url = %resolved.http.url, "duplicate enqueue dropped");
                return Ok(None);
            }
        }
        *counter += 1;
        let new = queue::serialize_request(&resolved, *counter, parent_id, dedup_key);
        let id = db::requests::insert_request(&self.pool, &new).await?;
        drop(counter);

        self.emit(
            ProgressKind::RequestEnqueued,
            json!({
                "request_id": id,
                "url": new.url,
                "continuation": new.continuation,
                "priority": new.priority,
            }),
        )
        .await;
        Ok(Some(id))
    }

    /// Fold a resolved speculative response into the engine and enqueue any
    /// extension window it unlocked. Returns the outcome to store.
    pub(crate) async fn track_speculation(
        &self,
        request: &Request,
        response: &Response,
    ) -> Result<Option<&'static str>> {
        let Some(spec) = &request.speculation_id else {
            return Ok(None);
        };
        let success = response.is_success() && self.scraper.fails_successfully(response);
        if let Some(batch) = self
            .speculation
            .record_outcome(&spec.entry, spec.id, success)
            .await
        {
            self.enqueue_speculative_batch(&batch).await?;
        }
        Ok(Some(if success { "success" } else { "failure" }))
    }

    pub(crate) async fn enqueue_speculative_batch(&self, batch: &SeedBatch) -> Result<()> {
        for id in &batch.ids {
            let Some(request) = self.scraper.speculate(&batch.entry, *id) else {
                warn!(entry = %batch.entry, id, "scraper built no request for speculative id");
                continue;
            };
            let request = request.speculative(batch.entry.clone(), *id);
            self.enqueue(request, EnqueueContext::Entry, None).await?;
        }
        Ok(())
    }
}

/// A resumable, rate-adaptive scraping driver over a single SQLite file.
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Open the database, initialize schema and run metadata, and restore
    /// resumable state. Uses the real HTTP transport.
    pub async fn open(
        scraper: Arc<dyn Scraper>,
        db_path: impl AsRef<Path>,
        config: DriverConfig,
        callbacks: Callbacks,
    ) -> Result<Self> {
        let manager = Arc::new(HttpRequestManager::new(config.request_timeout, |builder| {
            scraper.customize_http(builder)
        })?);
        Self::open_with_manager(scraper, db_path, config, callbacks, manager).await
    }

    /// Like [`Self::open`] but with an injected transport, for tests and
    /// alternative backends.
    pub async fn open_with_manager(
        scraper: Arc<dyn Scraper>,
        db_path: impl AsRef<Path>,
        mut config: DriverConfig,
        callbacks: Callbacks,
        manager: Arc<dyn RequestManager>,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        let pool = db::open_pool(db_path).await?;

        // Derive the initial rate from the scraper's declarative limits;
        // persisted limiter state still wins on resume.
        let limits = scraper.rate_limits();
        if let Some(slowest) = limits
            .iter()
            .map(|l| l.per_second())
            .filter(|r| r.is_finite())
            .min_by(|a, b| a.total_cmp(b))
        {
            config.atb.initial_rate = slowest.clamp(config.atb.min_rate, config.atb.max_rate);
        }

        let storage_dir = match &config.storage_dir {
            Some(dir) => dir.clone(),
            None => db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("trawl_files"),
        };
        tokio::fs::create_dir_all(&storage_dir).await?;

        let run_id = db::runs::init_run(
            &pool,
            scraper.name(),
            scraper.version(),
            config.num_workers as i64,
            config.max_workers as i64,
            None,
        )
        .await?;

        if config.resume {
            let restored = db::requests::reset_in_progress(&pool).await?;
            if restored > 0 {
                info!(restored, "reset in-progress requests from previous run");
            }
        }

        let dicts = Arc::new(DictRegistry::new(pool.clone()));
        let limiter = AtbLimiter::new(
            config.atb.clone(),
            pool.clone(),
            dicts.clone(),
            manager,
            config.populate_cache,
        );
        limiter.initialize().await?;

        let speculation = SpeculationEngine::discover(&scraper.entries());
        let queue_counter = db::requests::max_queue_counter(&pool).await?;
        let retry = crate::retry::RetryPolicy {
            base_delay: config.retry_base_delay,
            max_backoff: config.max_backoff_time,
        };

        Ok(Self {
            inner: Arc::new(DriverInner {
                scraper,
                pool,
                config,
                callbacks,
                limiter,
                dicts,
                stop: CancellationToken::new(),
                speculation,
                retry,
                storage_dir,
                run_id,
                active_workers: AtomicUsize::new(0),
                queue_counter: Mutex::new(queue_counter),
            }),
        })
    }

    /// Record the stored seed selection for this database. Subsequent runs
    /// reuse it instead of the default invocations.
    pub async fn set_seed_invocations(&self, invocations: &[Invocation]) -> Result<()> {
        let json = serde_json::to_string(invocations)?;
        sqlx::query("UPDATE runs SET seed_invocations = ?2 WHERE id = ?1")
            .bind(self.inner.run_id)
            .bind(json)
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }

    /// Signal workers to stop after completing their current request.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Run the scraper to completion (or interruption).
    ///
    /// With `setup_signal_handlers`, SIGINT/SIGTERM trigger the same
    /// cooperative stop as [`Self::stop`]. In-progress rows survive an
    /// interruption and resume on the next run; the final run status is
    /// `completed`, `interrupted` or `error`.
    pub async fn run(&self, setup_signal_handlers: bool) -> Result<()> {
        let inner = &self.inner;

        let signal_task =
            setup_signal_handlers.then(|| tokio::spawn(listen_for_signals(inner.stop.clone())));

        db::runs::set_run_status(&inner.pool, inner.run_id, "running").await?;
        if let Some(on_run_start) = &inner.callbacks.on_run_start {
            on_run_start(inner.scraper.name().to_string()).await;
        }
        inner
            .emit(
                ProgressKind::RunStarted,
                json!({"scraper_name": inner.scraper.name()}),
            )
            .await;

        let outcome = self.run_inner().await;

        if let Some(task) = signal_task {
            task.abort();
        }

        let (status, error_text) = match &outcome {
            Err(err) => ("error", Some(format!("{err:#}"))),
            Ok(()) if inner.stop.is_cancelled() => ("interrupted", None),
            Ok(()) => ("completed", None),
        };
        db::runs::finalize_run(&inner.pool, inner.run_id, status, error_text.as_deref()).await?;

        // Flush adaptive state so a resumed run starts where this one ended
        inner.limiter.persist().await?;
        inner.speculation.persist(&inner.pool).await?;

        inner
            .emit(
                ProgressKind::RunCompleted,
                json!({
                    "scraper_name": inner.scraper.name(),
                    "status": status,
                    "error": error_text,
                }),
            )
            .await;
        if let Some(on_run_complete) = &inner.callbacks.on_run_complete {
            on_run_complete(
                inner.scraper.name().to_string(),
                status.to_string(),
                error_text.clone(),
            )
            .await;
        }

        outcome
    }

    async fn run_inner(&self) -> Result<()> {
        let inner = self.inner.clone();

        if inner.stop.is_cancelled() {
            return Ok(());
        }

        // Seed the queue with entry requests on first run
        if !db::requests::has_any_requests(&inner.pool).await? {
            let invocations: Vec<Invocation> =
                match db::runs::stored_seed_invocations(&inner.pool).await? {
                    Some(json) => serde_json::from_str(&json)?,
                    None => default_invocations(&inner.scraper.entries()),
                };
            let seeds = inner
                .scraper
                .seed(&invocations)
                .map_err(anyhow::Error::new)?;
            info!(count = seeds.len(), "seeding entry requests");
            for request in seeds {
                inner.enqueue(request, EnqueueContext::Entry, None).await?;
            }
        }

        // Speculation: restore persisted frontiers, then seed id ranges.
        // Dedup quietly drops ids already probed by a previous run.
        if !inner.speculation.is_empty().await {
            inner.speculation.load_persisted(&inner.pool).await?;
            for batch in inner.speculation.seed_batches().await {
                info!(entry = %batch.entry, ids = batch.ids.len(), "seeding speculative requests");
                inner.enqueue_speculative_batch(&batch).await?;
            }
        }

        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut next_worker_id = 0usize;
        let mut spawn_worker = |join_set: &mut JoinSet<Result<()>>| {
            next_worker_id += 1;
            let worker_id = next_worker_id;
            let inner = inner.clone();
            inner.active_workers.fetch_add(1, Ordering::SeqCst);
            join_set.spawn(async move {
                let result = worker::run_worker(inner.clone(), worker_id).await;
                inner.active_workers.fetch_sub(1, Ordering::SeqCst);
                result
            });
        };

        info!(
            num_workers = inner.config.num_workers,
            max_workers = inner.config.max_workers,
            "starting workers"
        );
        for _ in 0..inner.config.num_workers.max(1) {
            spawn_worker(&mut join_set);
        }

        let (spawn_tx, mut spawn_rx) = mpsc::channel::<()>(4);
        let monitor = inner
            .config
            .enable_monitor
            .then(|| tokio::spawn(worker::run_monitor(inner.clone(), spawn_tx.clone())));
        drop(spawn_tx);

        let mut failure: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(Ok(()))) => {
                            if join_set.is_empty() {
                                break;
                            }
                        }
                        Some(Ok(Err(err))) => {
                            // A worker hit a run-level error: stop the rest
                            failure = Some(err);
                            inner.stop.cancel();
                        }
                        Some(Err(join_err)) => {
                            failure = Some(anyhow::anyhow!("worker task panicked: {join_err}"));
                            inner.stop.cancel();
                        }
                    }
                }
                Some(()) = spawn_rx.recv() => {
                    let active = inner.active_workers.load(Ordering::SeqCst);
                    if active < inner.config.max_workers && !inner.stop.is_cancelled() {
                        spawn_worker(&mut join_set);
                    }
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.abort();
            let _ = monitor.await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Persist adaptive state and close the pool.
    pub async fn close(&self) -> Result<()> {
        self.inner.speculation.persist(&self.inner.pool).await?;
        self.inner.limiter.persist().await?;
        self.inner.pool.close().await;
        Ok(())
    }

    // ── observability API ───────────────────────────────────────────────

    /// Coarse run state derived from queue contents.
    pub async fn status(&self) -> Result<RunState> {
        let pool = &self.inner.pool;
        if !db::requests::has_any_requests(pool).await? {
            return Ok(RunState::Unstarted);
        }
        let outstanding = db::requests::count_pending(pool).await?
            + db::requests::count_in_progress(pool).await?;
        if outstanding > 0 {
            Ok(RunState::InProgress)
        } else {
            Ok(RunState::Done)
        }
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        continuation: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<RequestRecord>> {
        db::requests::list_requests(&self.inner.pool, status, continuation, offset, limit).await
    }

    pub async fn list_responses(
        &self,
        continuation: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ResponseRecord>> {
        db::responses::list_responses(&self.inner.pool, continuation, offset, limit).await
    }

    pub async fn list_results(
        &self,
        result_type: Option<&str>,
        is_valid: Option<bool>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ResultRecord>> {
        db::responses::list_results(&self.inner.pool, result_type, is_valid, offset, limit).await
    }

    pub async fn list_errors(
        &self,
        error_type: Option<ErrorKind>,
        continuation: Option<&str>,
        unresolved_only: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ErrorRecord>> {
        db::errors::list_errors(
            &self.inner.pool,
            error_type,
            continuation,
            unresolved_only,
            offset,
            limit,
        )
        .await
    }

    /// A stored response with its body decompressed through the dictionary
    /// registry.
    pub async fn get_response(&self, response_id: i64) -> Result<Option<ResponseView>> {
        let Some(record) = db::responses::get_response(&self.inner.pool, response_id).await? else {
            return Ok(None);
        };
        let body = match &record.content_compressed {
            Some(frame) => {
                self.inner
                    .dicts
                    .decompress(frame, record.content_size_original as usize, record.dict_id)
                    .await?
            }
            None => Vec::new(),
        };
        Ok(Some(ResponseView { record, body }))
    }

    pub async fn get_result(&self, result_id: i64) -> Result<Option<ResultRecord>> {
        db::responses::get_result(&self.inner.pool, result_id).await
    }

    pub async fn get_request(&self, request_id: i64) -> Result<Option<RequestRecord>> {
        db::requests::get_request(&self.inner.pool, request_id).await
    }

    /// Cancel one request; only pending and held rows can be cancelled.
    pub async fn cancel_request(&self, request_id: i64) -> Result<bool> {
        db::requests::cancel_request(&self.inner.pool, request_id).await
    }

    pub async fn cancel_requests_by_continuation(&self, continuation: &str) -> Result<u64> {
        db::requests::cancel_by_continuation(&self.inner.pool, continuation).await
    }

    /// Re-create a pending request from the row behind an error, resolving
    /// the error with a back-reference to the clone.
    pub async fn requeue_error(&self, error_id: i64) -> Result<Option<i64>> {
        let inner = &self.inner;
        let Some(error) = db::errors::get_error(&inner.pool, error_id).await? else {
            return Ok(None);
        };
        let Some(request_id) = error.request_id else {
            return Ok(None);
        };
        let counter = inner.next_counter().await;
        let Some(new_id) = db::requests::clone_for_requeue(&inner.pool, request_id, counter).await?
        else {
            return Ok(None);
        };
        db::errors::resolve_error(
            &inner.pool,
            error_id,
            Some(&format!("requeued as request {new_id}")),
        )
        .await?;
        inner
            .emit(
                ProgressKind::RequestEnqueued,
                json!({"request_id": new_id, "requeued_from_error": error_id}),
            )
            .await;
        Ok(Some(new_id))
    }

    /// Batch requeue of unresolved errors, optionally filtered by type and
    /// continuation. Returns the new request ids.
    pub async fn requeue_errors_by_type(
        &self,
        error_type: Option<ErrorKind>,
        continuation: Option<&str>,
    ) -> Result<Vec<i64>> {
        let ids =
            db::errors::unresolved_error_ids(&self.inner.pool, error_type, continuation).await?;
        let mut requeued = Vec::with_capacity(ids.len());
        for error_id in ids {
            if let Some(new_id) = self.requeue_error(error_id).await? {
                requeued.push(new_id);
            }
        }
        Ok(requeued)
    }

    pub async fn count_errors(
        &self,
        error_type: Option<ErrorKind>,
        unresolved_only: bool,
    ) -> Result<i64> {
        db::errors::count_errors(&self.inner.pool, error_type, unresolved_only).await
    }

    /// Rate limiter monitoring snapshot.
    pub async fn limiter_snapshot(&self) -> LimiterSnapshot {
        self.inner.limiter.snapshot().await
    }

    /// The underlying pool, for embedders querying tables directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }
}

/// Cooperative shutdown on SIGINT/SIGTERM.
async fn listen_for_signals(stop: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl+c, stopping after in-flight requests");
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received SIGTERM, stopping after in-flight requests");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
    stop.cancel();
}
