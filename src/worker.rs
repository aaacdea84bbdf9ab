//! Worker loop and the scaling monitor.
//!
//! Workers are cooperative tasks over the shared driver state. Each loops:
//! claim a request atomically, fetch through the rate limiter, store the
//! response, run the continuation through the dispatcher, mark completed.
//! Failures classify into the retry machine or the error store. A separate
//! monitor task adds workers while the token bucket can feed more of them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::callbacks;
use crate::db;
use crate::db::requests::RequestRecord;
use crate::dispatch;
use crate::driver::DriverInner;
use crate::error::{classify, ErrorKind, Result, ScrapeError};
use crate::events::ProgressKind;
use crate::queue;
use crate::retry::RetryDecision;
use crate::types::{Request, RequestKind, Response};

/// Main worker loop. Exits on stop, or once the queue has been truly idle
/// (nothing pending, nothing in flight) for the configured grace period.
pub(crate) async fn run_worker(inner: Arc<DriverInner>, worker_id: usize) -> Result<()> {
    info!(worker_id, "worker started");
    let mut processed: u64 = 0;

    'outer: loop {
        if inner.stop.is_cancelled() {
            info!(worker_id, processed, "worker exiting: stop requested");
            break;
        }

        let mut claimed = db::requests::dequeue_next(&inner.pool).await?;

        if claimed.is_none() {
            if let Some(delay_ms) = db::requests::next_retry_delay_ms(&inner.pool).await? {
                // Scheduled retries exist; sleep until just after the nearest
                let wait = Duration::from_millis(delay_ms.max(0) as u64 + 100)
                    .min(Duration::from_secs(60));
                debug!(worker_id, wait_ms = wait.as_millis() as u64, "waiting for scheduled retry");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.stop.cancelled() => break 'outer,
                }
                claimed = db::requests::dequeue_next(&inner.pool).await?;
                if claimed.is_none() {
                    continue 'outer;
                }
            } else {
                // Other workers may still produce work; poll until the queue
                // has been idle for the grace period.
                let poll = inner.config.poll_interval.max(Duration::from_millis(10));
                let mut idle_for = Duration::ZERO;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = inner.stop.cancelled() => break 'outer,
                    }
                    claimed = db::requests::dequeue_next(&inner.pool).await?;
                    if claimed.is_some() {
                        break;
                    }
                    let pending = db::requests::count_pending(&inner.pool).await?;
                    let in_progress = db::requests::count_in_progress(&inner.pool).await?;
                    if pending == 0 && in_progress == 0 {
                        idle_for += poll;
                        if idle_for >= inner.config.idle_grace {
                            info!(worker_id, processed, "worker exiting: queue idle");
                            break 'outer;
                        }
                    } else {
                        idle_for = Duration::ZERO;
                        if in_progress == 0 {
                            // Everything pending is backing off; go sleep on it
                            continue 'outer;
                        }
                    }
                }
            }
        }

        let Some(row) = claimed else { continue };
        debug!(worker_id, request_id = row.id, url = %row.url, "dequeued request");

        inner
            .emit(
                ProgressKind::RequestStarted,
                json!({
                    "request_id": row.id,
                    "url": row.url,
                    "continuation": row.continuation,
                }),
            )
            .await;

        let request = match queue::deserialize_request(&row) {
            Ok(request) => request,
            Err(err) => {
                error!(worker_id, request_id = row.id, error = ?err, "row failed to deserialize");
                fail_request(&inner, &row, &err).await?;
                continue;
            }
        };

        match process_request(&inner, &row, &request).await {
            Ok(()) => {
                processed += 1;
                debug!(worker_id, request_id = row.id, processed, "request completed");
            }
            Err(err) => match classify(&err) {
                ErrorKind::Transient => {
                    if !handle_transient(&inner, &row, &err).await? {
                        continue;
                    }
                }
                ErrorKind::Structural => {
                    fail_request(&inner, &row, &err).await?;
                    let mismatch = err
                        .downcast_ref::<ScrapeError>()
                        .and_then(|e| match e {
                            ScrapeError::Structural(m) => Some(m.clone()),
                            _ => None,
                        });
                    let continue_run = match (&inner.callbacks.on_structural_error, mismatch) {
                        (Some(cb), Some(m)) => cb(m).await,
                        _ => false,
                    };
                    if !continue_run {
                        warn!(worker_id, request_id = row.id, "structural error aborts the run");
                        return Err(err);
                    }
                }
                ErrorKind::Validation => {
                    // Reaches here only when on_invalid_data is absent
                    fail_request(&inner, &row, &err).await?;
                    return Err(err);
                }
                ErrorKind::Unknown => {
                    error!(worker_id, request_id = row.id, error = ?err, "request failed");
                    fail_request(&inner, &row, &err).await?;
                }
            },
        }
    }

    Ok(())
}

/// Fetch, store, continue, complete.
async fn process_request(
    inner: &DriverInner,
    row: &RequestRecord,
    request: &Request,
) -> Result<()> {
    let mut response = inner.limiter.resolve(request).await?;
    response.request_id = Some(row.id);

    if request.kind == RequestKind::Archive {
        let path = match &inner.callbacks.on_archive {
            Some(on_archive) => {
                on_archive(
                    response.body.clone(),
                    response.url.clone(),
                    request.expected_type.clone(),
                    inner.storage_dir.clone(),
                )
                .await?
            }
            None => {
                callbacks::default_archive(
                    response.body.clone(),
                    response.url.clone(),
                    request.expected_type.clone(),
                    inner.storage_dir.clone(),
                )
                .await?
            }
        };
        response.file_path = Some(path);
    }

    let speculation_outcome = if request.is_speculative {
        inner.track_speculation(request, &response).await?
    } else {
        None
    };

    // The response is committed before the continuation runs, so its yields
    // always see it stored.
    store_response(inner, row, request, &response, speculation_outcome).await?;

    let yields = inner
        .scraper
        .continuation(&request.continuation, &response)
        .map_err(anyhow::Error::new)?;
    dispatch::process_yields(inner, yields, &response, request, row.id).await?;

    db::requests::mark_completed(&inner.pool, row.id).await?;
    inner
        .emit(
            ProgressKind::RequestCompleted,
            json!({"request_id": row.id, "url": row.url}),
        )
        .await;
    Ok(())
}

/// Compress and persist a response row, plus the archived-file record for
/// archive downloads (whose content lives on disk, not in the database).
async fn store_response(
    inner: &DriverInner,
    row: &RequestRecord,
    request: &Request,
    response: &Response,
    speculation_outcome: Option<&'static str>,
) -> Result<()> {
    let headers_json = if response.headers.is_empty() {
        None
    } else {
        serde_json::to_string(&response.headers).ok()
    };

    let is_archive = request.kind == RequestKind::Archive;
    let (content, dict_id, compressed_size) = if is_archive || response.body.is_empty() {
        (None, None, 0)
    } else {
        let (frame, dict_id) = inner
            .dicts
            .compress_for(&request.continuation, &response.body)
            .await?;
        let size = frame.len() as i64;
        (Some(frame), dict_id, size)
    };

    db::responses::store_response(
        &inner.pool,
        &db::responses::NewResponse {
            request_id: row.id,
            status_code: i64::from(response.status),
            headers_json,
            final_url: response.url.clone(),
            content_compressed: content,
            content_size_original: response.body.len() as i64,
            content_size_compressed: compressed_size,
            dict_id,
            continuation: request.continuation.clone(),
            warc_record_id: uuid::Uuid::new_v4().to_string(),
            speculation_outcome: speculation_outcome.map(str::to_owned),
        },
    )
    .await?;

    if is_archive {
        if let Some(path) = &response.file_path {
            use sha2::{Digest, Sha256};
            let content_hash = hex::encode(Sha256::digest(&response.body));
            db::responses::store_archived_file(
                &inner.pool,
                row.id,
                &path.to_string_lossy(),
                &response.url,
                request.expected_type.as_deref(),
                response.body.len() as i64,
                Some(&content_hash),
            )
            .await?;
        }
    }

    Ok(())
}

/// Route a transient failure: user veto first, then the backoff machine.
///
/// Returns `true` when the request was handled terminally (failed), `false`
/// when a retry was scheduled or the request was skipped.
async fn handle_transient(
    inner: &DriverInner,
    row: &RequestRecord,
    err: &anyhow::Error,
) -> Result<bool> {
    let detail = err.downcast_ref::<ScrapeError>().and_then(|e| match e {
        ScrapeError::Transient { detail, .. } => Some(*detail),
        _ => None,
    });
    if let (Some(on_transient), Some(detail)) =
        (&inner.callbacks.on_transient_exception, detail)
    {
        if !on_transient(detail).await {
            fail_request(inner, row, err).await?;
            inner
                .emit(
                    ProgressKind::RequestSkipped,
                    json!({
                        "request_id": row.id,
                        "url": row.url,
                        "reason": "callback_declined",
                    }),
                )
                .await;
            return Ok(false);
        }
    }

    match inner.retry.decide(row.retry_count, row.cumulative_backoff) {
        RetryDecision::Retry { delay, cumulative } => {
            let ready_at = db::now_ms() + delay.as_millis() as i64;
            db::requests::schedule_retry(
                &inner.pool,
                row.id,
                cumulative,
                ready_at,
                &err.to_string(),
            )
            .await?;
            info!(
                request_id = row.id,
                retry = row.retry_count + 1,
                delay_s = delay.as_secs_f64(),
                cumulative_s = cumulative,
                "retry scheduled"
            );
            inner
                .emit(
                    ProgressKind::RequestRetryScheduled,
                    json!({
                        "request_id": row.id,
                        "url": row.url,
                        "error": err.to_string(),
                        "delay_seconds": delay.as_secs_f64(),
                    }),
                )
                .await;
            Ok(false)
        }
        RetryDecision::Exhausted => {
            warn!(
                request_id = row.id,
                cumulative_s = row.cumulative_backoff,
                "max backoff exceeded"
            );
            fail_request_with_reason(inner, row, err, Some("max_backoff_exceeded")).await?;
            Ok(true)
        }
    }
}

async fn fail_request(inner: &DriverInner, row: &RequestRecord, err: &anyhow::Error) -> Result<()> {
    fail_request_with_reason(inner, row, err, None).await
}

/// Mark failed, store the classified error row, emit the failure event.
async fn fail_request_with_reason(
    inner: &DriverInner,
    row: &RequestRecord,
    err: &anyhow::Error,
    reason: Option<&str>,
) -> Result<()> {
    db::requests::mark_failed(&inner.pool, row.id, &err.to_string()).await?;
    db::errors::store_error(&inner.pool, err, Some(row.id), &row.url).await?;
    let mut data = json!({
        "request_id": row.id,
        "url": row.url,
        "error": err.to_string(),
        "error_type": classify(err).as_str(),
    });
    if let Some(reason) = reason {
        data["reason"] = json!(reason);
    }
    inner.emit(ProgressKind::RequestFailed, data).await;
    Ok(())
}

/// Scaling monitor: wakes periodically and asks the run loop to spawn one
/// more worker while there is pending work, headroom under `max_workers`,
/// and the bucket refills faster than the current workers can drain it.
pub(crate) async fn run_monitor(inner: Arc<DriverInner>, spawn_tx: mpsc::Sender<()>) {
    info!(
        max_workers = inner.config.max_workers,
        interval_s = inner.config.monitor_interval.as_secs_f64(),
        "worker monitor started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.config.monitor_interval) => {}
            _ = inner.stop.cancelled() => break,
        }

        let active = inner.active_workers.load(Ordering::SeqCst);
        let pending = match db::requests::count_pending(&inner.pool).await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = ?err, "monitor failed to read queue depth");
                continue;
            }
        };

        if active == 0 && pending == 0 {
            info!("worker monitor exiting: no workers and no pending requests");
            break;
        }
        if pending == 0 || active >= inner.config.max_workers {
            continue;
        }

        let rate = inner.limiter.current_rate().await;
        if rate > 2.0 * active as f64 {
            if spawn_tx.send(()).await.is_err() {
                break;
            }
            info!(active = active + 1, rate, pending, "scaling up workers");
            inner
                .emit(
                    ProgressKind::WorkerScaled,
                    json!({
                        "active_workers": active + 1,
                        "current_rate": rate,
                        "pending_requests": pending,
                    }),
                )
                .await;
        } else {
            debug!(rate, active, "no scale-up: bucket cannot feed more workers");
        }
    }

    info!("worker monitor stopped");
}
