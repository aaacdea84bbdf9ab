//! The public driver API: listing, cancellation, requeue, run lifecycle
//! and progress events.

#[allow(dead_code)]
mod helpers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use helpers::{MockServer, SingleFetchScraper, TwoHopScraper};
use trawl::db::requests::RequestStatus;
use trawl::driver::{Driver, RunState};
use trawl::error::ErrorKind;
use trawl::Callbacks;

// ── listing & pagination ────────────────────────────────────────────────

#[tokio::test]
async fn listing_supports_pagination_and_filters() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();

    let all = driver.list_requests(None, None, 0, 50).await.unwrap();
    assert_eq!(all.total, 4);

    let first_two = driver.list_requests(None, None, 0, 2).await.unwrap();
    assert_eq!(first_two.items.len(), 2);
    assert_eq!(first_two.total, 4);
    let rest = driver.list_requests(None, None, 2, 2).await.unwrap();
    assert_eq!(rest.items.len(), 2);
    assert_ne!(first_two.items[0].id, rest.items[0].id);

    let details = driver
        .list_requests(Some(RequestStatus::Completed), Some("parse_detail"), 0, 50)
        .await
        .unwrap();
    assert_eq!(details.total, 3);

    let none = driver
        .list_requests(Some(RequestStatus::Pending), None, 0, 50)
        .await
        .unwrap();
    assert_eq!(none.total, 0);

    driver.close().await.unwrap();
}

// ── cancellation ────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_before_run_processes_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let driver = Driver::open(
        Arc::new(SingleFetchScraper {
            url: server.url("/ok"),
        }),
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();

    driver.stop();
    driver.run(false).await.unwrap();

    assert!(server.log().is_empty(), "no fetches after early stop");
    assert_eq!(driver.list_requests(None, None, 0, 10).await.unwrap().total, 0);
    assert_eq!(driver.list_errors(None, None, true, 0, 10).await.unwrap().total, 0);

    let run = trawl::db::runs::get_run(driver.pool(), 1).await.unwrap().unwrap();
    assert_eq!(run.status, "interrupted");

    driver.close().await.unwrap();
}

#[tokio::test]
async fn cancel_pending_requests_by_continuation() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();

    // Pending rows that never run, inserted by hand
    for i in 0..3 {
        sqlx::query(
            "INSERT INTO requests (queue_counter, request_type, method, url, continuation,
                                   priority, created_at)
             VALUES (?1, 'navigating', 'GET', ?2, 'parse_detail', 9, 0)",
        )
        .bind(100 + i)
        .bind(format!("http://x/detail/{i}"))
        .execute(driver.pool())
        .await
        .unwrap();
    }

    let cancelled = driver
        .cancel_requests_by_continuation("parse_detail")
        .await
        .unwrap();
    assert_eq!(cancelled, 3);

    let failed = driver
        .list_requests(Some(RequestStatus::Failed), None, 0, 10)
        .await
        .unwrap();
    assert_eq!(failed.total, 3);
    assert!(failed
        .items
        .iter()
        .all(|r| r.last_error.as_deref() == Some("cancelled")));

    // Unknown ids cancel nothing
    assert!(!driver.cancel_request(999).await.unwrap());

    driver.close().await.unwrap();
}

// ── requeue workflow ────────────────────────────────────────────────────

#[tokio::test]
async fn requeue_error_clones_request_and_resolves_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = helpers::test_config();
    config.max_backoff_time = Duration::from_millis(200);

    let driver = Driver::open(
        Arc::new(SingleFetchScraper {
            url: server.url("/always500"),
        }),
        dir.path().join("run.db"),
        config,
        Callbacks::new(),
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();

    let errors = driver
        .list_errors(Some(ErrorKind::Transient), None, true, 0, 10)
        .await
        .unwrap();
    assert_eq!(errors.total, 1);
    let error = &errors.items[0];
    let original_id = error.request_id.unwrap();

    let new_id = driver.requeue_error(error.id).await.unwrap().unwrap();
    assert_ne!(new_id, original_id);

    let clone = driver.get_request(new_id).await.unwrap().unwrap();
    assert_eq!(clone.status, "pending");
    assert_eq!(clone.parent_id, Some(original_id));
    assert_eq!(clone.retry_count, 0);

    // The error is now resolved with a back-reference
    let resolved = driver.list_errors(None, None, true, 0, 10).await.unwrap();
    assert_eq!(resolved.total, 0, "no unresolved errors left");
    let record = trawl::db::errors::get_error(driver.pool(), error.id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_resolved);
    assert!(record
        .resolution_notes
        .as_deref()
        .unwrap()
        .contains(&new_id.to_string()));

    // Requeueing the same error again is a no-op (already resolved)
    let again = driver.requeue_errors_by_type(Some(ErrorKind::Transient), None).await.unwrap();
    assert!(again.is_empty());

    driver.close().await.unwrap();
}

// ── resume idempotence ──────────────────────────────────────────────────

#[tokio::test]
async fn rerun_after_completion_is_a_noop() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("run.db");

    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        &db_path,
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();
    driver.close().await.unwrap();

    let fetches_after_first = server.log().len();

    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        &db_path,
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();
    assert_eq!(driver.status().await.unwrap(), RunState::Done);

    driver.run(false).await.unwrap();
    assert_eq!(server.log().len(), fetches_after_first, "no new fetches");
    assert_eq!(driver.list_requests(None, None, 0, 50).await.unwrap().total, 4);
    assert_eq!(driver.status().await.unwrap(), RunState::Done);

    driver.close().await.unwrap();
}

// ── progress events ─────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_cover_the_lifecycle() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callbacks = Callbacks::new().on_progress(move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.kind.as_str().to_string());
        }
    });

    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        dir.path().join("run.db"),
        helpers::test_config(),
        callbacks,
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();
    driver.close().await.unwrap();

    let events = seen.lock().unwrap().clone();
    for expected in [
        "run_started",
        "request_enqueued",
        "request_started",
        "request_completed",
        "run_completed",
    ] {
        assert!(
            events.iter().any(|e| e == expected),
            "missing {expected} in {events:?}"
        );
    }
    assert_eq!(events.iter().filter(|e| *e == "request_enqueued").count(), 4);
    assert_eq!(events.iter().filter(|e| *e == "request_completed").count(), 4);
    assert_eq!(events.first().map(String::as_str), Some("run_started"));
    assert_eq!(events.last().map(String::as_str), Some("run_completed"));
}

#[tokio::test]
async fn run_with_monitor_enabled_still_terminates() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = helpers::test_config();
    config.enable_monitor = true;
    config.monitor_interval = Duration::from_millis(50);
    config.max_workers = 3;

    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        dir.path().join("run.db"),
        config,
        Callbacks::new(),
    )
    .await
    .unwrap();

    driver.run(false).await.unwrap();
    assert_eq!(driver.status().await.unwrap(), RunState::Done);
    driver.close().await.unwrap();
}

// ── limiter snapshot ────────────────────────────────────────────────────

#[tokio::test]
async fn limiter_snapshot_reflects_traffic() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let driver = Driver::open(
        Arc::new(TwoHopScraper {
            base: server.url(""),
        }),
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();

    let snapshot = driver.limiter_snapshot().await;
    assert_eq!(snapshot.total_requests, 4);
    assert_eq!(snapshot.total_successes, 4);
    assert_eq!(snapshot.status, "healthy");
    assert!((snapshot.success_rate() - 100.0).abs() < 1e-9);

    driver.close().await.unwrap();
}
