//! End-to-end navigation flows: fan-out with lineage, archive priority,
//! and the empty scraper.

#[allow(dead_code)]
mod helpers;

use std::sync::Arc;

use helpers::{ArchiveScraper, EmptyScraper, MockServer, TwoHopScraper};
use trawl::db::requests::RequestStatus;
use trawl::driver::{Driver, RunState};
use trawl::Callbacks;

// ── two-hop scrape ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_hop_scrape_builds_lineage_and_results() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let scraper = Arc::new(TwoHopScraper {
        base: server.url(""),
    });

    let driver = Driver::open(
        scraper,
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();

    driver.run(false).await.unwrap();

    // 4 rows total: the listing plus three details
    let page = driver.list_requests(None, None, 0, 50).await.unwrap();
    assert_eq!(page.total, 4);
    let listing = page
        .items
        .iter()
        .find(|r| r.url.ends_with("/listing"))
        .expect("listing row");
    let details: Vec<_> = page
        .items
        .iter()
        .filter(|r| r.url.contains("/detail/"))
        .collect();
    assert_eq!(details.len(), 3);
    for detail in &details {
        assert_eq!(detail.status, "completed");
        assert_eq!(detail.parent_id, Some(listing.id), "lineage points at the listing");
    }

    // One result per detail page, carrying the inherited accumulated state
    let results = driver
        .list_results(Some("CaseSummary"), Some(true), 0, 50)
        .await
        .unwrap();
    assert_eq!(results.total, 3);
    for result in &results.items {
        let data: serde_json::Value = serde_json::from_str(&result.data_json).unwrap();
        assert!(data["listing_url"].as_str().unwrap().ends_with("/listing"));
    }

    assert_eq!(driver.status().await.unwrap(), RunState::Done);
    driver.close().await.unwrap();
}

#[tokio::test]
async fn responses_are_stored_and_retrievable() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let scraper = Arc::new(TwoHopScraper {
        base: server.url(""),
    });

    let driver = Driver::open(
        scraper,
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();
    driver.run(false).await.unwrap();

    let responses = driver
        .list_responses(Some("parse_detail"), 0, 50)
        .await
        .unwrap();
    assert_eq!(responses.total, 3);

    // Bodies decompress back to the page the server sent
    let view = driver
        .get_response(responses.items[0].id)
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(view.body).unwrap();
    assert!(text.contains("docket 24-cv-"));
    assert_eq!(view.record.status_code, 200);
    assert!(!view.record.warc_record_id.is_empty());

    driver.close().await.unwrap();
}

// ── archive priority ────────────────────────────────────────────────────

#[tokio::test]
async fn archives_complete_before_navigation() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let scraper = Arc::new(ArchiveScraper {
        base: server.url(""),
    });

    let mut config = helpers::test_config();
    config.num_workers = 1; // single worker makes completion order deterministic
    let driver = Driver::open(scraper, dir.path().join("run.db"), config, Callbacks::new())
        .await
        .unwrap();
    driver.run(false).await.unwrap();

    let log = server.log();
    let detail_pos = log.iter().position(|p| p.starts_with("/detail")).unwrap();
    let file_positions: Vec<_> = log
        .iter()
        .enumerate()
        .filter(|(_, p)| p.starts_with("/files/"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(file_positions.len(), 3);
    for pos in file_positions {
        assert!(
            pos < detail_pos,
            "archive fetches must precede the navigating request: {log:?}"
        );
    }

    // Archived file rows exist with real paths and hashes
    let files = trawl::db::responses::list_archived_files(driver.pool())
        .await
        .unwrap();
    assert_eq!(files.len(), 3);
    for file in &files {
        assert!(file.file_path.ends_with(".pdf"));
        assert!(std::fs::read(&file.file_path).unwrap().starts_with(b"%PDF"));
        assert!(file.file_size > 0);
        assert!(file.content_hash.is_some());
    }

    driver.close().await.unwrap();
}

// ── empty scraper ───────────────────────────────────────────────────────

#[tokio::test]
async fn empty_scraper_completes_with_zero_requests() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Driver::open(
        Arc::new(EmptyScraper),
        dir.path().join("run.db"),
        helpers::test_config(),
        Callbacks::new(),
    )
    .await
    .unwrap();

    driver.run(false).await.unwrap();

    assert_eq!(
        driver
            .list_requests(Some(RequestStatus::Pending), None, 0, 10)
            .await
            .unwrap()
            .total,
        0
    );
    assert_eq!(driver.status().await.unwrap(), RunState::Unstarted);
    driver.close().await.unwrap();
}
