//! Shared test scaffolding: an in-process mock HTTP server and scrapers
//! exercising each driver path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use trawl::config::DriverConfig;
use trawl::error::ScrapeError;
use trawl::scraper::{EntrySpec, Invocation, Scraper, SpeculateConfig, SpeculateMetadata};
use trawl::types::{Estimate, ParsedData, Request, Response, ScraperYield};

// ── mock server ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ServerState {
    /// Paths in arrival order, for completion-order assertions.
    pub request_log: Mutex<Vec<String>>,
    /// How many times /flaky should still fail before succeeding.
    pub flaky_failures: AtomicUsize,
    /// Highest /case/{id} that returns 200.
    pub case_ceiling: AtomicUsize,
}

impl ServerState {
    fn log(&self, path: String) {
        self.request_log.lock().unwrap().push(path);
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl MockServer {
    pub async fn start() -> Self {
        trawl::logging::setup_logging("info");
        let state = Arc::new(ServerState {
            flaky_failures: AtomicUsize::new(1),
            case_ceiling: AtomicUsize::new(7),
            ..ServerState::default()
        });

        let app = Router::new()
            .route("/listing", get(listing))
            .route("/detail/{id}", get(detail))
            .route("/index", get(index))
            .route("/files/{name}", get(file))
            .route("/flaky", get(flaky))
            .route("/always500", get(always_500))
            .route("/case/{id}", get(case))
            .route("/a", get(page_a))
            .route("/b", get(page_b))
            .route("/ok", get(ok).post(ok))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn log(&self) -> Vec<String> {
        self.state.request_log.lock().unwrap().clone()
    }
}

async fn listing(State(state): State<Arc<ServerState>>) -> Html<String> {
    state.log("/listing".into());
    Html(
        "<html><body><a href=\"/detail/0\">0</a>\
         <a href=\"/detail/1\">1</a><a href=\"/detail/2\">2</a></body></html>"
            .to_string(),
    )
}

async fn detail(State(state): State<Arc<ServerState>>, Path(id): Path<u32>) -> Html<String> {
    state.log(format!("/detail/{id}"));
    Html(format!(
        "<html><body><h1>Case {id}</h1><p>docket 24-cv-{id:04}</p></body></html>"
    ))
}

async fn index(State(state): State<Arc<ServerState>>) -> Html<String> {
    state.log("/index".into());
    Html("<html><body>index</body></html>".to_string())
}

async fn file(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> impl IntoResponse {
    state.log(format!("/files/{name}"));
    (
        [(axum::http::header::CONTENT_TYPE, "application/pdf")],
        format!("%PDF-1.4 fake body of {name}").into_bytes(),
    )
}

async fn flaky(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.log("/flaky".into());
    let remaining = state.flaky_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        state.flaky_failures.store(remaining - 1, Ordering::SeqCst);
        (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response()
    } else {
        (StatusCode::OK, "finally").into_response()
    }
}

async fn always_500(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.log("/always500".into());
    (StatusCode::INTERNAL_SERVER_ERROR, "nope")
}

async fn case(State(state): State<Arc<ServerState>>, Path(id): Path<usize>) -> impl IntoResponse {
    state.log(format!("/case/{id}"));
    if id <= state.case_ceiling.load(Ordering::SeqCst) {
        (StatusCode::OK, format!("case {id}")).into_response()
    } else {
        (StatusCode::NOT_FOUND, "no such case").into_response()
    }
}

async fn page_a(State(state): State<Arc<ServerState>>) -> Html<&'static str> {
    state.log("/a".into());
    Html("<a href=\"/b\">b</a>")
}

async fn page_b(State(state): State<Arc<ServerState>>) -> Html<&'static str> {
    state.log("/b".into());
    Html("<a href=\"/a\">a</a>")
}

async fn ok(State(state): State<Arc<ServerState>>) -> &'static str {
    state.log("/ok".into());
    "ok"
}

// ── driver config for fast tests ────────────────────────────────────────

/// Tight loops, generous bucket, no monitor: drivers exit promptly.
pub fn test_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.enable_monitor = false;
    config.poll_interval = Duration::from_millis(20);
    config.idle_grace = Duration::from_millis(200);
    config.retry_base_delay = Duration::from_millis(50);
    config.atb.bucket_size = 200.0;
    config.atb.initial_tokens = 200.0;
    config.atb.initial_rate = 40.0;
    config
}

// ── scrapers ────────────────────────────────────────────────────────────

/// /listing fans out to three /detail pages, each yielding one result.
pub struct TwoHopScraper {
    pub base: String,
}

impl Scraper for TwoHopScraper {
    fn name(&self) -> &str {
        "two_hop"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(
            format!("{}/listing", self.base),
            "parse_listing",
        )])
    }

    fn continuation(
        &self,
        name: &str,
        response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        match name {
            "parse_listing" => Ok((0..3)
                .map(|i| {
                    ScraperYield::Navigate(
                        Request::get(format!("/detail/{i}"), "parse_detail")
                            .accumulated("listing_url", json!(response.url.clone())),
                    )
                })
                .collect()),
            "parse_detail" => Ok(vec![ScraperYield::Data(ParsedData::value(
                "CaseSummary",
                json!({
                    "url": response.url,
                    "listing_url": response.request.accumulated_data.get("listing_url"),
                }),
            ))]),
            other => panic!("unexpected continuation {other}"),
        }
    }
}

/// /index yields three archive downloads and one navigating request.
pub struct ArchiveScraper {
    pub base: String,
}

impl Scraper for ArchiveScraper {
    fn name(&self) -> &str {
        "archiver"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(format!("{}/index", self.base), "parse_index")])
    }

    fn continuation(
        &self,
        name: &str,
        _response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        match name {
            "parse_index" => Ok(vec![
                ScraperYield::Archive(Request::get("/files/a.pdf", "after_archive").archive("pdf")),
                ScraperYield::Archive(Request::get("/files/b.pdf", "after_archive").archive("pdf")),
                ScraperYield::Archive(Request::get("/files/c.pdf", "after_archive").archive("pdf")),
                ScraperYield::Navigate(Request::get("/detail/9", "parse_detail")),
            ]),
            "after_archive" | "parse_detail" => Ok(Vec::new()),
            other => panic!("unexpected continuation {other}"),
        }
    }
}

/// /a links to /b which links back to /a; dedup keeps the cycle finite.
pub struct CycleScraper {
    pub base: String,
}

impl Scraper for CycleScraper {
    fn name(&self) -> &str {
        "cycle"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(format!("{}/a", self.base), "parse_page")])
    }

    fn continuation(
        &self,
        _name: &str,
        response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        let next = if response.url.ends_with("/a") { "/b" } else { "/a" };
        Ok(vec![ScraperYield::Navigate(Request::get(next, "parse_page"))])
    }
}

/// Single fetch of a URL with an empty continuation.
pub struct SingleFetchScraper {
    pub url: String,
}

impl Scraper for SingleFetchScraper {
    fn name(&self) -> &str {
        "single_fetch"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(self.url.clone(), "done")])
    }

    fn continuation(
        &self,
        _name: &str,
        _response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        Ok(Vec::new())
    }
}

/// No entries at all.
pub struct EmptyScraper;

impl Scraper for EmptyScraper {
    fn name(&self) -> &str {
        "empty"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(Vec::new())
    }

    fn continuation(
        &self,
        _name: &str,
        _response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        Ok(Vec::new())
    }
}

/// Speculative exploration of /case/{id}.
pub struct CaseNumberScraper {
    pub base: String,
    pub plus: Option<i64>,
    pub highest_observed: i64,
}

impl Scraper for CaseNumberScraper {
    fn name(&self) -> &str {
        "case_numbers"
    }

    fn entries(&self) -> Vec<EntrySpec> {
        vec![EntrySpec::speculative(
            "by_case_number",
            SpeculateMetadata {
                observation_date: None,
                highest_observed: self.highest_observed,
                largest_observed_gap: 2,
            },
        )
        .with_config(SpeculateConfig {
            definite_range: None,
            plus: self.plus,
        })]
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(Vec::new())
    }

    fn speculate(&self, entry: &str, id: i64) -> Option<Request> {
        (entry == "by_case_number")
            .then(|| Request::get(format!("{}/case/{id}", self.base), "parse_case"))
    }

    fn continuation(
        &self,
        _name: &str,
        response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        if response.is_success() {
            Ok(vec![ScraperYield::Data(ParsedData::value(
                "Case",
                json!({"url": response.url}),
            ))])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Fails its continuation with a structural mismatch.
pub struct StructuralFailureScraper {
    pub url: String,
}

impl Scraper for StructuralFailureScraper {
    fn name(&self) -> &str {
        "structural_failure"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(self.url.clone(), "parse")])
    }

    fn continuation(
        &self,
        _name: &str,
        response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        Err(ScrapeError::Structural(trawl::error::StructuralMismatch {
            selector: "//table[@id='cases']".into(),
            selector_type: trawl::SelectorKind::Xpath,
            description: "case table".into(),
            expected_min: 1,
            expected_max: None,
            actual_count: 0,
            request_url: response.url.clone(),
        }))
    }
}

/// Yields deferred data that fails validation.
pub struct InvalidDataScraper {
    pub url: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct StrictCase {
    pub docket: String,
    pub year: i64,
}

impl Scraper for InvalidDataScraper {
    fn name(&self) -> &str {
        "invalid_data"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(self.url.clone(), "parse")])
    }

    fn continuation(
        &self,
        _name: &str,
        _response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        let deferred = trawl::validate::Deferred::<StrictCase>::new(json!({
            "docket": "24-1",
            "year": "twenty-twenty-four",
        }));
        Ok(vec![
            ScraperYield::Estimate(Estimate {
                expected_types: vec!["StrictCase".into()],
                min_count: 1,
                max_count: Some(1),
            }),
            ScraperYield::Data(ParsedData::deferred(deferred)),
        ])
    }
}

/// Yields two POSTs with different bodies and one exact duplicate.
pub struct PostingScraper {
    pub base: String,
}

impl Scraper for PostingScraper {
    fn name(&self) -> &str {
        "poster"
    }

    fn seed(&self, _invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError> {
        Ok(vec![Request::get(format!("{}/ok", self.base), "fan_out")])
    }

    fn continuation(
        &self,
        name: &str,
        _response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError> {
        match name {
            "fan_out" => Ok(vec![
                ScraperYield::Fetch(
                    Request::post_json("/ok", "sink", json!({"page": 1})).non_navigating(),
                ),
                ScraperYield::Fetch(
                    Request::post_json("/ok", "sink", json!({"page": 2})).non_navigating(),
                ),
                // Exact duplicate of the first; dedup must drop it
                ScraperYield::Fetch(
                    Request::post_json("/ok", "sink", json!({"page": 1})).non_navigating(),
                ),
            ]),
            _ => Ok(Vec::new()),
        }
    }
}

