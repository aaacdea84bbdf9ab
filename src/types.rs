//! Request/response types and the scraper yield algebra.
//!
//! Continuations are stored by name, never by closure, so every request can
//! round-trip through the database. Yield variants are matched exhaustively
//! by the dispatcher.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationFailure;

/// HTTP method of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Patch => "PATCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "PATCH" => Some(HttpMethod::Patch),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body. JSON bodies serialize with sorted keys, which keeps the
/// canonical form stable for dedup keys and cache keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    /// Canonical byte form used for dedup keys, cache keys and the wire.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Body::Bytes(b) => b.clone(),
            // serde_json maps are BTreeMaps, so key order is already sorted
            Body::Json(v) => v.to_string().into_bytes(),
        }
    }
}

/// The HTTP half of a queued request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestParams {
    pub method: HttpMethod,
    pub url: String,
    /// Query parameters folded into the URL (sorted by key) at enqueue.
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: Option<Body>,
}

impl HttpRequestParams {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: None,
        }
    }
}

/// Sticky headers/cookies that merge parent→child down a request chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permanent {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl Permanent {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty()
    }

    /// Merge `parent` under `self`; keys already present here win.
    pub fn inherit(&mut self, parent: &Permanent) {
        for (k, v) in &parent.headers {
            self.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &parent.cookies {
            self.cookies.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Deduplication behavior for one enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dedup {
    /// Derive the key from `(method, url, canonical body)`.
    Auto,
    /// User-supplied key.
    Key(String),
    /// Sentinel that bypasses the duplicate check entirely.
    Skip,
}

/// How a request is dispatched and which context resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Navigating,
    NonNavigating,
    Archive,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Navigating => "navigating",
            RequestKind::NonNavigating => "non_navigating",
            RequestKind::Archive => "archive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "navigating" => Some(RequestKind::Navigating),
            "non_navigating" => Some(RequestKind::NonNavigating),
            "archive" => Some(RequestKind::Archive),
            _ => None,
        }
    }
}

/// Identity of a speculative request: the entry name plus the probed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationId {
    pub entry: String,
    pub id: i64,
}

/// Default priority for navigating and non-navigating requests.
pub const DEFAULT_NAV_PRIORITY: i64 = 9;
/// Archive downloads jump the queue.
pub const DEFAULT_ARCHIVE_PRIORITY: i64 = 1;

pub type DataMap = serde_json::Map<String, serde_json::Value>;

/// The unit of queued work.
///
/// Built by scraper code through the constructors below, resolved against a
/// context at enqueue time (URL resolution, state inheritance), then
/// serialized into the `requests` table.
#[derive(Debug, Clone)]
pub struct Request {
    pub http: HttpRequestParams,
    pub kind: RequestKind,
    /// Name of the scraper method that resumes with this request's response.
    pub continuation: String,
    pub current_location: Option<String>,
    /// Extracted case state carried across hops; owned per request so
    /// siblings never share.
    pub accumulated_data: DataMap,
    /// Navigation metadata (tokens, session hints), same ownership rules.
    pub aux_data: DataMap,
    pub permanent: Permanent,
    /// Low number = high priority.
    pub priority: i64,
    /// Archive only: hint about the downloaded file type (pdf, audio, ...).
    pub expected_type: Option<String>,
    pub dedup: Dedup,
    pub is_speculative: bool,
    pub speculation_id: Option<SpeculationId>,
}

impl Request {
    fn new(method: HttpMethod, url: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            http: HttpRequestParams::new(method, url),
            kind: RequestKind::Navigating,
            continuation: continuation.into(),
            current_location: None,
            accumulated_data: DataMap::new(),
            aux_data: DataMap::new(),
            permanent: Permanent::default(),
            priority: DEFAULT_NAV_PRIORITY,
            expected_type: None,
            dedup: Dedup::Auto,
            is_speculative: false,
            speculation_id: None,
        }
    }

    /// A navigating GET request.
    pub fn get(url: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url, continuation)
    }

    /// A navigating POST request with a JSON body.
    pub fn post_json(
        url: impl Into<String>,
        continuation: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        let mut r = Self::new(HttpMethod::Post, url, continuation);
        r.http.body = Some(Body::Json(body));
        r
    }

    /// A navigating POST request with a raw byte body.
    pub fn post_bytes(
        url: impl Into<String>,
        continuation: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        let mut r = Self::new(HttpMethod::Post, url, continuation);
        r.http.body = Some(Body::Bytes(body));
        r
    }

    /// Mark as non-navigating: resolved against the originating request
    /// rather than the response URL.
    pub fn non_navigating(mut self) -> Self {
        self.kind = RequestKind::NonNavigating;
        self
    }

    /// Mark as an archive download with the given expected file type.
    pub fn archive(mut self, expected_type: impl Into<String>) -> Self {
        self.kind = RequestKind::Archive;
        self.expected_type = Some(expected_type.into());
        self.priority = DEFAULT_ARCHIVE_PRIORITY;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.headers.insert(name.into(), value.into());
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.cookies.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.params.insert(name.into(), value.into());
        self
    }

    pub fn accumulated(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.accumulated_data.insert(key.into(), value);
        self
    }

    pub fn accumulated_map(mut self, map: DataMap) -> Self {
        self.accumulated_data = map;
        self
    }

    pub fn aux(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.aux_data.insert(key.into(), value);
        self
    }

    pub fn permanent_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.permanent.headers.insert(name.into(), value.into());
        self
    }

    pub fn permanent_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.permanent.cookies.insert(name.into(), value.into());
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup = Dedup::Key(key.into());
        self
    }

    pub fn skip_dedup(mut self) -> Self {
        self.dedup = Dedup::Skip;
        self
    }

    /// Tag as a speculative probe for `entry` at `id`.
    pub fn speculative(mut self, entry: impl Into<String>, id: i64) -> Self {
        self.is_speculative = true;
        self.speculation_id = Some(SpeculationId {
            entry: entry.into(),
            id,
        });
        self
    }

    /// Effective headers for the wire: sticky headers under explicit ones.
    pub fn effective_headers(&self) -> BTreeMap<String, String> {
        let mut out = self.permanent.headers.clone();
        for (k, v) in &self.http.headers {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Effective cookies for the wire, same precedence as headers.
    pub fn effective_cookies(&self) -> BTreeMap<String, String> {
        let mut out = self.permanent.cookies.clone();
        for (k, v) in &self.http.cookies {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Default dedup key: SHA-256 over method, URL and canonical body.
    pub fn derived_dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.http.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.http.url.as_bytes());
        hasher.update(b"\n");
        if let Some(body) = &self.http.body {
            hasher.update(body.canonical_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// A fetched page, attached to the request that produced it.
///
/// The stored row links back by `request_id`; the in-memory value owns a
/// copy of its [`Request`] so continuations can read carried state.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// URL after redirects.
    pub url: String,
    pub request: Request,
    pub request_id: Option<i64>,
    /// Archive downloads: where the callback stored the file.
    pub file_path: Option<PathBuf>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Holder of raw fields whose schema check is deferred until the driver
/// calls `confirm`, at most once per result.
pub trait DeferredValidation: Send + Sync {
    fn model_name(&self) -> &str;
    fn raw_fields(&self) -> serde_json::Value;
    fn confirm(&self) -> Result<serde_json::Value, ValidationFailure>;
}

/// Extracted data yielded by a continuation.
pub enum ParsedData {
    /// Already-shaped data under a symbolic type name.
    Value {
        result_type: String,
        data: serde_json::Value,
    },
    /// Validation deferred to the driver.
    Deferred(Box<dyn DeferredValidation>),
}

impl ParsedData {
    pub fn value(result_type: impl Into<String>, data: serde_json::Value) -> Self {
        ParsedData::Value {
            result_type: result_type.into(),
            data,
        }
    }

    pub fn deferred(deferred: impl DeferredValidation + 'static) -> Self {
        ParsedData::Deferred(Box::new(deferred))
    }
}

impl fmt::Debug for ParsedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedData::Value { result_type, .. } => {
                f.debug_struct("ParsedData::Value").field("result_type", result_type).finish()
            }
            ParsedData::Deferred(d) => f
                .debug_struct("ParsedData::Deferred")
                .field("model_name", &d.model_name())
                .finish(),
        }
    }
}

/// Yield-count hint persisted for the UI surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub expected_types: Vec<String>,
    pub min_count: i64,
    pub max_count: Option<i64>,
}

/// The bounded algebra a continuation may emit.
#[derive(Debug)]
pub enum ScraperYield {
    /// Enqueue, resolved against the triggering response's URL.
    Navigate(Request),
    /// Enqueue, resolved against the originating request (non-navigating).
    Fetch(Request),
    /// Enqueue a file download, resolved against the response URL.
    Archive(Request),
    /// Store a result and hand it to the user callback.
    Data(ParsedData),
    /// Persist a yield-count hint.
    Estimate(Estimate),
}
