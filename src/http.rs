//! HTTP transport behind the [`RequestManager`] trait.
//!
//! The driver only ever talks to the trait, so tests swap in scripted
//! transports without a network.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use tracing::trace;

use crate::error::{Result, ScrapeError};
use crate::types::{Body, Request, Response};

/// Resolves a request into a response. Timeouts must surface as
/// [`ScrapeError::Transient`]; status codes are returned as-is for the rate
/// limiter to interpret.
#[async_trait]
pub trait RequestManager: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed transport.
pub struct HttpRequestManager {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpRequestManager {
    /// Build a client. A zero timeout disables the per-request deadline.
    /// `customize` is the scraper's TLS/proxy hook.
    pub fn new(
        timeout: Duration,
        customize: impl FnOnce(reqwest::ClientBuilder) -> reqwest::ClientBuilder,
    ) -> Result<Self> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = customize(builder).build()?;
        Ok(Self { client, timeout })
    }

    fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid header name '{name}': {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid header value for '{name:?}': {e}"))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl RequestManager for HttpRequestManager {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let method = reqwest::Method::from_bytes(request.http.method.as_str().as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid method: {e}"))?;

        let mut builder = self
            .client
            .request(method, &request.http.url)
            .headers(Self::header_map(&request.effective_headers())?);

        let cookies = request.effective_cookies();
        if !cookies.is_empty() {
            let cookie_header = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookie_header);
        }

        match &request.http.body {
            Some(Body::Bytes(bytes)) => builder = builder.body(bytes.clone()),
            Some(Body::Json(value)) => builder = builder.json(value),
            None => {}
        }

        trace!(method = %request.http.method, url = %request.http.url, "fetching");

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                let seconds = self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
                anyhow::Error::new(ScrapeError::timeout(seconds, request.http.url.clone()))
            } else {
                anyhow::Error::new(err).context("HTTP request failed")
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    let seconds = self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
                    anyhow::Error::new(ScrapeError::timeout(seconds, request.http.url.clone()))
                } else {
                    anyhow::Error::new(err).context("reading response body failed")
                }
            })?
            .to_vec();

        Ok(Response {
            status,
            headers,
            body,
            url: final_url,
            request: request.clone(),
            request_id: None,
            file_path: None,
        })
    }
}
