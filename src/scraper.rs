//! The scraper interface consumed by the driver.
//!
//! A scraper publishes its entry points through explicit registration
//! metadata ([`EntrySpec`]) rather than reflection, seeds the queue from
//! selected invocations, and resumes continuations by name.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;
use crate::types::{Request, Response, ScraperYield};

/// Decorator-style metadata for a speculative entry: what was observed about
/// the endpoint's id space when the scraper was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculateMetadata {
    pub observation_date: Option<NaiveDate>,
    /// Highest id known to exist; the default seeding ceiling.
    pub highest_observed: i64,
    /// Largest run of missing ids ever observed; the default `plus` window.
    pub largest_observed_gap: i64,
}

/// Per-entry speculation overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeculateConfig {
    /// Seed exactly this id range instead of `[1, highest_observed]`.
    pub definite_range: Option<(i64, i64)>,
    /// Forward-probing window; falls back to `largest_observed_gap`.
    pub plus: Option<i64>,
}

/// One registered entry point.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub name: String,
    pub speculative: bool,
    pub metadata: Option<SpeculateMetadata>,
    pub config: SpeculateConfig,
}

impl EntrySpec {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            speculative: false,
            metadata: None,
            config: SpeculateConfig::default(),
        }
    }

    pub fn speculative(name: impl Into<String>, metadata: SpeculateMetadata) -> Self {
        Self {
            name: name.into(),
            speculative: true,
            metadata: Some(metadata),
            config: SpeculateConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SpeculateConfig) -> Self {
        self.config = config;
        self
    }
}

/// A user-selected entry with parameter bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub entry: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Invocation {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Declarative `(count, interval)` limit used to derive the initial token
/// bucket rate.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub count: u32,
    pub interval: Duration,
}

impl RateLimit {
    pub fn per_second(&self) -> f64 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            return f64::INFINITY;
        }
        f64::from(self.count) / secs
    }
}

/// A scraper: navigation expressed as typed yields, driven to completion by
/// the runtime.
///
/// Continuations return eagerly-built yield sequences; memory cost is
/// bounded by one continuation's emissions.
pub trait Scraper: Send + Sync + 'static {
    /// Stable name recorded in run metadata.
    fn name(&self) -> &str;

    fn version(&self) -> Option<&str> {
        None
    }

    /// Registered entry points. May be empty, in which case `seed` is called
    /// with no invocations and decides on its own.
    fn entries(&self) -> Vec<EntrySpec> {
        Vec::new()
    }

    /// Produce the initial request stream for the selected entries.
    fn seed(&self, invocations: &[Invocation]) -> Result<Vec<Request>, ScrapeError>;

    /// Run the named continuation against a fetched response.
    fn continuation(
        &self,
        name: &str,
        response: &Response,
    ) -> Result<Vec<ScraperYield>, ScrapeError>;

    /// Build the request probing `entry` at integer `id`. Required only for
    /// scrapers with speculative entries.
    fn speculate(&self, entry: &str, id: i64) -> Option<Request> {
        let _ = (entry, id);
        None
    }

    /// Distinguish true successes from soft-404s on speculative responses.
    /// Return `false` when a 2xx response is actually a miss.
    fn fails_successfully(&self, response: &Response) -> bool {
        let _ = response;
        true
    }

    /// Declarative limits used to derive the initial rate.
    fn rate_limits(&self) -> Vec<RateLimit> {
        Vec::new()
    }

    /// Hook for TLS or proxy configuration on the HTTP client.
    fn customize_http(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        builder
    }
}

/// Default invocations: every non-speculative entry, no parameters.
pub(crate) fn default_invocations(entries: &[EntrySpec]) -> Vec<Invocation> {
    entries
        .iter()
        .filter(|e| !e.speculative)
        .map(|e| Invocation::new(e.name.clone()))
        .collect()
}
