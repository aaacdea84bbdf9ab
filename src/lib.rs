//! trawl — a resumable, observable, concurrency-controlled crawling runtime.
//!
//! A user-supplied [`scraper::Scraper`] expresses navigation as a sequence
//! of typed yields (requests to follow, data extracted, estimates); the
//! [`driver::Driver`] runs it to completion over a SQLite-backed priority
//! queue with deduplication and lineage, an adaptive token-bucket rate
//! limiter, exponential-backoff retries under a cumulative budget,
//! speculative exploration of integer-indexed endpoints, and a dynamically
//! scaled worker pool. Everything the run learns — responses (zstd
//! compressed, dictionary per continuation), results, errors, rate and
//! speculation state — persists, so an interrupted run resumes where it
//! stopped.

pub mod callbacks;
pub mod compression;
pub mod config;
pub mod db;
mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod http;
pub mod limiter;
pub mod logging;
pub mod observe;
mod queue;
pub mod retry;
pub mod scraper;
pub mod speculation;
pub mod types;
pub mod validate;
mod worker;

pub use callbacks::Callbacks;
pub use config::{AtbConfig, DriverConfig};
pub use driver::{Driver, ResponseView, RunState};
pub use error::{ErrorKind, ScrapeError, SelectorKind};
pub use events::{ProgressEvent, ProgressKind};
pub use scraper::{EntrySpec, Invocation, RateLimit, Scraper, SpeculateConfig, SpeculateMetadata};
pub use types::{
    Body, Dedup, Estimate, HttpMethod, ParsedData, Request, RequestKind, Response, ScraperYield,
};
