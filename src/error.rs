//! Error taxonomy for the crawl runtime.
//!
//! Scraper-visible failures are the [`ScrapeError`] sum type; driver
//! internals carry them inside `anyhow::Error` and classify by downcast.

use serde::Serialize;
use std::fmt;

/// Result alias used throughout the driver internals.
pub type Result<T> = anyhow::Result<T>;

/// Classification stored in error rows and used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A selector-count assumption failed. Non-transient.
    Structural,
    /// Schema validation on deferred data failed. Non-transient.
    Validation,
    /// Retryable HTTP failure or timeout; enters the backoff machine.
    Transient,
    /// Anything else. Non-transient.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selector kind for structural errors and observer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    Xpath,
    Css,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::Xpath => "xpath",
            SelectorKind::Css => "css",
        }
    }
}

/// A selector returned a different number of matches than the scraper assumed.
#[derive(Debug, Clone, Serialize)]
pub struct StructuralMismatch {
    pub selector: String,
    pub selector_type: SelectorKind,
    pub description: String,
    pub expected_min: u32,
    pub expected_max: Option<u32>,
    pub actual_count: u32,
    pub request_url: String,
}

impl StructuralMismatch {
    fn expected_str(&self) -> String {
        match self.expected_max {
            None => format!("at least {}", self.expected_min),
            Some(max) if max == self.expected_min => format!("exactly {}", self.expected_min),
            Some(max) => format!("between {} and {}", self.expected_min, max),
        }
    }
}

impl fmt::Display for StructuralMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "structure mismatch: expected {} matches for '{}' ({} {}), found {}",
            self.expected_str(),
            self.description,
            self.selector_type.as_str(),
            self.selector,
            self.actual_count
        )
    }
}

/// One field-level validation error.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    /// Path to the offending field, e.g. `cases[3].filed_date`.
    pub loc: String,
    pub msg: String,
}

/// Deferred data failed schema validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationFailure {
    pub model_name: String,
    pub errors: Vec<FieldError>,
    /// The raw document that failed, persisted alongside the invalid result.
    pub failed_doc: serde_json::Value,
    pub request_url: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.loc, e.msg))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "validation failed for model '{}': {}",
            self.model_name, summary
        )
    }
}

/// Retryable failure detail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransientError {
    /// Server answered with a retryable status (408, 425, 429 or 5xx).
    HttpStatus(u16),
    /// The HTTP client gave up waiting.
    Timeout { seconds: f64 },
}

impl fmt::Display for TransientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientError::HttpStatus(status) => write!(f, "HTTP status {status}"),
            TransientError::Timeout { seconds } => {
                write!(f, "request timed out after {seconds:.1}s")
            }
        }
    }
}

/// Scraper-visible failure, tagged by how the driver must react.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScrapeError {
    #[error("{0}")]
    Structural(StructuralMismatch),
    #[error("{0}")]
    Validation(ValidationFailure),
    #[error("transient failure: {detail} ({url})")]
    Transient { detail: TransientError, url: String },
}

impl ScrapeError {
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        ScrapeError::Transient {
            detail: TransientError::HttpStatus(status),
            url: url.into(),
        }
    }

    pub fn timeout(seconds: f64, url: impl Into<String>) -> Self {
        ScrapeError::Transient {
            detail: TransientError::Timeout { seconds },
            url: url.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Structural(_) => ErrorKind::Structural,
            ScrapeError::Validation(_) => ErrorKind::Validation,
            ScrapeError::Transient { .. } => ErrorKind::Transient,
        }
    }
}

/// Whether a status code routes into the retry machine.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// Classify an arbitrary driver error for storage and propagation.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    match err.downcast_ref::<ScrapeError>() {
        Some(e) => e.kind(),
        None => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        for status in [408, 425, 429, 500, 502, 503, 504, 599] {
            assert!(is_transient_status(status), "{status} should be transient");
        }
        for status in [200, 301, 400, 403, 404, 410] {
            assert!(!is_transient_status(status), "{status} should not be transient");
        }
    }

    #[test]
    fn classify_downcasts_scrape_errors() {
        let err = anyhow::Error::new(ScrapeError::http_status(503, "http://x/"));
        assert_eq!(classify(&err), ErrorKind::Transient);

        let err = anyhow::anyhow!("something else entirely");
        assert_eq!(classify(&err), ErrorKind::Unknown);
    }

    #[test]
    fn structural_display_mentions_counts() {
        let mismatch = StructuralMismatch {
            selector: "//tr".into(),
            selector_type: SelectorKind::Xpath,
            description: "case rows".into(),
            expected_min: 1,
            expected_max: None,
            actual_count: 0,
            request_url: "http://example.com/cases".into(),
        };
        let text = mismatch.to_string();
        assert!(text.contains("at least 1"));
        assert!(text.contains("found 0"));
    }
}
