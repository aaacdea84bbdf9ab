//! Deferred schema validation for scraped data.
//!
//! [`Deferred`] holds raw JSON fields and a target type; validation runs
//! when the driver calls `confirm`, producing per-field error paths via
//! `serde_path_to_error`.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{FieldError, ValidationFailure};
use crate::types::DeferredValidation;

/// Deferred validation against a serde model `T`.
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use trawl::validate::Deferred;
///
/// #[derive(Serialize, Deserialize)]
/// struct CaseSummary {
///     docket: String,
///     filed_year: i64,
/// }
///
/// let raw = serde_json::json!({"docket": "24-cv-0001", "filed_year": 2024});
/// let deferred = Deferred::<CaseSummary>::new(raw);
/// ```
pub struct Deferred<T> {
    raw: serde_json::Value,
    request_url: String,
    _model: PhantomData<fn() -> T>,
}

impl<T> Deferred<T> {
    pub fn new(raw: serde_json::Value) -> Self {
        Self {
            raw,
            request_url: String::new(),
            _model: PhantomData,
        }
    }

    /// Attach the URL that produced this data, for error reporting.
    pub fn with_request_url(mut self, url: impl Into<String>) -> Self {
        self.request_url = url.into();
        self
    }
}

/// Short type name without the module path.
fn model_name_of<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

impl<T> DeferredValidation for Deferred<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    fn model_name(&self) -> &str {
        model_name_of::<T>()
    }

    fn raw_fields(&self) -> serde_json::Value {
        self.raw.clone()
    }

    fn confirm(&self) -> Result<serde_json::Value, ValidationFailure> {
        let validated: T = serde_path_to_error::deserialize(self.raw.clone()).map_err(|err| {
            let loc = err.path().to_string();
            let msg = err.inner().to_string();
            ValidationFailure {
                model_name: model_name_of::<T>().to_string(),
                errors: vec![FieldError { loc, msg }],
                failed_doc: self.raw.clone(),
                request_url: self.request_url.clone(),
            }
        })?;
        // Re-serialize so the stored result is the normalized document.
        serde_json::to_value(&validated).map_err(|err| ValidationFailure {
            model_name: model_name_of::<T>().to_string(),
            errors: vec![FieldError {
                loc: ".".to_string(),
                msg: err.to_string(),
            }],
            failed_doc: self.raw.clone(),
            request_url: self.request_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Docket {
        number: String,
        year: i64,
    }

    #[test]
    fn confirm_passes_valid_document() {
        let deferred = Deferred::<Docket>::new(json!({"number": "24-1", "year": 2024}));
        let value = deferred.confirm().unwrap();
        assert_eq!(value, json!({"number": "24-1", "year": 2024}));
        assert_eq!(deferred.model_name(), "Docket");
    }

    #[test]
    fn confirm_reports_field_path() {
        let deferred = Deferred::<Docket>::new(json!({"number": "24-1", "year": "not a year"}))
            .with_request_url("http://court.example/24-1");
        let failure = deferred.confirm().unwrap_err();
        assert_eq!(failure.model_name, "Docket");
        assert_eq!(failure.errors.len(), 1);
        assert_eq!(failure.errors[0].loc, "year");
        assert_eq!(failure.request_url, "http://court.example/24-1");
        assert_eq!(failure.failed_doc["number"], "24-1");
    }

    #[test]
    fn confirm_reports_missing_field() {
        let deferred = Deferred::<Docket>::new(json!({"number": "24-1"}));
        let failure = deferred.confirm().unwrap_err();
        assert!(failure.errors[0].msg.contains("year"));
    }
}
