//! Scraper-yield dispatcher.
//!
//! Interprets the yield algebra exhaustively: request variants enqueue with
//! the right resolution context, parsed data goes through the deferred
//! validation gate into the results table and user callbacks, estimates
//! persist as hint rows.

use serde_json::json;

use crate::db;
use crate::driver::DriverInner;
use crate::error::{Result, ScrapeError};
use crate::queue::EnqueueContext;
use crate::types::{ParsedData, Request, RequestKind, Response, ScraperYield};

/// Route every yield of one continuation.
///
/// Ordering guarantee: yields enqueue in emission order within this call,
/// and the triggering response is already committed by the time this runs.
pub(crate) async fn process_yields(
    inner: &DriverInner,
    yields: Vec<ScraperYield>,
    response: &Response,
    parent_request: &Request,
    request_id: i64,
) -> Result<()> {
    for item in yields {
        match item {
            ScraperYield::Navigate(mut request) => {
                request.kind = RequestKind::Navigating;
                inner
                    .enqueue(request, EnqueueContext::Response(response), Some(request_id))
                    .await?;
            }
            ScraperYield::Fetch(mut request) => {
                request.kind = RequestKind::NonNavigating;
                inner
                    .enqueue(request, EnqueueContext::Request(parent_request), Some(request_id))
                    .await?;
            }
            ScraperYield::Archive(mut request) => {
                request.kind = RequestKind::Archive;
                inner
                    .enqueue(request, EnqueueContext::Response(response), Some(request_id))
                    .await?;
            }
            ScraperYield::Data(data) => {
                handle_data(inner, data, response, request_id).await?;
            }
            ScraperYield::Estimate(estimate) => {
                let types_json = serde_json::to_string(&estimate.expected_types)?;
                db::responses::store_estimate(
                    &inner.pool,
                    request_id,
                    &types_json,
                    estimate.min_count,
                    estimate.max_count,
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// The deferred-validation gate.
///
/// Deferred payloads are confirmed at most once. Valid data is stored and
/// handed to `on_data`; invalid data is stored with its errors and handed to
/// `on_invalid_data`, or propagated as a validation error when that callback
/// is absent.
async fn handle_data(
    inner: &DriverInner,
    data: ParsedData,
    response: &Response,
    request_id: i64,
) -> Result<()> {
    match data {
        ParsedData::Value { result_type, data } => {
            db::responses::store_result(
                &inner.pool,
                request_id,
                &result_type,
                &data.to_string(),
                true,
                None,
            )
            .await?;
            if let Some(on_data) = &inner.callbacks.on_data {
                on_data(data).await;
            }
        }
        ParsedData::Deferred(deferred) => match deferred.confirm() {
            Ok(valid) => {
                db::responses::store_result(
                    &inner.pool,
                    request_id,
                    deferred.model_name(),
                    &valid.to_string(),
                    true,
                    None,
                )
                .await?;
                if let Some(on_data) = &inner.callbacks.on_data {
                    on_data(valid).await;
                }
            }
            Err(mut failure) => {
                if failure.request_url.is_empty() {
                    failure.request_url = response.url.clone();
                }
                let errors_json = serde_json::to_string(&failure.errors)?;
                db::responses::store_result(
                    &inner.pool,
                    request_id,
                    &failure.model_name,
                    &failure.failed_doc.to_string(),
                    false,
                    Some(&errors_json),
                )
                .await?;
                tracing::warn!(
                    model = %failure.model_name,
                    url = %failure.request_url,
                    errors = %json!(failure.errors),
                    "validation failed"
                );
                match &inner.callbacks.on_invalid_data {
                    Some(on_invalid) => on_invalid(failure).await,
                    None => return Err(anyhow::Error::new(ScrapeError::Validation(failure))),
                }
            }
        },
    }
    Ok(())
}
