//! Request resolution, (de)serialization and the enqueue path.
//!
//! Resolution turns a scraper-yielded request into an absolute, fully
//! inherited one: relative URLs join the context URL, query-param maps fold
//! into the URL sorted by key, and carried state merges parent→child with
//! child keys winning. Ingress and egress serialization are mutually
//! inverse.

use serde_json::Value;
use url::Url;

use crate::db::requests::{NewRequest, RequestRecord};
use crate::error::Result;
use crate::types::{
    Body, DataMap, Dedup, HttpMethod, HttpRequestParams, Permanent, Request, RequestKind,
    Response, SpeculationId,
};

/// What a new request resolves against.
pub(crate) enum EnqueueContext<'a> {
    /// Seed request; the URL must already be absolute.
    Entry,
    /// Yielded from a continuation: the triggering response.
    Response(&'a Response),
    /// Non-navigating: the originating request.
    Request(&'a Request),
}

impl EnqueueContext<'_> {
    fn base_url(&self) -> Option<&str> {
        match self {
            EnqueueContext::Entry => None,
            EnqueueContext::Response(response) => Some(&response.url),
            EnqueueContext::Request(request) => Some(&request.http.url),
        }
    }

    fn parent(&self) -> Option<&Request> {
        match self {
            EnqueueContext::Entry => None,
            EnqueueContext::Response(response) => Some(&response.request),
            EnqueueContext::Request(request) => Some(request),
        }
    }
}

fn merge_inherited(child: &mut DataMap, parent: &DataMap) {
    for (key, value) in parent {
        child.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Resolve a scraper-provided request against its context.
pub(crate) fn resolve_request(mut request: Request, context: &EnqueueContext<'_>) -> Result<Request> {
    // Resolve the URL: absolute passes through, relative joins the context
    let mut url = match Url::parse(&request.http.url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = context.base_url().ok_or_else(|| {
                anyhow::anyhow!(
                    "relative URL '{}' requires a navigation context",
                    request.http.url
                )
            })?;
            Url::parse(base)?.join(&request.http.url)?
        }
        Err(err) => return Err(err.into()),
    };

    // Fold query params into the URL, sorted by key (BTreeMap order),
    // after any query already present.
    if !request.http.params.is_empty() {
        let params = std::mem::take(&mut request.http.params);
        url.query_pairs_mut().extend_pairs(params.iter());
    }
    request.http.url = url.to_string();
    request.current_location = context.base_url().map(str::to_owned);

    // Inherit carried state from the parent; the child's own entries win.
    if let Some(parent) = context.parent() {
        merge_inherited(&mut request.accumulated_data, &parent.accumulated_data);
        merge_inherited(&mut request.aux_data, &parent.aux_data);
        request.permanent.inherit(&parent.permanent);
    }

    Ok(request)
}

fn map_to_json(map: &DataMap) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map.clone()).to_string())
    }
}

fn json_to_map(json: Option<&str>) -> DataMap {
    json.and_then(|j| serde_json::from_str::<Value>(j).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

/// Serialize a resolved request into its row form.
pub(crate) fn serialize_request(
    request: &Request,
    queue_counter: i64,
    parent_id: Option<i64>,
    dedup_key: Option<String>,
) -> NewRequest {
    let (body, body_is_json) = match &request.http.body {
        Some(Body::Bytes(bytes)) => (Some(bytes.clone()), false),
        Some(Body::Json(value)) => (Some(value.to_string().into_bytes()), true),
        None => (None, false),
    };

    let headers_json = if request.http.headers.is_empty() {
        None
    } else {
        serde_json::to_string(&request.http.headers).ok()
    };
    let cookies_json = if request.http.cookies.is_empty() {
        None
    } else {
        serde_json::to_string(&request.http.cookies).ok()
    };
    let permanent_json = if request.permanent.is_empty() {
        None
    } else {
        serde_json::to_string(&request.permanent).ok()
    };
    let speculation_id = request
        .speculation_id
        .as_ref()
        .and_then(|s| serde_json::to_string(&(s.entry.as_str(), s.id)).ok());

    NewRequest {
        parent_id,
        queue_counter,
        request_type: request.kind.as_str().to_string(),
        method: request.http.method.as_str().to_string(),
        url: request.http.url.clone(),
        headers_json,
        cookies_json,
        body,
        body_is_json,
        continuation: request.continuation.clone(),
        current_location: request.current_location.clone(),
        accumulated_data_json: map_to_json(&request.accumulated_data),
        aux_data_json: map_to_json(&request.aux_data),
        permanent_json,
        expected_type: request.expected_type.clone(),
        priority: request.priority,
        dedup_key,
        is_speculative: request.is_speculative,
        speculation_id,
    }
}

/// Reconstruct a request from its row. Inverse of [`serialize_request`] on
/// all user-facing fields.
pub(crate) fn deserialize_request(row: &RequestRecord) -> Result<Request> {
    let method = HttpMethod::parse(&row.method)
        .ok_or_else(|| anyhow::anyhow!("unknown HTTP method in row {}: {}", row.id, row.method))?;
    let kind = RequestKind::parse(&row.request_type).ok_or_else(|| {
        anyhow::anyhow!("unknown request type in row {}: {}", row.id, row.request_type)
    })?;

    let body = match &row.body {
        None => None,
        Some(bytes) if row.body_is_json => {
            let value = serde_json::from_slice(bytes)?;
            Some(Body::Json(value))
        }
        Some(bytes) => Some(Body::Bytes(bytes.clone())),
    };

    let headers = row
        .headers_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();
    let cookies = row
        .cookies_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();
    let permanent: Permanent = row
        .permanent_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();

    let speculation_id = row
        .speculation_id
        .as_deref()
        .and_then(|j| serde_json::from_str::<(String, i64)>(j).ok())
        .map(|(entry, id)| SpeculationId { entry, id });

    Ok(Request {
        http: HttpRequestParams {
            method,
            url: row.url.clone(),
            params: Default::default(),
            headers,
            cookies,
            body,
        },
        kind,
        continuation: row.continuation.clone(),
        current_location: row.current_location.clone(),
        accumulated_data: json_to_map(row.accumulated_data_json.as_deref()),
        aux_data: json_to_map(row.aux_data_json.as_deref()),
        permanent,
        priority: row.priority,
        expected_type: row.expected_type.clone(),
        dedup: match &row.dedup_key {
            Some(key) => Dedup::Key(key.clone()),
            None => Dedup::Skip,
        },
        is_speculative: row.is_speculative,
        speculation_id,
    })
}

/// The dedup key a resolved request will be stored under, if any.
pub(crate) fn effective_dedup_key(request: &Request) -> Option<String> {
    match &request.dedup {
        Dedup::Skip => None,
        Dedup::Key(key) => Some(key.clone()),
        Dedup::Auto => Some(request.derived_dedup_key()),
    }
}
