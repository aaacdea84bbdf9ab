//! Progress events emitted during driver execution.

use chrono::{DateTime, Utc};
use serde_json::json;

/// Event type, one per observable lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    RequestEnqueued,
    RequestStarted,
    RequestCompleted,
    RequestFailed,
    RequestRetryScheduled,
    RequestSkipped,
    WorkerScaled,
    RunStarted,
    RunCompleted,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressKind::RequestEnqueued => "request_enqueued",
            ProgressKind::RequestStarted => "request_started",
            ProgressKind::RequestCompleted => "request_completed",
            ProgressKind::RequestFailed => "request_failed",
            ProgressKind::RequestRetryScheduled => "request_retry_scheduled",
            ProgressKind::RequestSkipped => "request_skipped",
            ProgressKind::WorkerScaled => "worker_scaled",
            ProgressKind::RunStarted => "run_started",
            ProgressKind::RunCompleted => "run_completed",
        }
    }
}

/// An event delivered to the `on_progress` callback. Emission is
/// best-effort and never feeds back into driver state.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }

    /// JSON form for WebSocket-style transports.
    pub fn to_json(&self) -> String {
        json!({
            "event_type": self.kind.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
            "data": self.data,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shape() {
        let event = ProgressEvent::new(
            ProgressKind::RequestStarted,
            json!({"request_id": 7, "url": "http://x/"}),
        );
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["event_type"], "request_started");
        assert_eq!(value["data"]["request_id"], 7);
        assert!(value["timestamp"].is_string());
    }
}
