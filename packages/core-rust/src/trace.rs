//! Trace propagated end-to-end through a causal call chain.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Trace record for one request/response hop pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Topic of the called pattern.
    pub service: String,
    /// Signature of the called pattern.
    pub method: String,
    /// Start of the span in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Span duration in milliseconds, set once the call completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Number of server hops traversed so far in this chain.
    #[serde(default)]
    pub hop: u32,
}

impl Trace {
    /// Starts a new trace.
    #[must_use]
    pub fn root(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            parent_span_id: None,
            service: service.into(),
            method: method.into(),
            timestamp: now_millis(),
            duration: None,
            hop: 0,
        }
    }

    /// Starts a child span of `parent`, keeping its trace id and hop count.
    #[must_use]
    pub fn child_of(parent: &Trace, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            trace_id: parent.trace_id.clone(),
            parent_span_id: Some(parent.span_id.clone()),
            hop: parent.hop,
            ..Self::root(service, method)
        }
    }

    /// Continues an external trace given through `trace$`
    /// (`{ "traceId": ..., "spanId": ... }`).
    #[must_use]
    pub fn continue_from(external: &Map<String, Value>, service: impl Into<String>, method: impl Into<String>) -> Self {
        let mut trace = Self::root(service, method);
        if let Some(trace_id) = external.get("traceId").and_then(Value::as_str) {
            trace.trace_id = trace_id.to_string();
        }
        trace.parent_span_id = external
            .get("spanId")
            .and_then(Value::as_str)
            .map(str::to_string);
        trace
    }

    /// Records the elapsed time since `timestamp`.
    pub fn finish(&mut self) {
        self.duration = Some(now_millis().saturating_sub(self.timestamp));
    }

    /// Marks the traversal of one more server hop.
    pub fn enter_hop(&mut self) {
        self.hop = self.hop.saturating_add(1);
    }
}

/// Generates a fresh 32-character hex identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
