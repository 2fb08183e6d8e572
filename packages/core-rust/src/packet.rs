//! Wire envelope exchanged between hops.
//!
//! Requests and replies share one shape. A request carries the business
//! pattern and its metadata; a reply carries either `result` or `error`. All
//! fields use `camelCase` on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HemeraError;
use crate::pattern::Pattern;
use crate::trace::Trace;

/// Whether a request expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Request,
    Pubsub,
}

/// Request identity carried in every packet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Consecutive nested calls of the same pattern in this chain.
    #[serde(default)]
    pub recursion: u32,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub delegate: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    #[serde(default)]
    pub request: RequestInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Packet {
    /// Converts the packet into the JSON value handed to an encoder.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` if a field cannot be represented as JSON.
    pub fn to_value(&self) -> Result<Value, HemeraError> {
        serde_json::to_value(self).map_err(|e| HemeraError::parse(format!("packet encode failed: {e}")))
    }

    /// Reads a packet from a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` when the value is not a packet.
    pub fn from_value(value: Value) -> Result<Self, HemeraError> {
        serde_json::from_value(value).map_err(|e| HemeraError::parse(format!("malformed packet: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_kind_uses_lowercase_type_field() {
        let packet = Packet {
            request: RequestInfo {
                id: "r1".into(),
                kind: RequestKind::Pubsub,
                recursion: 0,
            },
            ..Packet::default()
        };
        let value = packet.to_value().unwrap();
        assert_eq!(value["request"]["type"], "pubsub");
        assert!(value.get("meta").is_none());
        assert!(value.get("result").is_none());
    }

    #[test]
    fn reads_reply_with_result() {
        let packet = Packet::from_value(json!({
            "request": { "id": "r1", "type": "request" },
            "result": 3,
        }))
        .unwrap();
        assert_eq!(packet.result, Some(json!(3)));
        assert_eq!(packet.request.kind, RequestKind::Request);
        assert!(packet.error.is_none());
    }

    #[test]
    fn rejects_non_packets() {
        assert!(Packet::from_value(json!([1])).is_err());
    }
}
