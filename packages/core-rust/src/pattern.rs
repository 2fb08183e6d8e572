//! Pattern model: JSON objects that address a service action.
//!
//! A pattern doubles as the transport subject selector (`topic`) and as the
//! business payload. Keys ending in `$` are control keys: they steer the
//! protocol (pub/sub mode, queue group, reply count, metadata channels) and
//! never take part in matching or reach a handler.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mandatory key naming the transport subject.
pub const TOPIC: &str = "topic";

/// Control keys recognized by the protocol.
pub mod control {
    pub const PUBSUB: &str = "pubsub$";
    pub const QUEUE: &str = "queue$";
    pub const MAX_MESSAGES: &str = "maxMessages$";
    pub const EXPECTED_MESSAGES: &str = "expectedMessages$";
    pub const TIMEOUT: &str = "timeout$";
    pub const META: &str = "meta$";
    pub const TRACE: &str = "trace$";
    pub const DELEGATE: &str = "delegate$";
    pub const CONTEXT: &str = "context$";
    pub const REQUEST_ID: &str = "requestId$";
}

/// Returns `true` for protocol control keys (`pubsub$`, `meta$`, ...).
#[must_use]
pub fn is_control_key(key: &str) -> bool {
    key.ends_with('$')
}

/// Errors raised while building a [`Pattern`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },
    #[error("pattern has no `topic`")]
    MissingTopic,
    #[error("pattern `topic` must be a non-empty string")]
    InvalidTopic,
}

/// An insertion-ordered mapping of keys to JSON values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(Map<String, Value>);

impl Pattern {
    /// Creates an empty pattern.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a pattern from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::NotAnObject`] for anything but a JSON object.
    pub fn from_value(value: Value) -> Result<Self, PatternError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(PatternError::NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }

    /// Like [`Pattern::from_value`], additionally requiring a string `topic`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the value is not an object or carries
    /// no usable topic.
    pub fn with_topic(value: Value) -> Result<Self, PatternError> {
        let pattern = Self::from_value(value)?;
        match pattern.0.get(TOPIC) {
            None => Err(PatternError::MissingTopic),
            Some(Value::String(s)) if !s.is_empty() => Ok(pattern),
            Some(_) => Err(PatternError::InvalidTopic),
        }
    }

    /// The transport subject, if present and a string.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.0.get(TOPIC).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the non-control entries only.
    pub fn business_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().filter(|(k, _)| !is_control_key(k))
    }

    /// Copy of this pattern with every control key stripped.
    ///
    /// This is the payload a handler sees and the shape the router matches on.
    #[must_use]
    pub fn payload(&self) -> Self {
        Self(
            self.business_entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Number of non-control keys. Used by depth indexing.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.business_entries().count()
    }

    /// Returns `true` when every non-control entry of `partial` is present in
    /// `self` with an equal value.
    #[must_use]
    pub fn contains(&self, partial: &Pattern) -> bool {
        partial
            .business_entries()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }

    // -- control accessors ---------------------------------------------------

    #[must_use]
    pub fn is_pubsub(&self) -> bool {
        self.0
            .get(control::PUBSUB)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.0.get(control::QUEUE).and_then(Value::as_str)
    }

    /// `maxMessages$`: reply count accepted by one act. `-1` means unbounded.
    #[must_use]
    pub fn max_messages(&self) -> Option<i64> {
        self.0.get(control::MAX_MESSAGES).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn expected_messages(&self) -> Option<u64> {
        self.0.get(control::EXPECTED_MESSAGES).and_then(Value::as_u64)
    }

    /// Per-call timeout override in milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        self.0.get(control::TIMEOUT).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.0.get(control::REQUEST_ID).and_then(Value::as_str)
    }

    #[must_use]
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.0.get(control::META).and_then(Value::as_object)
    }

    #[must_use]
    pub fn delegate(&self) -> Option<&Map<String, Value>> {
        self.0.get(control::DELEGATE).and_then(Value::as_object)
    }

    #[must_use]
    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.0.get(control::CONTEXT).and_then(Value::as_object)
    }

    #[must_use]
    pub fn trace(&self) -> Option<&Map<String, Value>> {
        self.0.get(control::TRACE).and_then(Value::as_object)
    }

    /// Stable textual signature: business entries sorted by key, e.g.
    /// `a:1,b:2,cmd:add,topic:math`. Nested objects and arrays are rendered
    /// as compact JSON with object keys sorted, so `{"b":1,"a":2}` and
    /// `{"a":2,"b":1}` sign alike.
    ///
    /// Used as the trace `method`, the breaker name and for recursion
    /// detection.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut parts: Vec<(&String, String)> = self
            .business_entries()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => {
                        let mut out = String::new();
                        write_canonical(other, &mut out);
                        out
                    }
                };
                (k, rendered)
            })
            .collect();
        parts.sort_by(|a, b| a.0.cmp(b.0));
        parts
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Pattern {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Pattern {
    type Error = PatternError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
