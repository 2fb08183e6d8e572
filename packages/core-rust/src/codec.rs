//! Ordered codec pipelines applied to wire payloads.
//!
//! An encoder pipeline starts from a JSON value and must end in wire bytes; a
//! decoder pipeline starts from wire bytes and must end in a JSON value. Steps
//! run in insertion order, so the last step added to an encoder runs closest
//! to the wire and the first step added to a decoder runs closest to the wire.
//!
//! There is no `[Circular]` placeholder: a `serde_json::Value` owns its
//! children, so a payload cannot refer back to itself and repeated subtrees
//! are always encoded in full.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::HemeraError;

/// Intermediate representation flowing between codec steps.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Value(Value),
    Bytes(Bytes),
}

impl Frame {
    fn describe(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Bytes(_) => "bytes",
        }
    }
}

/// One transform step of a codec pipeline.
pub trait CodecStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transforms `input`.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` when the input cannot be transformed.
    fn apply(&self, input: Frame) -> Result<Frame, HemeraError>;
}

// ---------------------------------------------------------------------------
// Built-in steps
// ---------------------------------------------------------------------------

/// JSON text codec; the default on both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl CodecStep for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn apply(&self, input: Frame) -> Result<Frame, HemeraError> {
        match input {
            Frame::Value(value) => serde_json::to_vec(&value)
                .map(|buf| Frame::Bytes(Bytes::from(buf)))
                .map_err(|e| HemeraError::parse(format!("json encode failed: {e}"))),
            Frame::Bytes(bytes) => serde_json::from_slice::<Value>(&bytes)
                .map(Frame::Value)
                .map_err(|e| HemeraError::parse(format!("json decode failed: {e}"))),
        }
    }
}

/// `MessagePack` codec with named struct fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl CodecStep for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn apply(&self, input: Frame) -> Result<Frame, HemeraError> {
        match input {
            Frame::Value(value) => rmp_serde::to_vec_named(&value)
                .map(|buf| Frame::Bytes(Bytes::from(buf)))
                .map_err(|e| HemeraError::parse(format!("msgpack encode failed: {e}"))),
            Frame::Bytes(bytes) => rmp_serde::from_slice::<Value>(&bytes)
                .map(Frame::Value)
                .map_err(|e| HemeraError::parse(format!("msgpack decode failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// CodecPipeline
// ---------------------------------------------------------------------------

/// An ordered list of [`CodecStep`]s.
#[derive(Clone)]
pub struct CodecPipeline {
    steps: Vec<Arc<dyn CodecStep>>,
}

impl CodecPipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    /// The default pipeline: a single JSON step.
    #[must_use]
    pub fn json() -> Self {
        let mut pipeline = Self::empty();
        pipeline.add(Arc::new(JsonCodec));
        pipeline
    }

    /// Appends a step.
    pub fn add(&mut self, step: Arc<dyn CodecStep>) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Prepends a step.
    pub fn first(&mut self, step: Arc<dyn CodecStep>) -> &mut Self {
        self.steps.insert(0, step);
        self
    }

    /// Removes every step.
    pub fn reset(&mut self) -> &mut Self {
        self.steps.clear();
        self
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step in order.
    ///
    /// # Errors
    ///
    /// Propagates the first step failure.
    pub fn run(&self, input: Frame) -> Result<Frame, HemeraError> {
        self.steps.iter().try_fold(input, |frame, step| step.apply(frame))
    }

    /// Encodes `value` into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` on step failure or when the pipeline does not
    /// end in bytes.
    pub fn encode(&self, value: Value) -> Result<Bytes, HemeraError> {
        match self.run(Frame::Value(value))? {
            Frame::Bytes(bytes) => Ok(bytes),
            other => Err(HemeraError::parse(format!(
                "encoder pipeline ended in {} instead of bytes",
                other.describe()
            ))),
        }
    }

    /// Decodes wire bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` on step failure or when the pipeline does not
    /// end in a value.
    pub fn decode(&self, bytes: Bytes) -> Result<Value, HemeraError> {
        match self.run(Frame::Bytes(bytes))? {
            Frame::Value(value) => Ok(value),
            other => Err(HemeraError::parse(format!(
                "decoder pipeline ended in {} instead of a value",
                other.describe()
            ))),
        }
    }
}

impl Default for CodecPipeline {
    fn default() -> Self {
        Self::json()
    }
}

impl fmt::Debug for CodecPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    /// Reverses byte order; stands in for a compression or framing step.
    struct Reverse;

    impl CodecStep for Reverse {
        fn name(&self) -> &'static str {
            "reverse"
        }

        fn apply(&self, input: Frame) -> Result<Frame, HemeraError> {
            match input {
                Frame::Bytes(bytes) => {
                    let mut buf = bytes.to_vec();
                    buf.reverse();
                    Ok(Frame::Bytes(Bytes::from(buf)))
                }
                Frame::Value(_) => Err(HemeraError::parse("reverse expects bytes")),
            }
        }
    }

    #[test]
    fn json_round_trip() {
        let codec = CodecPipeline::json();
        let value = json!({ "topic": "math", "a": 1, "nested": { "list": [1, "two", null] } });
        let bytes = codec.encode(value.clone()).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), value);
    }

    #[test]
    fn msgpack_round_trip() {
        let mut codec = CodecPipeline::empty();
        codec.add(Arc::new(MsgPackCodec));
        let value = json!({ "topic": "math", "a": -7, "ok": true });
        let bytes = codec.encode(value.clone()).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), value);
    }

    #[test]
    fn encode_steps_closest_to_the_wire_run_last() {
        let mut encoder = CodecPipeline::json();
        encoder.add(Arc::new(Reverse));
        let mut decoder = CodecPipeline::json();
        decoder.first(Arc::new(Reverse));

        assert_eq!(encoder.step_names(), vec!["json", "reverse"]);
        assert_eq!(decoder.step_names(), vec!["reverse", "json"]);

        let bytes = encoder.encode(json!({ "x": 1 })).unwrap();
        assert_eq!(bytes.first(), Some(&b'}'));
        assert_eq!(decoder.decode(bytes).unwrap(), json!({ "x": 1 }));
    }

    #[test]
    fn repeated_subtrees_are_encoded_in_full() {
        let shared = json!({ "id": 7, "tags": ["a", "b"] });
        let value = json!({ "left": shared.clone(), "right": shared.clone(), "list": [shared.clone(), shared] });

        let codec = CodecPipeline::json();
        let bytes = codec.encode(value.clone()).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("[Circular]"));
        assert_eq!(codec.decode(bytes).unwrap(), value);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = CodecPipeline::json().decode(Bytes::from_static(b"{nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn reset_pipeline_cannot_encode() {
        let mut codec = CodecPipeline::json();
        codec.reset();
        assert!(codec.step_names().is_empty());
        let err = codec.encode(json!(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in arb_json()) {
            let codec = CodecPipeline::json();
            let bytes = codec.encode(value.clone()).unwrap();
            prop_assert_eq!(codec.decode(bytes).unwrap(), value);
        }
    }
}
