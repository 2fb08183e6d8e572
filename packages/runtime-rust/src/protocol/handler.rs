//! What a server handler sees: the inbound [`Request`] and the [`Reply`]
//! channel for intermediate answers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hemera_core::{CallContext, HemeraError, Pattern, Trace};
use serde_json::{Map, Value};

use crate::hemera::Hemera;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A server-side handler bound to a pattern.
///
/// Implemented for every `Fn(Request, Reply) -> impl Future<Output =
/// Result<Value, HemeraError>>`, so closures register directly:
///
/// ```ignore
/// hemera.add(json!({ "topic": "math", "cmd": "add" }), |req: Request, _reply: Reply| async move {
///     Ok(json!(req.i64("a")? + req.i64("b")?))
/// }).await?;
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Produces the final reply. Intermediate replies go through
    /// [`Reply::next`].
    async fn call(&self, request: Request, reply: Reply) -> Result<Value, HemeraError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HemeraError>> + Send + 'static,
{
    async fn call(&self, request: Request, reply: Reply) -> Result<Value, HemeraError> {
        (self)(request, reply).await
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One inbound call as handed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    payload: Pattern,
    call: CallContext,
    hemera: Hemera,
}

impl Request {
    pub(crate) fn new(payload: Pattern, call: CallContext, hemera: Hemera) -> Self {
        Self { payload, call, hemera }
    }

    /// The business payload: `topic` and every non-control key.
    #[must_use]
    pub fn payload(&self) -> &Pattern {
        &self.payload
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Reads an integer field.
    ///
    /// # Errors
    ///
    /// `PayloadValidationError` when the field is missing or not an integer.
    pub fn i64(&self, key: &str) -> Result<i64, HemeraError> {
        self.get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| HemeraError::payload_validation(format!("`{key}` must be an integer")))
    }

    /// Reads a string field.
    ///
    /// # Errors
    ///
    /// `PayloadValidationError` when the field is missing or not a string.
    pub fn str(&self, key: &str) -> Result<&str, HemeraError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| HemeraError::payload_validation(format!("`{key}` must be a string")))
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.payload.topic().unwrap_or_default()
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.call.request_id
    }

    /// Transitive metadata of the call chain.
    #[must_use]
    pub fn meta(&self) -> &Map<String, Value> {
        &self.call.meta
    }

    /// Metadata sent by the immediate caller only.
    #[must_use]
    pub fn delegate(&self) -> &Map<String, Value> {
        &self.call.delegate
    }

    /// Sticky context of the call chain.
    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.call.context
    }

    #[must_use]
    pub fn trace(&self) -> &Trace {
        &self.call.trace
    }

    #[must_use]
    pub fn call_context(&self) -> &CallContext {
        &self.call
    }

    /// Instance handle for nested calls. Acts issued through it are children
    /// of this request: they inherit `meta$` and `context$` and continue its
    /// trace.
    #[must_use]
    pub fn hemera(&self) -> &Hemera {
        &self.hemera
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Destination of replies for one inbound request.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Publishes one reply.
    ///
    /// # Errors
    ///
    /// Encoding or transport failures.
    async fn send(&self, outcome: Result<Value, HemeraError>) -> Result<(), HemeraError>;
}

/// Channel for intermediate replies of a streaming handler.
#[derive(Clone, Default)]
pub struct Reply {
    sink: Option<Arc<dyn ReplySink>>,
}

impl Reply {
    pub(crate) fn new(sink: Arc<dyn ReplySink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A reply channel for fire-and-forget requests.
    #[must_use]
    pub fn none() -> Self {
        Self { sink: None }
    }

    /// `false` for `pubsub$` requests.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Sends an intermediate reply; the value the handler returns is sent
    /// last.
    ///
    /// # Errors
    ///
    /// Fails for `pubsub$` requests and on encoding or transport failures.
    pub async fn next(&self, value: Value) -> Result<(), HemeraError> {
        match &self.sink {
            Some(sink) => sink.send(Ok(value)).await,
            None => Err(HemeraError::hemera("fire-and-forget requests have no reply channel")),
        }
    }

    pub(crate) async fn finish(&self, outcome: Result<Value, HemeraError>) -> Result<(), HemeraError> {
        match &self.sink {
            Some(sink) => sink.send(outcome).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("open", &self.is_open()).finish()
    }
}
