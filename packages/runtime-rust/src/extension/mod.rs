//! Lifecycle extension points and their serial hook chains.
//!
//! Every point owns an ordered list of hooks. A chain runs one hook at a
//! time; each hook either hands a (possibly modified) value to the next one,
//! answers the call itself, or fails. Failing aborts the chain.

pub mod scope;

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use hemera_core::{CallContext, HemeraError, Pattern};
use serde_json::Value;

pub use scope::Scope;

// ---------------------------------------------------------------------------
// ExtensionPoint
// ---------------------------------------------------------------------------

/// Named lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionPoint {
    // ── client ───────────────────────────────────────────────
    /// Before an outbound pattern is encoded.
    OnClientPreRequest,
    /// After a reply is decoded, before the caller sees it.
    OnClientPostRequest,

    // ── server ───────────────────────────────────────────────
    /// Right after an inbound request is decoded, before admission.
    OnServerPreRequest,
    /// After the registration is resolved, before schema validation.
    OnRequest,
    /// Immediately before the registration middleware and handler.
    PreHandler,
    /// After the handler produced its outcome.
    OnSend,
    OnServerPreResponse,
    /// Last hook before the reply is published.
    OnResponse,
    /// A handler error on its way to the caller.
    OnError,

    // ── lifecycle ────────────────────────────────────────────
    /// A pattern is being registered.
    OnAdd,
    /// The instance is closing.
    OnClose,
}

impl ExtensionPoint {
    pub const ALL: [Self; 11] = [
        Self::OnClientPreRequest,
        Self::OnClientPostRequest,
        Self::OnServerPreRequest,
        Self::OnRequest,
        Self::PreHandler,
        Self::OnSend,
        Self::OnServerPreResponse,
        Self::OnResponse,
        Self::OnError,
        Self::OnAdd,
        Self::OnClose,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OnClientPreRequest => "onClientPreRequest",
            Self::OnClientPostRequest => "onClientPostRequest",
            Self::OnServerPreRequest => "onServerPreRequest",
            Self::OnRequest => "onRequest",
            Self::PreHandler => "preHandler",
            Self::OnSend => "onSend",
            Self::OnServerPreResponse => "onServerPreResponse",
            Self::OnResponse => "onResponse",
            Self::OnError => "onError",
            Self::OnAdd => "onAdd",
            Self::OnClose => "onClose",
        }
    }

    /// Points whose hooks receive an [`Exchange`].
    #[must_use]
    pub const fn carries_exchange(self) -> bool {
        !matches!(self, Self::OnAdd | Self::OnClose)
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExtensionPoint {
    type Err = HemeraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|point| point.name() == s)
            .ok_or_else(|| HemeraError::hemera(format!("unknown extension point `{s}`")))
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// The value flowing through client and server hook chains.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// The call pattern. On the client it still carries control keys; on the
    /// server it is the pattern of the inbound request.
    pub pattern: Pattern,
    pub context: CallContext,
    /// Outcome so far. `None` until a handler or the remote peer answered.
    pub outcome: Option<Result<Value, HemeraError>>,
    /// Name of the local instance.
    pub app: String,
}

impl Exchange {
    #[must_use]
    pub fn new(pattern: Pattern, context: CallContext, app: impl Into<String>) -> Self {
        Self {
            pattern,
            context,
            outcome: None,
            app: app.into(),
        }
    }

    /// The error outcome, if the call failed so far.
    #[must_use]
    pub fn error(&self) -> Option<&HemeraError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    /// The success outcome, if any.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// What a hook wants to happen next.
#[derive(Debug)]
pub enum Next<T> {
    /// Hand the value to the next hook.
    Continue(T),
    /// Answer the call with this value; later hooks do not run.
    Respond(Value),
}

/// How a whole chain ended.
#[derive(Debug)]
pub enum Flow<T> {
    /// Every hook continued; this is the final value.
    Completed(T),
    /// A hook answered the call.
    Responded(Value),
}

pub type HookFuture<T> = BoxFuture<'static, Result<Next<T>, HemeraError>>;

/// A registered hook.
pub type Hook<T> = Arc<dyn Fn(T) -> HookFuture<T> + Send + Sync>;

/// Wraps an async closure as a [`Hook`].
pub fn hook<T, F, Fut>(f: F) -> Hook<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Next<T>, HemeraError>> + Send + 'static,
{
    Arc::new(move |value: T| -> HookFuture<T> { Box::pin(f(value)) })
}

/// Wraps a synchronous closure as a [`Hook`].
pub fn sync_hook<T, F>(f: F) -> Hook<T>
where
    T: Send + 'static,
    F: Fn(T) -> Result<Next<T>, HemeraError> + Send + Sync + 'static,
{
    Arc::new(move |value: T| -> HookFuture<T> { Box::pin(std::future::ready(f(value))) })
}

/// Runs `hooks` serially over `value`.
///
/// # Errors
///
/// Returns the first hook error; the remaining hooks do not run.
pub async fn run_chain<T>(hooks: &[Hook<T>], value: T) -> Result<Flow<T>, HemeraError> {
    let mut current = value;
    for h in hooks {
        match h(current).await? {
            Next::Continue(next) => current = next,
            Next::Respond(answer) => return Ok(Flow::Responded(answer)),
        }
    }
    Ok(Flow::Completed(current))
}

/// Runs exchange hooks inside a request pipeline.
///
/// `Continue` carries the exchange left by the last hook. `Break` carries an
/// exchange whose outcome is the hook's answer or error; the pipeline stops
/// there and replies with it.
pub async fn run_exchange(hooks: &[Hook<Exchange>], exchange: Exchange) -> ControlFlow<Exchange, Exchange> {
    if hooks.is_empty() {
        return ControlFlow::Continue(exchange);
    }
    let mut fallback = exchange.clone();
    match run_chain(hooks, exchange).await {
        Ok(Flow::Completed(done)) => ControlFlow::Continue(done),
        Ok(Flow::Responded(value)) => {
            fallback.outcome = Some(Ok(value));
            ControlFlow::Break(fallback)
        }
        Err(err) => {
            fallback.outcome = Some(Err(err));
            ControlFlow::Break(fallback)
        }
    }
}
