//! Registration records created by `add`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hemera_core::{HemeraError, Pattern, PayloadSchema};
use parking_lot::RwLock;

use super::handler::Handler;
use crate::breaker::CircuitBreaker;
use crate::extension::{Exchange, Hook, Scope};
use crate::transport::{Sid, SubscribeOptions};

// ---------------------------------------------------------------------------
// TopicOptions
// ---------------------------------------------------------------------------

/// Transport options of a topic subscription. Every registration on one
/// topic must resolve to the same options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    pub pubsub: bool,
    pub queue: Option<String>,
    /// Auto-unsubscribe after this many messages.
    pub max_messages: Option<u64>,
}

impl TopicOptions {
    /// Reads the options from the control keys of a registration pattern.
    ///
    /// Request-mode topics join the queue group `queue.<topic>` unless
    /// `queue$` names another. Pub/sub topics only join a group when
    /// `queue$` is given, so every subscriber sees every message.
    #[must_use]
    pub fn from_pattern(pattern: &Pattern) -> Self {
        let pubsub = pattern.is_pubsub();
        let queue = match pattern.queue() {
            Some(queue) => Some(queue.to_string()),
            None if pubsub => None,
            None => pattern.topic().map(|topic| format!("queue.{topic}")),
        };
        let max_messages = pattern
            .max_messages()
            .and_then(|max| u64::try_from(max).ok())
            .filter(|max| *max > 0);
        Self {
            pubsub,
            queue,
            max_messages,
        }
    }

    #[must_use]
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            queue: self.queue.clone(),
            max: self.max_messages,
        }
    }
}

// ---------------------------------------------------------------------------
// ActMeta
// ---------------------------------------------------------------------------

/// A registered handler.
pub struct ActMeta {
    id: u64,
    pattern: Pattern,
    schema: Option<PayloadSchema>,
    handler: Arc<dyn Handler>,
    middleware: RwLock<Vec<Hook<Exchange>>>,
    sealed: AtomicBool,
    scope: Arc<Scope>,
    options: TopicOptions,
    sid: Sid,
    breaker: Option<CircuitBreaker>,
}

pub(crate) struct ActMetaParts {
    pub id: u64,
    pub pattern: Pattern,
    pub schema: Option<PayloadSchema>,
    pub handler: Arc<dyn Handler>,
    pub scope: Arc<Scope>,
    pub options: TopicOptions,
    pub sid: Sid,
    pub breaker: Option<CircuitBreaker>,
}

impl ActMeta {
    pub(crate) fn new(parts: ActMetaParts) -> Self {
        Self {
            id: parts.id,
            pattern: parts.pattern,
            schema: parts.schema,
            handler: parts.handler,
            middleware: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            scope: parts.scope,
            options: parts.options,
            sid: parts.sid,
            breaker: parts.breaker,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The registered pattern without control keys.
    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.pattern.topic().unwrap_or_default()
    }

    #[must_use]
    pub fn schema(&self) -> Option<&PayloadSchema> {
        self.schema.as_ref()
    }

    #[must_use]
    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    /// Subscription id of the topic this registration listens on.
    #[must_use]
    pub fn sid(&self) -> Sid {
        self.sid
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    #[must_use]
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    /// Appends a middleware hook. It runs after `preHandler`, right before
    /// the handler.
    ///
    /// # Errors
    ///
    /// Fails once the registration has dispatched its first request.
    pub fn use_middleware(&self, hook: Hook<Exchange>) -> Result<&Self, HemeraError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(HemeraError::hemera(format!(
                "registration `{}` already dispatched; middleware is frozen",
                self.pattern.signature()
            )));
        }
        self.middleware.write().push(hook);
        Ok(self)
    }

    /// Freezes the middleware list and returns it.
    pub(crate) fn seal(&self) -> Vec<Hook<Exchange>> {
        self.sealed.store(true, Ordering::Release);
        self.middleware.read().clone()
    }
}

impl fmt::Debug for ActMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActMeta")
            .field("id", &self.id)
            .field("pattern", &self.pattern.signature())
            .field("options", &self.options)
            .field("sid", &self.sid)
            .field("scope", &self.scope.name())
            .finish_non_exhaustive()
    }
}
