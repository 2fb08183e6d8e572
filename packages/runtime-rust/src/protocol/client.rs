//! Client side of the protocol: `act` and reply streams.
//!
//! `INIT -> onClientPreRequest -> ENCODE -> PUBLISH -> (pubsub: DONE) |
//! (request: AWAIT_REPLY) -> DECODE -> onClientPostRequest -> DONE | ERROR`
//!
//! The reply inbox is subscribed before the request is published and removed
//! on every terminal state. The timer starts at publish; once it fires the
//! inbox is gone, so late replies are never seen.

use std::sync::Arc;
use std::time::Duration;

use hemera_core::{CallContext, HemeraError, Pattern, RequestKind};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::extension::{run_chain, Exchange, ExtensionPoint, Flow, Scope};
use crate::hemera::Shared;
use crate::transport::{Message, SubscribeOptions, SubscriptionGuard};

/// What publishing an act led to.
pub(crate) enum Sent {
    /// A client hook answered; nothing was published.
    Answered(Value),
    /// Fire-and-forget request, published and flushed.
    Published,
    Awaiting(ReplyStream),
}

/// Runs the client pipeline up to the point where replies are awaited.
pub(crate) async fn send(
    shared: &Arc<Shared>,
    scope: &Arc<Scope>,
    parent: Option<&CallContext>,
    pattern: Pattern,
) -> Result<Sent, HemeraError> {
    if shared.lifecycle.is_closing() {
        return Err(HemeraError::hemera("instance is closed").with_pattern(pattern.payload()));
    }
    if pattern.topic().is_none() {
        return Err(HemeraError::hemera("pattern has no topic").with_pattern(pattern.payload()));
    }

    let context = CallContext::derive(parent, &pattern);
    let max_recursion = shared.config.max_recursion;
    if max_recursion > 0 && context.recursion > max_recursion {
        return Err(HemeraError::max_recursion(format!(
            "`{}` called itself more than {max_recursion} times in a row",
            pattern.signature()
        ))
        .with_property("maxRecursion", max_recursion)
        .with_pattern(pattern.payload()));
    }

    let exchange = Exchange::new(pattern, context, shared.config.name.clone());
    let exchange = match run_chain(&scope.hooks(ExtensionPoint::OnClientPreRequest), exchange).await? {
        Flow::Completed(ex) => ex,
        Flow::Responded(value) => return Ok(Sent::Answered(value)),
    };

    let pubsub = exchange.pattern.is_pubsub();
    let payload = exchange.pattern.payload();
    let topic = payload.topic().unwrap_or_default().to_string();
    let kind = if pubsub { RequestKind::Pubsub } else { RequestKind::Request };
    let packet = exchange.context.request_packet(payload.clone(), kind);
    let bytes = shared.encode_packet(&packet)?;

    if pubsub {
        shared.transport.publish(&topic, bytes, None).await.map_err(|e| shared.transport_failure(e))?;
        shared.transport.flush().await.map_err(|e| shared.transport_failure(e))?;
        debug!(%topic, request_id = %exchange.context.request_id, "published");
        return Ok(Sent::Published);
    }

    let timeout = exchange
        .pattern
        .timeout_ms()
        .map_or_else(|| shared.config.timeout_duration(), Duration::from_millis);
    let max_messages = exchange.pattern.max_messages().unwrap_or(1);
    let expected = exchange.pattern.expected_messages().unwrap_or(1).max(1);
    let max = u64::try_from(max_messages).ok().filter(|max| *max > 0);

    let shutdown = shared.lifecycle.receiver();
    let subscription = shared
        .transport
        .request(&topic, bytes, SubscribeOptions { queue: None, max })
        .await
        .map_err(|e| shared.transport_failure(e))?;
    let guard = SubscriptionGuard::new(Arc::clone(&shared.transport), subscription.sid);
    debug!(%topic, request_id = %exchange.context.request_id, timeout_ms = timeout.as_millis(), "request published");

    Ok(Sent::Awaiting(ReplyStream {
        state: StreamState::Inbox(Box::new(Inbox {
            shared: Arc::clone(shared),
            scope: Arc::clone(scope),
            exchange,
            payload,
            messages: subscription.messages,
            guard: Some(guard),
            deadline: Instant::now() + timeout,
            timeout,
            expected,
            max,
            received: 0,
            shutdown,
        })),
    }))
}

// ---------------------------------------------------------------------------
// ReplyStream
// ---------------------------------------------------------------------------

/// Replies of one act, in arrival order.
///
/// The first `expectedMessages$` replies must arrive before the timeout;
/// later ones are awaited without a deadline. The stream ends after
/// `maxMessages$` replies, on timeout, or when the instance closes.
/// Dropping it removes the reply subscription.
pub struct ReplyStream {
    state: StreamState,
}

enum StreamState {
    Answered(Option<Value>),
    Inbox(Box<Inbox>),
    Done,
}

struct Inbox {
    shared: Arc<Shared>,
    scope: Arc<Scope>,
    exchange: Exchange,
    payload: Pattern,
    messages: mpsc::UnboundedReceiver<Message>,
    guard: Option<SubscriptionGuard>,
    deadline: Instant,
    timeout: Duration,
    expected: u64,
    max: Option<u64>,
    received: u64,
    shutdown: watch::Receiver<bool>,
}

enum Wait {
    Message(Option<Message>),
    TimedOut,
    Closed,
}

impl ReplyStream {
    pub(crate) fn answered(value: Value) -> Self {
        Self {
            state: StreamState::Answered(Some(value)),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            state: StreamState::Done,
        }
    }

    /// Number of replies received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        match &self.state {
            StreamState::Inbox(inbox) => inbox.received,
            _ => 0,
        }
    }

    /// The next reply, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Value, HemeraError>> {
        let inbox = match &mut self.state {
            StreamState::Done => return None,
            StreamState::Answered(value) => {
                let value = value.take();
                self.state = StreamState::Done;
                return value.map(Ok);
            }
            StreamState::Inbox(inbox) => inbox,
        };

        let outcome = match inbox.wait().await {
            Wait::Message(Some(message)) => {
                inbox.received += 1;
                let outcome = inbox.process(message).await;
                if inbox.max.is_some_and(|max| inbox.received >= max) {
                    self.state = StreamState::Done;
                }
                return Some(outcome);
            }
            Wait::Message(None) => None,
            Wait::TimedOut => Some(Err(inbox.timeout_error())),
            Wait::Closed => Some(Err(
                HemeraError::hemera("instance closed while awaiting a reply").with_pattern(inbox.payload.clone())
            )),
        };
        // Dropping the inbox removes the subscription.
        self.state = StreamState::Done;
        outcome
    }

    /// Collects every remaining reply; stops at the first error.
    ///
    /// # Errors
    ///
    /// The first failed reply.
    pub async fn collect(mut self) -> Result<Vec<Value>, HemeraError> {
        let mut values = Vec::new();
        while let Some(outcome) = self.next().await {
            values.push(outcome?);
        }
        Ok(values)
    }
}

impl std::fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            StreamState::Answered(_) => "answered",
            StreamState::Inbox(_) => "awaiting",
            StreamState::Done => "done",
        };
        f.debug_struct("ReplyStream")
            .field("state", &state)
            .field("received", &self.received())
            .finish()
    }
}

impl Inbox {
    async fn wait(&mut self) -> Wait {
        if self.received < self.expected {
            tokio::select! {
                message = self.messages.recv() => Wait::Message(message),
                () = tokio::time::sleep_until(self.deadline) => Wait::TimedOut,
                _ = self.shutdown.wait_for(|closing| *closing) => Wait::Closed,
            }
        } else {
            tokio::select! {
                message = self.messages.recv() => Wait::Message(message),
                _ = self.shutdown.wait_for(|closing| *closing) => Wait::Closed,
            }
        }
    }

    fn timeout_error(&mut self) -> HemeraError {
        self.guard.take();
        let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(pattern = %self.payload, timeout_ms = millis, "act timed out");
        HemeraError::timeout(format!("no reply for `{}` within {millis} ms", self.payload.signature()))
            .with_property("timeout", millis)
            .with_property("received", self.received)
            .with_pattern(self.payload.clone())
    }

    /// Decodes one reply and runs `onClientPostRequest` over it.
    async fn process(&mut self, message: Message) -> Result<Value, HemeraError> {
        let shared = &self.shared;
        let outcome = shared.decode_packet(message.payload).and_then(|packet| {
            trace!(request_id = %packet.request.id, "reply received");
            match packet.error {
                Some(error) => Err(shared.errors.from_wire(&error)),
                None => Ok(packet.result.unwrap_or(Value::Null)),
            }
        });

        let mut exchange = self.exchange.clone();
        exchange.context.trace.finish();
        exchange.outcome = Some(outcome);
        match run_chain(&self.scope.hooks(ExtensionPoint::OnClientPostRequest), exchange).await? {
            Flow::Completed(ex) => ex.outcome.unwrap_or(Ok(Value::Null)),
            Flow::Responded(value) => Ok(value),
        }
    }
}
