//! Server side of the protocol: one listener task per subscribed topic and
//! one task per inbound message.
//!
//! `DECODE -> onServerPreRequest -> [load shed -> lookup -> registration]
//! -> onSend -> onServerPreResponse -> onResponse -> PUBLISH`
//!
//! A stage that answers or fails skips the remaining stages; whatever outcome
//! the exchange carries at that point is published.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use hemera_core::{CallContext, ErrorKind, HemeraError, Packet, RequestKind};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, trace, warn};

use crate::extension::{run_exchange, Exchange, ExtensionPoint, Scope};
use crate::hemera::{Hemera, HemeraEvent, Shared};
use crate::protocol::handler::{Reply, ReplySink};
use crate::service::middleware::DispatchPipeline;
use crate::service::request::InboundRequest;
use crate::transport::{Message, Subscription};

/// Drains `subscription`, handing each message to its own task. Ends when
/// the subscription ends or the instance is gone.
///
/// When the transport ends the subscription itself (auto-unsubscribe after
/// `maxMessages$`), `live` drops to `false`, the messages already taken are
/// answered, and the topic with its registrations is retired.
pub(crate) fn spawn_listener(
    shared: Weak<Shared>,
    topic: String,
    mut subscription: Subscription,
    pipeline: DispatchPipeline,
    live: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sid = subscription.sid;
        let mut pending: Vec<JoinHandle<()>> = Vec::new();
        while let Some(message) = subscription.messages.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            pending.retain(|task| !task.is_finished());
            pending.push(tokio::spawn(handle_message(shared, pipeline.clone(), message)));
        }
        live.store(false, Ordering::Release);
        debug!(%topic, sid, "subscription ended");

        for task in pending {
            // Each task publishes its own outcome.
            let _ = task.await;
        }
        if let Some(shared) = shared.upgrade() {
            shared.retire_topic(&topic, sid);
        }
    })
}

async fn handle_message(shared: Arc<Shared>, pipeline: DispatchPipeline, message: Message) {
    let _guard = shared.lifecycle.in_flight_guard();
    trace!(subject = %message.subject, bytes = message.payload.len(), "inbound message");

    let packet = match shared.decode_packet(message.payload).and_then(|packet| {
        if packet.pattern.is_none() {
            return Err(HemeraError::parse("request packet carries no pattern"));
        }
        Ok(packet)
    }) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(subject = %message.subject, error = %err, "undecodable request");
            if let Some(inbox) = message.reply_to {
                let context = CallContext::inbound(&Packet::default());
                let sink = InboxReply::new(Arc::clone(&shared), inbox, context);
                if let Err(err) = sink.send(Err(err)).await {
                    debug!(error = %err, "could not reply to undecodable request");
                }
            }
            return;
        }
    };

    let kind = packet.request.kind;
    let context = CallContext::inbound(&packet);
    let pattern = packet.pattern.unwrap_or_default();
    let exchange = Exchange::new(pattern, context.clone(), shared.config.name.clone());

    let reply = match (&message.reply_to, kind) {
        (Some(inbox), RequestKind::Request) => {
            Reply::new(Arc::new(InboxReply::new(Arc::clone(&shared), inbox.clone(), context)))
        }
        _ => Reply::none(),
    };

    let root = Arc::clone(&shared.root);
    let (exchange, scope) = match run_exchange(&root.hooks(ExtensionPoint::OnServerPreRequest), exchange).await {
        ControlFlow::Break(ex) => (ex, root),
        ControlFlow::Continue(ex) => {
            let fallback = ex.clone();
            let request = InboundRequest {
                exchange: ex,
                kind,
                reply: reply.clone(),
                hemera: Hemera::from_shared(Arc::clone(&shared)),
            };
            match pipeline.oneshot(request).await {
                Ok(dispatched) => (dispatched.exchange, dispatched.scope),
                Err(err) => {
                    let mut ex = fallback;
                    ex.outcome = Some(Err(err));
                    (ex, root)
                }
            }
        }
    };

    let exchange = run_response_hooks(&scope, exchange).await;

    if let Some(err) = exchange.error() {
        if err.is(ErrorKind::Fatal) {
            shared.fatal(err);
        } else if kind == RequestKind::Pubsub {
            debug!(pattern = %exchange.pattern, error = %err, "fire-and-forget request failed");
            shared.emit(HemeraEvent::Error(err.clone()));
        }
    }

    let outcome = exchange.outcome.unwrap_or(Ok(Value::Null));
    if let Err(err) = reply.finish(outcome).await {
        warn!(request_id = %exchange.context.request_id, error = %err, "reply could not be published");
    }
}

async fn run_response_hooks(scope: &Arc<Scope>, exchange: Exchange) -> Exchange {
    let mut exchange = exchange;
    for point in [
        ExtensionPoint::OnSend,
        ExtensionPoint::OnServerPreResponse,
        ExtensionPoint::OnResponse,
    ] {
        match run_exchange(&scope.hooks(point), exchange).await {
            ControlFlow::Continue(ex) => exchange = ex,
            ControlFlow::Break(ex) => return ex,
        }
    }
    exchange
}

// ---------------------------------------------------------------------------
// InboxReply
// ---------------------------------------------------------------------------

/// Publishes replies to the caller's inbox.
struct InboxReply {
    shared: Arc<Shared>,
    inbox: String,
    context: CallContext,
}

impl InboxReply {
    fn new(shared: Arc<Shared>, inbox: String, context: CallContext) -> Self {
        Self { shared, inbox, context }
    }
}

#[async_trait]
impl ReplySink for InboxReply {
    async fn send(&self, outcome: Result<Value, HemeraError>) -> Result<(), HemeraError> {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(self.shared.errors.to_wire(&err))),
        };
        let mut context = self.context.clone();
        context.trace.finish();
        let bytes = self.shared.encode_packet(&context.reply_packet(result, error))?;
        self.shared
            .transport
            .publish(&self.inbox, bytes, None)
            .await
            .map_err(|e| self.shared.transport_failure(e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
