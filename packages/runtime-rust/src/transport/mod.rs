//! Transport contract consumed by the runtime.
//!
//! The runtime never talks to a broker directly. It needs subject-based
//! publish/subscribe with optional queue groups, reply subjects and
//! auto-unsubscribe after a message count. Any NATS-like client can be
//! adapted to [`Transport`]; [`memory`] provides an in-process broker.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hemera_core::{HemeraError, SubjectError};
use tokio::sync::mpsc;

pub use memory::{MemoryBroker, MemoryTransport};

/// Subscription identifier, unique per transport connection.
pub type Sid = u64;

/// Errors surfaced by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection is closed")]
    Closed,
    #[error(transparent)]
    Subject(#[from] SubjectError),
    #[error("transport failure: {0}")]
    Io(String),
}

impl From<TransportError> for HemeraError {
    #[track_caller]
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => HemeraError::fatal(err.to_string()),
            other => HemeraError::hemera(other.to_string()),
        }
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group; each message is delivered to one member of the group.
    pub queue: Option<String>,
    /// Unsubscribe automatically after this many deliveries.
    pub max: Option<u64>,
}

/// An active subscription. The stream ends once the subscription is removed.
#[derive(Debug)]
pub struct Subscription {
    pub sid: Sid,
    pub messages: mpsc::UnboundedReceiver<Message>,
}

/// Subject-based publish/subscribe.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribes to `subject`, which may contain `*` and a trailing `>`.
    ///
    /// # Errors
    ///
    /// Fails on a malformed subject or a closed connection.
    fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription, TransportError>;

    /// # Errors
    ///
    /// Fails on a closed connection.
    async fn publish(&self, subject: &str, payload: Bytes, reply_to: Option<&str>) -> Result<(), TransportError>;

    /// Removes a subscription; unknown ids are ignored.
    fn unsubscribe(&self, sid: Sid);

    /// Waits until everything published so far has been handed to the broker.
    ///
    /// # Errors
    ///
    /// Fails on a closed connection.
    async fn flush(&self) -> Result<(), TransportError>;

    /// Closes the connection. Every subscription of this connection ends.
    ///
    /// # Errors
    ///
    /// Implementations may report a failed teardown.
    async fn close(&self) -> Result<(), TransportError>;

    /// A fresh, unique reply subject.
    fn new_inbox(&self) -> String;

    /// Subscribes a new inbox and publishes `payload` with it as reply
    /// subject. The inbox subscription is removed again when publishing
    /// fails.
    ///
    /// # Errors
    ///
    /// Propagates subscribe and publish failures.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        let inbox = self.new_inbox();
        let subscription = self.subscribe(&inbox, options)?;
        if let Err(err) = self.publish(subject, payload, Some(&inbox)).await {
            self.unsubscribe(subscription.sid);
            return Err(err);
        }
        Ok(subscription)
    }
}

/// Removes a subscription when dropped.
pub struct SubscriptionGuard {
    transport: Arc<dyn Transport>,
    sid: Sid,
}

impl SubscriptionGuard {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, sid: Sid) -> Self {
        Self { transport, sid }
    }

    #[must_use]
    pub fn sid(&self) -> Sid {
        self.sid
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.sid);
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard").field("sid", &self.sid).finish()
    }
}
