//! In-process broker with NATS-like subject semantics.
//!
//! A [`MemoryBroker`] is shared by any number of [`MemoryTransport`]
//! connections, so two Hemera instances in one process talk to each other
//! exactly as they would over a real broker. Subjects support `*` and a
//! trailing `>`; queue groups deliver each message to one random member.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hemera_core::Subject;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Message, SubscribeOptions, Subscription, Sid, Transport, TransportError};

const INBOX_PREFIX: &str = "_INBOX.";

struct BrokerSub {
    connection: u64,
    subject: Subject,
    queue: Option<String>,
    max: Option<u64>,
    delivered: AtomicU64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BrokerInner {
    subs: DashMap<Sid, Arc<BrokerSub>>,
    next_sid: AtomicU64,
    next_connection: AtomicU64,
}

impl BrokerInner {
    fn route(&self, message: &Message) -> usize {
        let mut plain: Vec<(Sid, Arc<BrokerSub>)> = Vec::new();
        let mut groups: HashMap<String, Vec<(Sid, Arc<BrokerSub>)>> = HashMap::new();

        for entry in &self.subs {
            let sub = entry.value();
            if !sub.subject.matches(&message.subject) {
                continue;
            }
            match &sub.queue {
                Some(queue) => groups
                    .entry(queue.clone())
                    .or_default()
                    .push((*entry.key(), Arc::clone(sub))),
                None => plain.push((*entry.key(), Arc::clone(sub))),
            }
        }

        let mut rng = rand::rng();
        for members in groups.into_values() {
            let pick = rng.random_range(0..members.len());
            plain.push(members[pick].clone());
        }

        plain
            .into_iter()
            .filter(|(sid, sub)| self.deliver(*sid, sub, message.clone()))
            .count()
    }

    fn deliver(&self, sid: Sid, sub: &BrokerSub, message: Message) -> bool {
        let delivered = sub.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        if sub.max.is_some_and(|max| delivered > max) {
            return false;
        }
        let sent = sub.tx.send(message).is_ok();
        if !sent || sub.max.is_some_and(|max| delivered >= max) {
            self.subs.remove(&sid);
        }
        sent
    }
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(&self.inner),
            connection: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.len()
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<BrokerInner>,
    connection: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let subject = Subject::parse(subject)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.broker.next_sid.fetch_add(1, Ordering::Relaxed) + 1;

        trace!(sid, subject = subject.as_str(), queue = ?options.queue, "subscribe");
        self.broker.subs.insert(
            sid,
            Arc::new(BrokerSub {
                connection: self.connection,
                subject,
                queue: options.queue,
                max: options.max.filter(|max| *max > 0),
                delivered: AtomicU64::new(0),
                tx,
            }),
        );
        Ok(Subscription { sid, messages: rx })
    }

    async fn publish(&self, subject: &str, payload: Bytes, reply_to: Option<&str>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let message = Message {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        };
        let receivers = self.broker.route(&message);
        trace!(subject, receivers, "publish");
        Ok(())
    }

    fn unsubscribe(&self, sid: Sid) {
        if self.broker.subs.remove(&sid).is_some() {
            trace!(sid, "unsubscribe");
        }
    }

    async fn flush(&self) -> Result<(), TransportError> {
        // Delivery is synchronous with publish.
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let connection = self.connection;
        self.broker.subs.retain(|_, sub| sub.connection != connection);
        debug!(connection, "memory transport closed");
        Ok(())
    }

    fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}{}", uuid::Uuid::new_v4().simple())
    }
}
