//! The Hemera instance.
//!
//! [`Hemera`] is a cheap, cloneable handle. All handles of one instance share
//! one [`Shared`] state; they differ only in the plugin [`Scope`] hooks and
//! decorations are registered into, and in the call that nested acts are
//! children of.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hemera_core::{
    CallContext, CodecPipeline, ErrorClass, ErrorKind, ErrorRegistry, HemeraError, Packet, Pattern, PayloadSchema,
    Subject,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::breaker::{CircuitBreaker, CircuitTransition};
use crate::config::HemeraConfig;
use crate::extension::{run_chain, ExtensionPoint, Exchange, Flow, Hook, Scope};
use crate::load::{LoadMonitor, ProcfsProbe};
use crate::protocol::act_meta::{ActMeta, ActMetaParts, TopicOptions};
use crate::protocol::client::{self, ReplyStream, Sent};
use crate::protocol::handler::Handler;
use crate::protocol::server;
use crate::service::dispatch::{Dispatcher, Registrations};
use crate::service::middleware::build_dispatch_pipeline;
use crate::service::registry::{Plugin, PluginRegistry};
use crate::shutdown::{Lifecycle, ShutdownController};
use crate::transport::{Sid, Transport, TransportError};

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Errors the instance reports without a caller to return them to.
#[derive(Debug, Clone)]
pub enum HemeraEvent {
    /// A failure in a fire-and-forget handler, an `onClose` hook or a
    /// plugin's `close`.
    Error(HemeraError),
    /// An unrecoverable failure. With `crashOnFatal` the process exits right
    /// after this is sent.
    Fatal(HemeraError),
}

/// What [`Hemera::remove`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Every registration on a topic.
    Topic(String),
    /// The registrations behind one server subscription.
    Sid(Sid),
}

impl From<&str> for Removal {
    fn from(topic: &str) -> Self {
        Self::Topic(topic.to_string())
    }
}

impl From<String> for Removal {
    fn from(topic: String) -> Self {
        Self::Topic(topic)
    }
}

impl From<Sid> for Removal {
    fn from(sid: Sid) -> Self {
        Self::Sid(sid)
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// One server subscription and the task draining it.
struct TopicEntry {
    options: TopicOptions,
    sid: Sid,
    /// `false` once the transport ended the subscription.
    live: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl TopicEntry {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.listener.is_finished()
    }
}

/// State shared by every handle of one instance.
pub(crate) struct Shared {
    pub(crate) config: Arc<HemeraConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) router: Arc<Registrations>,
    topics: Mutex<HashMap<String, TopicEntry>>,
    encoder: RwLock<CodecPipeline>,
    decoder: RwLock<CodecPipeline>,
    pub(crate) errors: ErrorRegistry,
    pub(crate) load: Arc<LoadMonitor>,
    pub(crate) lifecycle: ShutdownController,
    events: broadcast::Sender<HemeraEvent>,
    transitions: broadcast::Sender<CircuitTransition>,
    plugins: PluginRegistry,
    pub(crate) root: Arc<Scope>,
    next_act_id: AtomicU64,
}

impl Shared {
    /// Packet to bytes through the encoder pipeline.
    pub(crate) fn encode_packet(&self, packet: &Packet) -> Result<Bytes, HemeraError> {
        let value = packet.to_value()?;
        self.encoder.read().encode(value)
    }

    /// Bytes to packet through the decoder pipeline.
    pub(crate) fn decode_packet(&self, bytes: Bytes) -> Result<Packet, HemeraError> {
        let value = self.decoder.read().decode(bytes)?;
        Packet::from_value(value)
    }

    pub(crate) fn emit(&self, event: HemeraEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Reports an unrecoverable error and, with `crashOnFatal`, terminates
    /// the process.
    pub(crate) fn fatal(&self, err: &HemeraError) {
        error!(name = %self.config.name, error = %err, kind = %err.kind(), "fatal error");
        self.emit(HemeraEvent::Fatal(err.clone()));
        if self.config.crash_on_fatal {
            error!(name = %self.config.name, "terminating process: crashOnFatal is set");
            std::process::exit(1);
        }
    }

    /// Converts a transport failure; a lost connection is fatal.
    pub(crate) fn transport_failure(&self, err: TransportError) -> HemeraError {
        let lost = matches!(err, TransportError::Closed);
        let err = HemeraError::from(err);
        if lost && !self.lifecycle.is_closing() {
            self.fatal(&err);
        }
        err
    }

    fn stop_topic(&self, entry: TopicEntry) {
        self.transport.unsubscribe(entry.sid);
        entry.listener.abort();
    }

    /// Forgets a subscription the transport ended on its own, together with
    /// every registration served by it.
    pub(crate) fn retire_topic(&self, topic: &str, sid: Sid) {
        {
            let mut topics = self.topics.lock();
            if topics.get(topic).is_some_and(|entry| entry.sid == sid) {
                topics.remove(topic);
            }
        }
        let removed = self.router.remove_where(|_, act| act.sid() == sid);
        for act in &removed {
            if let Some(breaker) = act.breaker() {
                breaker.shutdown();
            }
        }
        info!(%topic, sid, registrations = removed.len(), "topic retired after its subscription ended");
    }
}

// ---------------------------------------------------------------------------
// Hemera
// ---------------------------------------------------------------------------

/// Handle of a Hemera instance.
///
/// ```ignore
/// let hemera = Hemera::new(Arc::new(broker.connect()), HemeraConfig::default())?;
/// hemera.ready().await?;
/// hemera.add(json!({ "topic": "math", "cmd": "add" }), |req: Request, _reply: Reply| async move {
///     Ok(json!(req.i64("a")? + req.i64("b")?))
/// }).await?;
/// let sum = hemera.act(json!({ "topic": "math", "cmd": "add", "a": 1, "b": 2 })).await?;
/// ```
#[derive(Clone)]
pub struct Hemera {
    shared: Arc<Shared>,
    scope: Arc<Scope>,
    /// The inbound call this handle was handed to, if any.
    parent: Option<CallContext>,
}

impl Hemera {
    /// Creates an instance on `transport`. Nothing is subscribed until the
    /// first [`Hemera::add`].
    ///
    /// # Errors
    ///
    /// Fails when `config` is invalid.
    pub fn new(transport: Arc<dyn Transport>, config: HemeraConfig) -> Result<Self, HemeraError> {
        config
            .validate()
            .map_err(|e| HemeraError::hemera(format!("invalid configuration: {e}")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (transitions, _) = broadcast::channel(EVENT_CAPACITY);
        let root = Scope::root(config.name.clone());
        let shared = Arc::new(Shared {
            router: Arc::new(Registrations::new(&config.bloomrun)),
            topics: Mutex::new(HashMap::new()),
            encoder: RwLock::new(CodecPipeline::json()),
            decoder: RwLock::new(CodecPipeline::json()),
            errors: ErrorRegistry::new(config.errio.clone()),
            load: Arc::new(LoadMonitor::new(config.load.clone())),
            lifecycle: ShutdownController::new(),
            events,
            transitions,
            plugins: PluginRegistry::new(),
            root: Arc::clone(&root),
            next_act_id: AtomicU64::new(1),
            transport,
            config: Arc::new(config),
        });
        debug!(name = %shared.config.name, "instance created");
        Ok(Self {
            shared,
            scope: root,
            parent: None,
        })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        let scope = Arc::clone(&shared.root);
        Self {
            shared,
            scope,
            parent: None,
        }
    }

    /// Handle for a handler invocation: registrations go to `scope`, acts
    /// become children of `parent`.
    pub(crate) fn for_request(&self, scope: Arc<Scope>, parent: CallContext) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scope,
            parent: Some(parent),
        }
    }

    /// Handle bound to a new child scope named `name`.
    #[must_use]
    pub fn scoped(&self, name: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scope: self.scope.child(name),
            parent: self.parent.clone(),
        }
    }

    // -- accessors -----------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &HemeraConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    #[must_use]
    pub fn state(&self) -> Lifecycle {
        self.shared.lifecycle.state()
    }

    #[must_use]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    #[must_use]
    pub fn errors(&self) -> &ErrorRegistry {
        &self.shared.errors
    }

    /// Process load monitor consulted before every inbound request.
    #[must_use]
    pub fn load(&self) -> &Arc<LoadMonitor> {
        &self.shared.load
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Number of inbound requests currently being handled.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shared.lifecycle.in_flight_count()
    }

    pub fn events(&self) -> broadcast::Receiver<HemeraEvent> {
        self.shared.events.subscribe()
    }

    pub fn circuit_transitions(&self) -> broadcast::Receiver<CircuitTransition> {
        self.shared.transitions.subscribe()
    }

    // -- lifecycle -----------------------------------------------------------

    /// Starts load sampling and boots every plugin added so far. May be
    /// called again to boot plugins added later.
    ///
    /// # Errors
    ///
    /// The first plugin failure. A plugin exceeding `pluginTimeout` is fatal.
    pub async fn ready(&self) -> Result<(), HemeraError> {
        if self.shared.lifecycle.is_closing() {
            return Err(HemeraError::hemera("instance is closed"));
        }
        self.shared.load.start(Arc::new(ProcfsProbe));

        let root = Self::from_shared(Arc::clone(&self.shared));
        let timeout = self.shared.config.plugin_timeout_duration();
        if let Err(err) = self.shared.plugins.boot_pending(&root, timeout).await {
            if err.is(ErrorKind::Fatal) {
                self.shared.fatal(&err);
            }
            return Err(err);
        }

        self.shared.lifecycle.set_ready();
        info!(name = %self.name(), plugins = self.shared.plugins.names().len(), "instance ready");
        Ok(())
    }

    /// Adds a plugin; it registers on the next [`Hemera::ready`].
    ///
    /// # Errors
    ///
    /// Fails when a plugin of the same name exists.
    pub fn use_plugin<T: Plugin>(&self, plugin: T) -> Result<Arc<T>, HemeraError> {
        self.shared.plugins.register(plugin)
    }

    #[must_use]
    pub fn plugin<T: Plugin>(&self) -> Option<Arc<T>> {
        self.shared.plugins.get::<T>()
    }

    /// Closes the instance.
    ///
    /// `onClose` hooks run first, root before plugins; their failures are
    /// reported as events and never stop the shutdown. Server subscriptions
    /// are removed next, in-flight handlers get up to `timeout` to finish,
    /// plugins close in reverse order, and finally the transport is flushed
    /// and closed. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Only a failing transport teardown is returned.
    pub async fn close(&self) -> Result<(), HemeraError> {
        if !self.shared.lifecycle.begin_close() {
            return Ok(());
        }
        let shared = &self.shared;
        info!(name = %shared.config.name, "closing");

        for hook in shared.root.close_hooks() {
            if let Err(err) = hook(()).await {
                warn!(error = %err, "onClose hook failed");
                shared.emit(HemeraEvent::Error(err));
            }
        }

        let entries: Vec<TopicEntry> = shared.topics.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            shared.stop_topic(entry);
        }

        if !shared.lifecycle.wait_for_drain(shared.config.timeout_duration()).await {
            warn!(in_flight = shared.lifecycle.in_flight_count(), "closing with requests still in flight");
        }

        for failure in shared.plugins.close_all().await {
            shared.emit(HemeraEvent::Error(HemeraError::hemera(format!("{failure:#}"))));
        }

        for act in shared.router.remove_where(|_, _| true) {
            if let Some(breaker) = act.breaker() {
                breaker.shutdown();
            }
        }
        shared.load.stop().await;

        if let Err(err) = shared.transport.flush().await {
            debug!(error = %err, "flush during close failed");
        }
        let result = shared.transport.close().await.map_err(HemeraError::from);
        shared.lifecycle.set_closed();
        info!(name = %shared.config.name, "closed");
        result
    }

    // -- extension -----------------------------------------------------------

    /// Appends `hook` to the chain of `point` in this handle's scope.
    ///
    /// # Errors
    ///
    /// `onAdd` and `onClose` take [`Hemera::on_add`] and [`Hemera::on_close`].
    pub fn ext(&self, point: ExtensionPoint, hook: Hook<Exchange>) -> Result<(), HemeraError> {
        self.scope.add_hook(point, hook)
    }

    pub fn on_add(&self, hook: Hook<Pattern>) {
        self.scope.on_add(hook);
    }

    pub fn on_close(&self, hook: Hook<()>) {
        self.scope.on_close(hook);
    }

    /// # Errors
    ///
    /// Fails when `key` is already visible from this scope.
    pub fn decorate(&self, key: impl Into<String>, value: Value) -> Result<(), HemeraError> {
        self.scope.decorate(key, value)
    }

    #[must_use]
    pub fn decoration(&self, key: &str) -> Option<Value> {
        self.scope.decoration(key)
    }

    /// Registers a custom error class.
    ///
    /// # Errors
    ///
    /// Fails when the name is taken.
    pub fn register_error(&self, name: &str, parent: ErrorKind) -> Result<ErrorClass, HemeraError> {
        self.shared.errors.register(name, parent)
    }

    /// Edits the encoder pipeline. Steps run in insertion order.
    pub fn with_encoder(&self, f: impl FnOnce(&mut CodecPipeline)) {
        f(&mut self.shared.encoder.write());
    }

    /// Edits the decoder pipeline. Steps run in insertion order.
    pub fn with_decoder(&self, f: impl FnOnce(&mut CodecPipeline)) {
        f(&mut self.shared.decoder.write());
    }

    // -- server --------------------------------------------------------------

    /// Registers `handler` for `pattern`.
    ///
    /// # Errors
    ///
    /// - the pattern has no valid topic
    /// - an `onAdd` hook failed
    /// - the topic is subscribed with different transport options
    /// - the router rejected the pattern (`PatternConflictError`)
    pub async fn add<H: Handler>(&self, pattern: Value, handler: H) -> Result<Arc<ActMeta>, HemeraError> {
        let pattern = Pattern::with_topic(pattern)?;
        self.register(pattern, None, Arc::new(handler)).await
    }

    /// Like [`Hemera::add`], validating every payload against `schema`
    /// before the handler runs.
    ///
    /// # Errors
    ///
    /// As [`Hemera::add`].
    pub async fn add_with_schema<H: Handler>(
        &self,
        pattern: Value,
        schema: PayloadSchema,
        handler: H,
    ) -> Result<Arc<ActMeta>, HemeraError> {
        let pattern = Pattern::with_topic(pattern)?;
        self.register(pattern, Some(schema), Arc::new(handler)).await
    }

    async fn register(
        &self,
        pattern: Pattern,
        schema: Option<PayloadSchema>,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<ActMeta>, HemeraError> {
        let shared = &self.shared;
        if shared.lifecycle.is_closing() {
            return Err(HemeraError::hemera("instance is closed").with_pattern(pattern));
        }

        let before = pattern.clone();
        let pattern = match run_chain(&self.scope.add_hooks(), pattern).await? {
            Flow::Completed(pattern) => pattern,
            Flow::Responded(_) => before,
        };
        let topic = pattern.topic().unwrap_or_default().to_string();
        Subject::parse(&topic)?;

        let options = TopicOptions::from_pattern(&pattern);
        let cleaned = pattern.payload();
        let breaker = shared.config.circuit_breaker.enabled.then(|| {
            CircuitBreaker::new(
                cleaned.signature(),
                shared.config.circuit_breaker.clone(),
                Some(shared.transitions.clone()),
            )
        });

        let mut topics = shared.topics.lock();
        if topics.get(&topic).is_some_and(|entry| !entry.is_live()) {
            if let Some(entry) = topics.remove(&topic) {
                debug!(%topic, sid = entry.sid, "replacing ended subscription");
                for act in shared.router.remove_where(|_, act| act.sid() == entry.sid) {
                    if let Some(breaker) = act.breaker() {
                        breaker.shutdown();
                    }
                }
            }
        }
        let (sid, created) = match topics.get(&topic) {
            Some(entry) if entry.options != options => {
                return Err(HemeraError::hemera(format!(
                    "topic `{topic}` is already subscribed with different transport options"
                ))
                .with_property("topic", topic.as_str())
                .with_pattern(cleaned));
            }
            Some(entry) => (entry.sid, false),
            None => {
                let subscription = shared
                    .transport
                    .subscribe(&topic, options.subscribe_options())
                    .map_err(|e| shared.transport_failure(e))?;
                let sid = subscription.sid;
                let pipeline =
                    build_dispatch_pipeline(Dispatcher::new(Arc::clone(&shared.router), shared.config.name.as_str()), Arc::clone(&shared.load));
                let live = Arc::new(AtomicBool::new(true));
                let listener =
                    server::spawn_listener(Arc::downgrade(shared), topic.clone(), subscription, pipeline, Arc::clone(&live));
                topics.insert(
                    topic.clone(),
                    TopicEntry {
                        options: options.clone(),
                        sid,
                        live,
                        listener,
                    },
                );
                debug!(%topic, sid, queue = ?options.queue, "topic subscribed");
                (sid, true)
            }
        };

        let act = Arc::new(ActMeta::new(ActMetaParts {
            id: shared.next_act_id.fetch_add(1, Ordering::Relaxed),
            pattern: cleaned,
            schema,
            handler,
            scope: Arc::clone(&self.scope),
            options,
            sid,
            breaker,
        }));
        if let Err(err) = shared.router.add(act.pattern(), Arc::clone(&act)) {
            if let Some(breaker) = act.breaker() {
                breaker.shutdown();
            }
            if created {
                if let Some(entry) = topics.remove(&topic) {
                    shared.stop_topic(entry);
                }
            }
            return Err(err);
        }
        drop(topics);

        info!(pattern = %act.pattern(), id = act.id(), scope = self.scope.name(), "pattern added");
        Ok(act)
    }

    /// Removes registrations by topic or by subscription id.
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Fails when given an empty topic.
    pub fn remove(&self, target: impl Into<Removal>) -> Result<bool, HemeraError> {
        let shared = &self.shared;
        let topic = match target.into() {
            Removal::Topic(topic) if topic.is_empty() => {
                return Err(HemeraError::hemera("remove needs a topic or a subscription id"));
            }
            Removal::Topic(topic) => topic,
            Removal::Sid(sid) => {
                let topics = shared.topics.lock();
                match topics.iter().find(|(_, entry)| entry.sid == sid) {
                    Some((topic, _)) => topic.clone(),
                    None => return Ok(false),
                }
            }
        };

        let removed = shared.router.remove_where(|pattern, _| pattern.topic() == Some(topic.as_str()));
        for act in &removed {
            if let Some(breaker) = act.breaker() {
                breaker.shutdown();
            }
        }
        let entry = shared.topics.lock().remove(&topic);
        let unsubscribed = entry.is_some();
        if let Some(entry) = entry {
            shared.stop_topic(entry);
        }

        info!(%topic, registrations = removed.len(), "topic removed");
        Ok(unsubscribed || !removed.is_empty())
    }

    /// Registrations whose pattern contains `partial`; all of them for
    /// `None`.
    ///
    /// # Errors
    ///
    /// Fails when `partial` is not an object.
    pub fn list(&self, partial: Option<Value>) -> Result<Vec<Arc<ActMeta>>, HemeraError> {
        let partial = partial.map(Pattern::from_value).transpose()?;
        Ok(self.shared.router.list(partial.as_ref()))
    }

    // -- client --------------------------------------------------------------

    /// Calls `pattern` and waits for the first reply. Resolves to `null` for
    /// `pubsub$` patterns once published.
    ///
    /// # Errors
    ///
    /// - `TimeoutError` when no reply arrives in time
    /// - `MaxRecursionError` when the recursion guard trips
    /// - the remote error, rebuilt from the wire
    pub async fn act(&self, pattern: Value) -> Result<Value, HemeraError> {
        let pattern = Pattern::with_topic(pattern)?;
        let span = info_span!("act", topic = pattern.topic().unwrap_or_default(), name = %self.shared.config.name);
        async move {
            let outcome = match client::send(&self.shared, &self.scope, self.parent.as_ref(), pattern).await? {
                Sent::Answered(value) => Ok(value),
                Sent::Published => Ok(Value::Null),
                Sent::Awaiting(mut stream) => stream
                    .next()
                    .await
                    .unwrap_or_else(|| Err(HemeraError::hemera("reply stream ended without a reply"))),
            };
            metrics::counter!("hemera_acts_total", "outcome" => if outcome.is_ok() { "ok" } else { "error" })
                .increment(1);
            outcome
        }
        .instrument(span)
        .await
    }

    /// Calls `pattern` and streams every reply (`maxMessages$`,
    /// `expectedMessages$`).
    ///
    /// # Errors
    ///
    /// Failures before the request is published; later ones arrive on the
    /// stream.
    pub async fn act_stream(&self, pattern: Value) -> Result<ReplyStream, HemeraError> {
        let pattern = Pattern::with_topic(pattern)?;
        Ok(
            match client::send(&self.shared, &self.scope, self.parent.as_ref(), pattern).await? {
                Sent::Answered(value) => ReplyStream::answered(value),
                Sent::Published => ReplyStream::empty(),
                Sent::Awaiting(stream) => stream,
            },
        )
    }
}

impl std::fmt::Debug for Hemera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hemera")
            .field("name", &self.shared.config.name)
            .field("scope", &self.scope.name())
            .field("state", &self.shared.lifecycle.state())
            .field("registrations", &self.shared.router.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
