//! Hemera runtime: pattern-addressed request/response over publish/subscribe.
//!
//! A [`Hemera`] instance registers handlers for JSON patterns, subscribes one
//! transport subject per topic, and answers inbound requests through a
//! pipeline of extension hooks. Acts travel the same transport the other way.

pub mod breaker;
pub mod config;
pub mod extension;
pub mod hemera;
pub mod load;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod shutdown;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitState, CircuitTransition};
pub use config::{ConfigError, HemeraConfig};
pub use extension::{hook, sync_hook, Exchange, ExtensionPoint, Flow, Hook, Next, Scope};
pub use hemera::{Hemera, HemeraEvent, Removal};
pub use load::{LoadMonitor, LoadSample};
pub use protocol::{ActMeta, Handler, Reply, ReplyStream, Request};
pub use service::Plugin;
pub use shutdown::Lifecycle;
pub use transport::{MemoryBroker, MemoryTransport, Transport};

pub use hemera_core as core;
