//! Request/response protocol over the transport.
//!
//! - [`client`]: `act`, reply inboxes, timeouts and reply streams
//! - [`server`]: topic listeners and the per-message server pipeline
//! - [`act_meta`]: registered handlers and their topic options
//! - [`handler`]: what a handler receives

pub mod act_meta;
pub mod client;
pub mod handler;
pub(crate) mod server;

pub use act_meta::{ActMeta, TopicOptions};
pub use client::ReplyStream;
pub use handler::{Handler, Reply, ReplySink, Request};
