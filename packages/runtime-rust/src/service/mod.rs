//! Inbound request routing and execution.
//!
//! 1. **Routing** (`router`): pattern to registration, most specific match first
//! 2. **Middleware** (`middleware`): Tower layers (metrics, load-shedding)
//! 3. **Dispatch** (`dispatch`): registration hooks, schema, handler
//! 4. **Plugins** (`registry`): scoped plugin boot and shutdown

pub mod dispatch;
pub mod middleware;
pub mod registry;
pub mod request;
pub mod router;

// Re-export key types for convenient access.
pub use dispatch::{Dispatcher, Registrations};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use registry::{Plugin, PluginRegistry};
pub use request::{Dispatched, InboundRequest};
pub use router::PatternRouter;
