//! Tower middleware layers for the inbound pipeline.
//!
//! - [`metrics`]: request timing and outcome via `tracing` spans and `metrics`
//! - [`load_shed`]: admission check against the process load policy
//! - [`pipeline`]: composes the layers around the dispatcher

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};

#[cfg(test)]
pub(crate) mod testing;
