//! Pipeline composition: wraps the dispatcher with the middleware layers.

use std::sync::Arc;

use hemera_core::HemeraError;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use crate::load::LoadMonitor;
use crate::service::dispatch::Dispatcher;
use crate::service::request::{Dispatched, InboundRequest};

/// The composed inbound pipeline. Cloned once per inbound message.
pub type DispatchPipeline = BoxCloneService<InboundRequest, Dispatched, HemeraError>;

/// Builds the inbound pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer`: span, duration and outcome of every request, shed ones
///    included
/// 2. `LoadShedLayer`: admission check against the load policy
/// 3. `Dispatcher`: lookup, hooks and handler
#[must_use]
pub fn build_dispatch_pipeline(dispatcher: Dispatcher, load: Arc<LoadMonitor>) -> DispatchPipeline {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(LoadShedLayer::new(load))
        .service(dispatcher);
    BoxCloneService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
