//! Load-shedding middleware for inbound requests.
//!
//! Checks the latest process sample against the load policy and rejects the
//! request with `ProcessLoadError` before any registration is resolved. This
//! is an admission gate, not a queue: rejected requests are answered at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hemera_core::HemeraError;
use tower::{Layer, Service};
use tracing::debug;

use crate::load::LoadMonitor;
use crate::service::request::{Dispatched, InboundRequest};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that gates requests on the process load policy.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    monitor: Arc<LoadMonitor>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(monitor: Arc<LoadMonitor>) -> Self {
        Self { monitor }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            monitor: Arc::clone(&self.monitor),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    monitor: Arc<LoadMonitor>,
}

impl<S> Service<InboundRequest> for LoadShedService<S>
where
    S: Service<InboundRequest, Response = Dispatched, Error = HemeraError> + Send,
    S::Future: Send + 'static,
{
    type Response = Dispatched;
    type Error = HemeraError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, HemeraError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        if let Err(err) = self.monitor.check() {
            debug!(topic = req.topic(), request_id = req.request_id(), error = %err, "request shed");
            metrics::counter!("hemera_requests_shed_total").increment(1);
            let err = err.with_pattern(req.exchange.pattern.payload());
            return Box::pin(async move { Err(err) });
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
