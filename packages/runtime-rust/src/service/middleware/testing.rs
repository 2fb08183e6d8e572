//! Stub services shared by the middleware tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use hemera_core::{CallContext, HemeraError, Pattern, RequestKind};
use serde_json::Value;
use tower::Service;

use crate::config::HemeraConfig;
use crate::extension::{Exchange, Scope};
use crate::hemera::Hemera;
use crate::protocol::handler::Reply;
use crate::service::request::{Dispatched, InboundRequest};
use crate::transport::MemoryBroker;

pub(crate) fn inbound(pattern: Value) -> InboundRequest {
    let pattern = Pattern::from_value(pattern).unwrap();
    let context = CallContext::derive(None, &pattern);
    let transport = Arc::new(MemoryBroker::new().connect());
    InboundRequest {
        exchange: Exchange::new(pattern, context, "test"),
        kind: RequestKind::Request,
        reply: Reply::none(),
        hemera: Hemera::new(transport, HemeraConfig::default()).unwrap(),
    }
}

/// Answers every request with its own pattern, or with a business error.
#[derive(Clone)]
pub(crate) struct EchoService {
    fail: bool,
    calls: Arc<AtomicU32>,
}

impl EchoService {
    pub(crate) fn new() -> Self {
        Self {
            fail: false,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub(crate) fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Service<InboundRequest> for EchoService {
    type Response = Dispatched;
    type Error = HemeraError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, HemeraError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut exchange = req.exchange;
        exchange.outcome = Some(if self.fail {
            Err(HemeraError::business("echo failed"))
        } else {
            Ok(exchange.pattern.clone().into_value())
        });
        Box::pin(async move {
            Ok(Dispatched {
                exchange,
                scope: Scope::root("test"),
            })
        })
    }
}
