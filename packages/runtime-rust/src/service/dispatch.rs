//! Innermost dispatch service: resolves the registration of an inbound
//! request and drives it through the registration's hooks and handler.
//!
//! Order after admission:
//! `lookup -> breaker gate -> onRequest -> schema -> preHandler -> middleware
//! -> handler -> onError`.

use std::any::Any;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use hemera_core::trace::now_millis;
use hemera_core::{HemeraError, Hop, Pattern, RequestKind, ValidationResult};
use tower::Service;
use tracing::{debug, warn};

use super::request::{Dispatched, InboundRequest};
use super::router::PatternRouter;
use crate::extension::{run_exchange, Exchange, ExtensionPoint};
use crate::protocol::act_meta::ActMeta;
use crate::protocol::handler::Request;

/// Router table shared by the instance and its dispatchers.
pub type Registrations = PatternRouter<Arc<ActMeta>>;

/// Resolves and runs registrations.
#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<Registrations>,
    app: Arc<str>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(router: Arc<Registrations>, app: impl Into<Arc<str>>) -> Self {
        Self {
            router,
            app: app.into(),
        }
    }
}

impl Service<InboundRequest> for Dispatcher {
    type Response = Dispatched;
    type Error = HemeraError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, HemeraError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        let router = Arc::clone(&self.router);
        let app = Arc::clone(&self.app);
        Box::pin(async move {
            let Some(act) = router.lookup(&req.exchange.pattern) else {
                let pattern = req.exchange.pattern.payload();
                return Err(HemeraError::pattern_not_found(format!(
                    "no registration matches `{}`",
                    pattern.signature()
                ))
                .with_pattern(pattern));
            };
            debug!(registration = act.id(), pattern = %act.pattern(), "resolved");

            let scope = Arc::clone(act.scope());
            let exchange = run_registration(&act, req, &app).await;
            Ok(Dispatched { exchange, scope })
        })
    }
}

async fn run_registration(act: &ActMeta, req: InboundRequest, app: &str) -> Exchange {
    let InboundRequest {
        exchange,
        kind,
        reply,
        hemera,
    } = req;
    let pubsub = kind == RequestKind::Pubsub;

    if let Some(breaker) = act.breaker() {
        if !breaker.available() {
            // Arms the half-open timer if it is not running.
            breaker.failure();
            let mut exchange = exchange;
            exchange.outcome = Some(Err(HemeraError::circuit_breaker(format!(
                "circuit of `{}` is open",
                act.pattern().signature()
            ))
            .with_property("state", breaker.state().name())
            .with_pattern(act.pattern().clone())));
            return exchange;
        }
    }

    let scope = act.scope();
    let mut exchange = match run_exchange(&scope.hooks(ExtensionPoint::OnRequest), exchange).await {
        ControlFlow::Continue(ex) => ex,
        ControlFlow::Break(ex) => return ex,
    };

    if let Some(schema) = act.schema() {
        if let ValidationResult::Invalid { errors } = schema.validate(&exchange.pattern) {
            exchange.outcome = Some(Err(HemeraError::payload_validation(errors.join("; "))
                .with_property("errors", errors)
                .with_pattern(exchange.pattern.payload())));
            return exchange;
        }
    }

    let exchange = match run_exchange(&scope.hooks(ExtensionPoint::PreHandler), exchange).await {
        ControlFlow::Continue(ex) => ex,
        ControlFlow::Break(ex) => return ex,
    };
    let mut exchange = match run_exchange(&act.seal(), exchange).await {
        ControlFlow::Continue(ex) => ex,
        ControlFlow::Break(ex) => return ex,
    };

    let payload = exchange.pattern.payload();
    let request = Request::new(
        payload.clone(),
        exchange.context.clone(),
        hemera.for_request(Arc::clone(scope), exchange.context.clone()),
    );
    let handler = act.handler();
    let caught = AssertUnwindSafe(handler.call(request, reply)).catch_unwind().await;

    let outcome = match caught {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(wrap_handler_error(err, &payload, app)),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(pattern = %payload, %message, "handler panicked");
            let err = if pubsub {
                HemeraError::fatal(format!("pubsub handler panicked: {message}"))
            } else {
                HemeraError::implementation(format!("handler panicked: {message}"))
            };
            let mut err = err.with_pattern(payload.clone());
            err.push_hop(hop(&payload, app));
            Err(err)
        }
    };

    if let Some(breaker) = act.breaker() {
        breaker.record(outcome.is_ok());
    }

    let failed = outcome.is_err();
    exchange.outcome = Some(outcome);
    if !failed {
        return exchange;
    }
    match run_exchange(&scope.hooks(ExtensionPoint::OnError), exchange).await {
        ControlFlow::Continue(ex) | ControlFlow::Break(ex) => ex,
    }
}

/// Wraps an error returned by a handler for the trip back to the caller:
/// a `BusinessError` caused by it, carrying the pattern and every hop so
/// far plus this one.
fn wrap_handler_error(err: HemeraError, pattern: &Pattern, app: &str) -> HemeraError {
    let mut wrapped = HemeraError::business(err.message().to_string()).with_pattern(pattern.clone());
    for prior in err.hops() {
        wrapped.push_hop(prior.clone());
    }
    wrapped.push_hop(hop(pattern, app));
    wrapped.caused_by(err)
}

fn hop(pattern: &Pattern, app: &str) -> Hop {
    Hop {
        service: pattern.topic().unwrap_or_default().to_string(),
        method: pattern.signature(),
        app: app.to_string(),
        timestamp: now_millis(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use hemera_core::ErrorKind;
    use serde_json::{json, Value};

    use super::*;

    fn p(value: Value) -> Pattern {
        Pattern::from_value(value).unwrap()
    }

    #[test]
    fn handler_errors_are_wrapped_with_their_hops() {
        let pattern = p(json!({ "topic": "math", "cmd": "add" }));
        let mut inner = HemeraError::new(ErrorKind::Hemera, "boom");
        inner.push_hop(hop(&p(json!({ "topic": "audit" })), "remote"));

        let wrapped = wrap_handler_error(inner, &pattern, "local");
        assert!(wrapped.is(ErrorKind::Business));
        assert_eq!(wrapped.message(), "boom");
        assert_eq!(wrapped.pattern(), Some(&pattern));
        assert_eq!(wrapped.cause().map(HemeraError::message), Some("boom"));

        let apps: Vec<&str> = wrapped.hops().iter().map(|h| h.app.as_str()).collect();
        assert_eq!(apps, vec!["remote", "local"]);
        assert_eq!(wrapped.hops()[1].method, "cmd:add,topic:math");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let text: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(text.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
