//! Metrics middleware for inbound requests.
//!
//! Wraps every request in an `inbound` tracing span and records its duration
//! and outcome through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use hemera_core::HemeraError;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::request::{Dispatched, InboundRequest};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records request duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// `ok`, `error` (the request failed after reaching a registration) or
/// `rejected` (it never reached one).
fn outcome_label(result: &Result<Dispatched, HemeraError>) -> &'static str {
    match result {
        Ok(dispatched) if dispatched.is_error() => "error",
        Ok(_) => "ok",
        Err(_) => "rejected",
    }
}

impl<S> Service<InboundRequest> for MetricsService<S>
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
        let topic = req.topic().to_string();
        let span = info_span!(
            "inbound",
            topic = %topic,
            request_id = req.request_id(),
            pubsub = req.is_pubsub(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "request complete");

                metrics::counter!("hemera_requests_total", "topic" => topic.clone(), "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("hemera_request_duration_seconds", "topic" => topic)
                    .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::testing::{inbound, EchoService};

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(EchoService::new());
        let dispatched = svc.oneshot(inbound(json!({ "topic": "math", "cmd": "add" }))).await.unwrap();
        assert_eq!(outcome_label(&Ok(dispatched)), "ok");
    }

    #[tokio::test]
    async fn rejections_are_labelled() {
        let rejected: Result<Dispatched, HemeraError> = Err(HemeraError::process_load("busy"));
        assert_eq!(outcome_label(&rejected), "rejected");

        let svc = MetricsLayer.layer(EchoService::failing());
        let dispatched = svc.oneshot(inbound(json!({ "topic": "math" }))).await.unwrap();
        assert!(dispatched.is_error());
        assert_eq!(outcome_label(&Ok(dispatched)), "error");
    }
}
