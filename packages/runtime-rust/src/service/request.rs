//! Request and response types of the dispatch pipeline.

use std::sync::Arc;

use hemera_core::{HemeraError, RequestKind};
use serde_json::Value;

use crate::extension::{Exchange, Scope};
use crate::hemera::Hemera;
use crate::protocol::handler::Reply;

static NULL: Value = Value::Null;

/// One decoded inbound request entering the dispatch pipeline.
#[derive(Debug)]
pub struct InboundRequest {
    /// Pattern and call context, as left by `onServerPreRequest`.
    pub exchange: Exchange,
    pub kind: RequestKind,
    pub reply: Reply,
    /// Handle of the receiving instance.
    pub hemera: Hemera,
}

impl InboundRequest {
    #[must_use]
    pub fn topic(&self) -> &str {
        self.exchange.pattern.topic().unwrap_or_default()
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.exchange.context.request_id
    }

    #[must_use]
    pub fn is_pubsub(&self) -> bool {
        self.kind == RequestKind::Pubsub
    }
}

/// A request that reached a registration.
///
/// The exchange always carries an outcome. Requests rejected before a
/// registration was resolved fail the pipeline call instead.
#[derive(Debug)]
pub struct Dispatched {
    pub exchange: Exchange,
    /// Scope of the resolved registration; response hooks run from it.
    pub scope: Arc<Scope>,
}

impl Dispatched {
    /// The outcome; `Ok(null)` if nothing was recorded.
    #[must_use]
    pub fn outcome(&self) -> Result<&Value, &HemeraError> {
        match &self.exchange.outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err),
            None => Ok(&NULL),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.exchange.error().is_some()
    }
}
