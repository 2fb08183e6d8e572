//! Per-call metadata and its propagation rules across a call chain.
//!
//! Three channels travel with a call:
//! - `meta$` is transitive: every descendant call inherits it, and may add to it.
//! - `delegate$` reaches only the next hop and is never inherited.
//! - `context$` is sticky: once set in a chain it is copied verbatim to every
//!   descendant and cannot be replaced further down.

use serde_json::{Map, Value};

use crate::packet::{Packet, RequestInfo, RequestKind};
use crate::pattern::Pattern;
use crate::trace::{new_id, Trace};

/// Identity, metadata and tracing information of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub request_id: String,
    pub meta: Map<String, Value>,
    pub delegate: Map<String, Value>,
    pub context: Map<String, Value>,
    pub trace: Trace,
    /// Consecutive nested calls of the same pattern, this one included.
    pub recursion: u32,
}

impl CallContext {
    /// Derives the context of a call to `pattern` issued from within `parent`
    /// (or from the top level when `parent` is `None`).
    #[must_use]
    pub fn derive(parent: Option<&CallContext>, pattern: &Pattern) -> Self {
        let service = pattern.topic().unwrap_or_default().to_string();
        let method = pattern.signature();

        let mut meta = parent.map(|p| p.meta.clone()).unwrap_or_default();
        if let Some(own) = pattern.meta() {
            meta.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let delegate = pattern.delegate().cloned().unwrap_or_default();

        let context = match parent {
            Some(p) if !p.context.is_empty() => p.context.clone(),
            _ => pattern.context().cloned().unwrap_or_default(),
        };

        let trace = match (parent, pattern.trace()) {
            (Some(p), _) => Trace::child_of(&p.trace, service, method.clone()),
            (None, Some(external)) => Trace::continue_from(external, service, method.clone()),
            (None, None) => Trace::root(service, method.clone()),
        };

        let recursion = match parent {
            Some(p) if p.trace.method == method => p.recursion.saturating_add(1),
            _ => 0,
        };

        Self {
            request_id: pattern
                .request_id()
                .map_or_else(new_id, str::to_string),
            meta,
            delegate,
            context,
            trace,
            recursion,
        }
    }

    /// Reads the context a server sees for an inbound request packet.
    /// The trace enters one more hop.
    #[must_use]
    pub fn inbound(packet: &Packet) -> Self {
        let mut trace = packet.trace.clone().unwrap_or_else(|| {
            let pattern = packet.pattern.clone().unwrap_or_default();
            Trace::root(pattern.topic().unwrap_or_default(), pattern.signature())
        });
        trace.enter_hop();

        Self {
            request_id: packet.request.id.clone(),
            meta: packet.meta.clone(),
            delegate: packet.delegate.clone(),
            context: packet.context.clone(),
            trace,
            recursion: packet.request.recursion,
        }
    }

    /// Builds the outbound request packet for `payload`.
    #[must_use]
    pub fn request_packet(&self, payload: Pattern, kind: RequestKind) -> Packet {
        Packet {
            pattern: Some(payload),
            meta: self.meta.clone(),
            delegate: self.delegate.clone(),
            context: self.context.clone(),
            trace: Some(self.trace.clone()),
            request: RequestInfo {
                id: self.request_id.clone(),
                kind,
                recursion: self.recursion,
            },
            result: None,
            error: None,
        }
    }

    /// Builds a reply packet; `delegate` is not sent back.
    #[must_use]
    pub fn reply_packet(&self, result: Option<Value>, error: Option<Value>) -> Packet {
        Packet {
            pattern: None,
            meta: self.meta.clone(),
            delegate: Map::new(),
            context: self.context.clone(),
            trace: Some(self.trace.clone()),
            request: RequestInfo {
                id: self.request_id.clone(),
                kind: RequestKind::Request,
                recursion: self.recursion,
            },
            result,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pattern(value: Value) -> Pattern {
        Pattern::from_value(value).unwrap()
    }

    #[test]
    fn meta_is_transitive_and_extendable() {
        let root = CallContext::derive(None, &pattern(json!({ "topic": "a", "meta$": { "user": "u1" } })));
        let child = CallContext::derive(Some(&root), &pattern(json!({ "topic": "b", "meta$": { "step": 2 } })));
        let grandchild = CallContext::derive(Some(&child), &pattern(json!({ "topic": "c" })));

        assert_eq!(grandchild.meta["user"], "u1");
        assert_eq!(grandchild.meta["step"], 2);
    }

    #[test]
    fn delegate_reaches_only_the_next_hop() {
        let root = CallContext::derive(None, &pattern(json!({ "topic": "a", "delegate$": { "token": "t" } })));
        assert_eq!(root.delegate["token"], "t");

        let child = CallContext::derive(Some(&root), &pattern(json!({ "topic": "b" })));
        assert!(child.delegate.is_empty());
    }

    #[test]
    fn context_is_sticky_and_immutable_downstream() {
        let root = CallContext::derive(None, &pattern(json!({ "topic": "a", "context$": { "tenant": "t1" } })));
        let child = CallContext::derive(
            Some(&root),
            &pattern(json!({ "topic": "b", "context$": { "tenant": "t2" } })),
        );
        let grandchild = CallContext::derive(Some(&child), &pattern(json!({ "topic": "c" })));

        assert_eq!(child.context["tenant"], "t1");
        assert_eq!(grandchild.context["tenant"], "t1");
    }

    #[test]
    fn trace_links_parent_and_child() {
        let root = CallContext::derive(None, &pattern(json!({ "topic": "a" })));
        let child = CallContext::derive(Some(&root), &pattern(json!({ "topic": "b" })));
        assert_eq!(child.trace.trace_id, root.trace.trace_id);
        assert_eq!(child.trace.parent_span_id.as_ref(), Some(&root.trace.span_id));
        assert_eq!(child.trace.service, "b");
    }

    #[test]
    fn recursion_counts_consecutive_same_pattern_calls() {
        let p = pattern(json!({ "topic": "a", "cmd": "loop" }));
        let first = CallContext::derive(None, &p);
        let second = CallContext::derive(Some(&first), &p);
        let third = CallContext::derive(Some(&second), &p);
        let other = CallContext::derive(Some(&third), &pattern(json!({ "topic": "b" })));

        assert_eq!(first.recursion, 0);
        assert_eq!(third.recursion, 2);
        assert_eq!(other.recursion, 0);
    }

    #[test]
    fn request_id_control_key_is_honored() {
        let ctx = CallContext::derive(None, &pattern(json!({ "topic": "a", "requestId$": "fixed" })));
        assert_eq!(ctx.request_id, "fixed");
    }

    #[test]
    fn inbound_enters_a_hop_and_reply_drops_delegate() {
        let client = CallContext::derive(None, &pattern(json!({ "topic": "a", "delegate$": { "d": 1 } })));
        let packet = client.request_packet(pattern(json!({ "topic": "a" })), RequestKind::Request);

        let server = CallContext::inbound(&packet);
        assert_eq!(server.trace.hop, client.trace.hop + 1);
        assert_eq!(server.delegate["d"], 1);

        let reply = server.reply_packet(Some(json!(3)), None);
        assert!(reply.delegate.is_empty());
        assert_eq!(reply.request.id, client.request_id);
    }
}
