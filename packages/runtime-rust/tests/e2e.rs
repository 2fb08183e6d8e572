//! End-to-end behavior of client and server instances sharing an in-memory
//! broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hemera_core::{ErrorKind, FieldKind, HemeraError, MsgPackCodec, PayloadSchema};
use hemera_runtime::config::{CircuitBreakerConfig, LoadConfig, LoadPolicy};
use hemera_runtime::{
    sync_hook, Exchange, ExtensionPoint, Hemera, HemeraConfig, HemeraEvent, LoadSample, MemoryBroker, Next, Plugin,
    Reply, Request,
};
use serde_json::{json, Value};

fn config() -> HemeraConfig {
    HemeraConfig {
        crash_on_fatal: false,
        ..HemeraConfig::default()
    }
}

fn instance_with(broker: &MemoryBroker, config: HemeraConfig) -> Hemera {
    Hemera::new(Arc::new(broker.connect()), config).unwrap()
}

fn instance(broker: &MemoryBroker) -> Hemera {
    instance_with(broker, config())
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

/// Polls `check` until it holds, failing after one second.
async fn settle(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold within a second");
}

// ---------------------------------------------------------------------------
// Request/response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_then_act_resolves_the_sum() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server.ready().await.unwrap();
    server
        .add(json!({ "topic": "math", "cmd": "add" }), |req: Request, _reply: Reply| async move {
            Ok::<_, HemeraError>(json!(req.i64("a")? + req.i64("b")?))
        })
        .await
        .unwrap();

    let sum = client.act(json!({ "topic": "math", "cmd": "add", "a": 1, "b": 2 })).await.unwrap();
    assert_eq!(sum, json!(3));
}

#[tokio::test]
async fn unknown_patterns_are_not_found() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "math", "cmd": "add" }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(json!(0))
        })
        .await
        .unwrap();

    let err = client.act(json!({ "topic": "math", "cmd": "mul" })).await.unwrap_err();
    assert!(err.is(ErrorKind::PatternNotFound));
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_and_late_replies_are_dropped() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance_with(
        &broker,
        HemeraConfig {
            timeout: 150,
            ..config()
        },
    );
    let finished = counter();
    let done = Arc::clone(&finished);
    server
        .add(json!({ "topic": "math", "cmd": "add" }), move |_req: Request, _reply: Reply| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HemeraError>(json!(3))
            }
        })
        .await
        .unwrap();

    let mut replies = client
        .act_stream(json!({ "topic": "math", "cmd": "add", "a": 1, "b": 2 }))
        .await
        .unwrap();
    let err = replies.next().await.unwrap().unwrap_err();
    assert!(err.is(ErrorKind::Timeout));
    assert_eq!(err.property("timeout"), Some(&json!(150)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(replies.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn per_call_timeout_overrides_the_default() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "slow" }), |_req: Request, _reply: Reply| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, HemeraError>(Value::Null)
        })
        .await
        .unwrap();

    let err = client.act(json!({ "topic": "slow", "timeout$": 100 })).await.unwrap_err();
    assert!(err.is(ErrorKind::Timeout));
    assert!(client.act(json!({ "topic": "slow" })).await.is_ok());
}

#[tokio::test]
async fn streaming_replies_arrive_in_order() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "count" }), |_req: Request, reply: Reply| async move {
            reply.next(json!(1)).await?;
            reply.next(json!(2)).await?;
            Ok::<_, HemeraError>(json!(3))
        })
        .await
        .unwrap();

    let replies = client
        .act_stream(json!({ "topic": "count", "maxMessages$": 3 }))
        .await
        .unwrap();
    assert_eq!(replies.collect().await.unwrap(), vec![json!(1), json!(2), json!(3)]);

    // Without maxMessages$ only the first reply is taken.
    assert_eq!(client.act(json!({ "topic": "count" })).await.unwrap(), json!(1));
}

#[tokio::test]
async fn unbounded_streams_run_until_dropped() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "feed" }), |_req: Request, reply: Reply| async move {
            for tick in 1..=4 {
                reply.next(json!(tick)).await?;
            }
            Ok::<_, HemeraError>(json!(5))
        })
        .await
        .unwrap();
    assert_eq!(broker.subscription_count(), 1);

    let mut replies = client
        .act_stream(json!({ "topic": "feed", "maxMessages$": -1 }))
        .await
        .unwrap();
    for expected in 1..=5 {
        assert_eq!(replies.next().await.unwrap().unwrap(), json!(expected));
    }
    // Still listening: the inbox stays until the caller lets go.
    assert_eq!(replies.received(), 5);
    assert_eq!(broker.subscription_count(), 2);

    drop(replies);
    assert_eq!(broker.subscription_count(), 1);
}

#[tokio::test]
async fn finished_replies_release_the_inbox() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "math" }), |_req: Request, _reply: Reply| async { Ok::<_, HemeraError>(json!(1)) })
        .await
        .unwrap();

    let replies = client.act_stream(json!({ "topic": "math" })).await.unwrap();
    assert_eq!(replies.collect().await.unwrap(), vec![json!(1)]);
    assert_eq!(broker.subscription_count(), 1);
}

#[tokio::test]
async fn exhausted_registrations_leave_with_their_subscription() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "once", "cmd": "a", "maxMessages$": 1 }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(json!("a"))
        })
        .await
        .unwrap();

    assert_eq!(client.act(json!({ "topic": "once", "cmd": "a" })).await.unwrap(), json!("a"));
    settle(|| server.list(None).unwrap().is_empty()).await;
    assert_eq!(broker.subscription_count(), 0);

    // The topic subscribes again for the next registration.
    server
        .add(json!({ "topic": "once", "cmd": "b", "maxMessages$": 1 }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(json!("b"))
        })
        .await
        .unwrap();
    assert_eq!(server.list(None).unwrap().len(), 1);
    assert_eq!(client.act(json!({ "topic": "once", "cmd": "b" })).await.unwrap(), json!("b"));
    settle(|| server.list(None).unwrap().is_empty()).await;
}

#[tokio::test]
async fn pubsub_acts_resolve_after_publish() {
    let broker = MemoryBroker::new();
    let first = instance(&broker);
    let second = instance(&broker);
    let client = instance(&broker);
    let seen = counter();
    for server in [&first, &second] {
        let seen = Arc::clone(&seen);
        server
            .add(json!({ "topic": "audit", "pubsub$": true }), move |_req: Request, reply: Reply| {
                let seen = Arc::clone(&seen);
                async move {
                    assert!(!reply.is_open());
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HemeraError>(Value::Null)
                }
            })
            .await
            .unwrap();
    }

    let answer = client.act(json!({ "topic": "audit", "pubsub$": true, "event": "login" })).await.unwrap();
    assert_eq!(answer, Value::Null);
    tokio::time::timeout(Duration::from_secs(1), async {
        while seen.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn request_mode_topics_are_served_once_per_queue_group() {
    let broker = MemoryBroker::new();
    let client = instance(&broker);
    let calls = counter();
    let mut servers = Vec::new();
    for _ in 0..3 {
        let server = instance(&broker);
        let calls = Arc::clone(&calls);
        server
            .add(json!({ "topic": "math" }), move |_req: Request, _reply: Reply| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HemeraError>(json!("ok"))
                }
            })
            .await
            .unwrap();
        servers.push(server);
    }

    for _ in 0..5 {
        client.act(json!({ "topic": "math" })).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broader_wildcard_registered_first_wins() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    let narrow_calls = counter();
    server
        .add(json!({ "topic": "systems-europe.a.>" }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(json!("broad"))
        })
        .await
        .unwrap();
    let calls = Arc::clone(&narrow_calls);
    server
        .add(json!({ "topic": "systems-europe.a.*" }), move |_req: Request, _reply: Reply| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HemeraError>(json!("narrow"))
            }
        })
        .await
        .unwrap();

    let answer = client.act(json!({ "topic": "systems-europe.a.info" })).await.unwrap();
    assert_eq!(answer, json!("broad"));
    tokio::task::yield_now().await;
    assert_eq!(narrow_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn conflicting_transport_options_leave_one_registration() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let noop = |_req: Request, _reply: Reply| async { Ok::<_, HemeraError>(Value::Null) };
    server
        .add(json!({ "topic": "math", "cmd": "send", "pubsub$": true }), noop)
        .await
        .unwrap();

    let err = server.add(json!({ "topic": "math", "cmd": "send" }), noop).await.unwrap_err();
    assert!(err.is(ErrorKind::Hemera));
    assert_eq!(server.list(None).unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_wildcards_are_rejected_at_registration() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let result = server
        .add(json!({ "topic": "a.>.b" }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(Value::Null)
        })
        .await;
    assert!(result.is_err());
    assert_eq!(broker.subscription_count(), 0);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registered_error_classes_keep_identity_across_instances() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    let server_class = server.register_error("Unauthorized", ErrorKind::Business).unwrap();
    let client_class = client.register_error("Unauthorized", ErrorKind::Business).unwrap();

    let raise = server_class.clone();
    server
        .add(json!({ "topic": "auth", "cmd": "check" }), move |_req: Request, _reply: Reply| {
            let err = raise.error("token expired").with_property("code", 401);
            async move { Err::<Value, _>(err) }
        })
        .await
        .unwrap();

    let err = client.act(json!({ "topic": "auth", "cmd": "check" })).await.unwrap_err();
    assert!(err.is(ErrorKind::Business));
    assert_eq!(err.message(), "token expired");
    assert_eq!(err.hops().len(), 1);
    assert_eq!(err.pattern().and_then(|p| p.get("cmd")), Some(&json!("check")));

    let root = err.root_cause();
    assert_eq!(root.name(), "Unauthorized");
    assert!(root.is_instance_of(&client_class));
    assert!(!root.is_instance_of(&server_class));
    assert_eq!(root.property("code"), Some(&json!(401)));
}

#[tokio::test]
async fn on_error_may_answer_instead() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "flaky" }), |_req: Request, _reply: Reply| async {
            Err::<Value, _>(HemeraError::business("down"))
        })
        .await
        .unwrap();
    server
        .add(json!({ "topic": "annotated" }), |_req: Request, _reply: Reply| async {
            Err::<Value, _>(HemeraError::business("down"))
        })
        .await
        .unwrap();
    server
        .ext(
            ExtensionPoint::OnError,
            sync_hook(|mut ex: Exchange| {
                if ex.pattern.topic() == Some("flaky") {
                    return Ok(Next::Respond(json!("fallback")));
                }
                if let Some(Err(err)) = ex.outcome.as_mut() {
                    err.set_property("retryable", true);
                }
                Ok(Next::Continue(ex))
            }),
        )
        .unwrap();

    assert_eq!(client.act(json!({ "topic": "flaky" })).await.unwrap(), json!("fallback"));
    let err = client.act(json!({ "topic": "annotated" })).await.unwrap_err();
    assert_eq!(err.property("retryable"), Some(&json!(true)));
}

#[tokio::test]
async fn handler_panics_become_implementation_errors() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "buggy" }), |_req: Request, _reply: Reply| async {
            let items: Vec<u32> = Vec::new();
            Ok::<_, HemeraError>(json!(items[3]))
        })
        .await
        .unwrap();

    let err = client.act(json!({ "topic": "buggy" })).await.unwrap_err();
    assert!(err.is(ErrorKind::Implementation));
    assert!(client.act(json!({ "topic": "buggy" })).await.is_err());
}

#[tokio::test]
async fn schema_failures_never_reach_the_handler() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    let calls = counter();
    let seen = Arc::clone(&calls);
    server
        .add_with_schema(
            json!({ "topic": "math", "cmd": "add" }),
            PayloadSchema::new()
                .required("a", FieldKind::Integer)
                .required("b", FieldKind::Integer),
            move |req: Request, _reply: Reply| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HemeraError>(json!(req.i64("a")? + req.i64("b")?))
                }
            },
        )
        .await
        .unwrap();

    let err = client
        .act(json!({ "topic": "math", "cmd": "add", "a": "one", "b": 2 }))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::PayloadValidation));
    assert!(err.property("errors").is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(
        client.act(json!({ "topic": "math", "cmd": "add", "a": 1, "b": 2 })).await.unwrap(),
        json!(3)
    );
}

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn meta_delegate_and_context_follow_their_scopes() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    server
        .add(json!({ "topic": "inner" }), |req: Request, _reply: Reply| async move {
            Ok::<_, HemeraError>(json!({
                "meta": req.meta(),
                "delegate": req.delegate(),
                "context": req.context(),
            }))
        })
        .await
        .unwrap();
    server
        .add(json!({ "topic": "outer" }), |req: Request, _reply: Reply| async move {
            let inner = req
                .hemera()
                .act(json!({ "topic": "inner", "meta$": { "step": 2 }, "context$": { "tenant": "ignored" } }))
                .await?;
            Ok::<_, HemeraError>(json!({ "delegate": req.delegate(), "inner": inner }))
        })
        .await
        .unwrap();

    let answer = client
        .act(json!({
            "topic": "outer",
            "meta$": { "user": "ada" },
            "delegate$": { "token": "secret" },
            "context$": { "tenant": "acme" },
        }))
        .await
        .unwrap();

    assert_eq!(answer["delegate"], json!({ "token": "secret" }));
    assert_eq!(answer["inner"]["meta"], json!({ "user": "ada", "step": 2 }));
    assert_eq!(answer["inner"]["delegate"], json!({}));
    assert_eq!(answer["inner"]["context"], json!({ "tenant": "acme" }));
}

#[tokio::test]
async fn recursion_guard_stops_self_calls() {
    let broker = MemoryBroker::new();
    let server = instance_with(
        &broker,
        HemeraConfig {
            max_recursion: 2,
            ..config()
        },
    );
    let client = instance(&broker);
    let depth = counter();
    let seen = Arc::clone(&depth);
    server
        .add(json!({ "topic": "loop" }), move |req: Request, _reply: Reply| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                req.hemera().act(json!({ "topic": "loop" })).await
            }
        })
        .await
        .unwrap();

    let err = client.act(json!({ "topic": "loop" })).await.unwrap_err();
    assert!(err.root_cause().is(ErrorKind::MaxRecursion));
    assert_eq!(depth.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overloaded_servers_reject_before_the_handler() {
    let broker = MemoryBroker::new();
    let server = instance_with(
        &broker,
        HemeraConfig {
            load: LoadConfig {
                policy: LoadPolicy {
                    max_rss_bytes: 1024,
                    ..LoadPolicy::default()
                },
                ..LoadConfig::default()
            },
            ..config()
        },
    );
    let client = instance(&broker);
    let calls = counter();
    let seen = Arc::clone(&calls);
    server
        .add(json!({ "topic": "math" }), move |_req: Request, _reply: Reply| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HemeraError>(Value::Null)
            }
        })
        .await
        .unwrap();
    server.load().record(LoadSample {
        rss_bytes: 4096,
        ..LoadSample::default()
    });

    let err = client.act(json!({ "topic": "math" })).await.unwrap_err();
    assert!(err.is(ErrorKind::ProcessLoad));
    assert_eq!(err.property("metric"), Some(&json!("rss")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn open_circuits_gate_the_handler() {
    let broker = MemoryBroker::new();
    let server = instance_with(
        &broker,
        HemeraConfig {
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                max_failures: 2,
                ..CircuitBreakerConfig::default()
            },
            ..config()
        },
    );
    let client = instance(&broker);
    let mut transitions = server.circuit_transitions();
    let calls = counter();
    let seen = Arc::clone(&calls);
    server
        .add(json!({ "topic": "db" }), move |_req: Request, _reply: Reply| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(HemeraError::business("connection refused"))
            }
        })
        .await
        .unwrap();

    for _ in 0..2 {
        let err = client.act(json!({ "topic": "db" })).await.unwrap_err();
        assert!(err.is(ErrorKind::Business));
    }
    let err = client.act(json!({ "topic": "db" })).await.unwrap_err();
    assert!(err.is(ErrorKind::CircuitBreaker));
    assert_eq!(err.property("state"), Some(&json!("open")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(transitions.try_recv().is_ok());
}

// ---------------------------------------------------------------------------
// Extensions, plugins and codecs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_hooks_can_answer_locally() {
    let broker = MemoryBroker::new();
    let client = instance(&broker);
    client
        .ext(
            ExtensionPoint::OnClientPreRequest,
            sync_hook(|ex: Exchange| {
                if ex.pattern.topic() == Some("cache") {
                    return Ok(Next::Respond(json!("hit")));
                }
                Ok(Next::Continue(ex))
            }),
        )
        .unwrap();

    assert_eq!(client.act(json!({ "topic": "cache" })).await.unwrap(), json!("hit"));
}

struct Guarded {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for Guarded {
    fn name(&self) -> &'static str {
        "guarded"
    }

    async fn register(&self, hemera: &Hemera) -> anyhow::Result<()> {
        let calls = Arc::clone(&self.calls);
        hemera.ext(
            ExtensionPoint::OnRequest,
            sync_hook(move |ex: Exchange| {
                calls.fetch_add(1, Ordering::SeqCst);
                if ex.context.meta.get("user").is_none() {
                    return Err(HemeraError::business("login required"));
                }
                Ok(Next::Continue(ex))
            }),
        )?;
        hemera
            .add(json!({ "topic": "secret" }), |_req: Request, _reply: Reply| async {
                Ok::<_, HemeraError>(json!("classified"))
            })
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn plugin_hooks_apply_only_to_plugin_registrations() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    let calls = counter();
    server
        .use_plugin(Guarded {
            calls: Arc::clone(&calls),
        })
        .unwrap();
    server
        .add(json!({ "topic": "public" }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(json!("open"))
        })
        .await
        .unwrap();
    server.ready().await.unwrap();

    assert_eq!(client.act(json!({ "topic": "public" })).await.unwrap(), json!("open"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = client.act(json!({ "topic": "secret" })).await.unwrap_err();
    assert_eq!(err.message(), "login required");
    assert_eq!(
        client.act(json!({ "topic": "secret", "meta$": { "user": "ada" } })).await.unwrap(),
        json!("classified")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct Stuck;

#[async_trait]
impl Plugin for Stuck {
    fn name(&self) -> &'static str {
        "stuck"
    }

    async fn register(&self, _hemera: &Hemera) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn plugin_boot_timeout_is_fatal() {
    let broker = MemoryBroker::new();
    let server = instance_with(
        &broker,
        HemeraConfig {
            plugin_timeout: 50,
            ..config()
        },
    );
    let mut events = server.events();
    server.use_plugin(Stuck).unwrap();

    let err = server.ready().await.unwrap_err();
    assert!(err.is(ErrorKind::Fatal));
    let Ok(HemeraEvent::Fatal(reported)) = events.try_recv() else {
        panic!("fatal event expected");
    };
    assert_eq!(reported.property("plugin"), Some(&json!("stuck")));
}

#[tokio::test]
async fn close_hook_errors_do_not_block_shutdown() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let mut events = server.events();
    server
        .add(json!({ "topic": "math" }), |_req: Request, _reply: Reply| async {
            Ok::<_, HemeraError>(Value::Null)
        })
        .await
        .unwrap();
    server.on_close(sync_hook(|()| Err(HemeraError::hemera("flush failed"))));

    server.close().await.unwrap();
    assert_eq!(broker.subscription_count(), 0);
    assert!(matches!(events.try_recv(), Ok(HemeraEvent::Error(_))));
}

#[tokio::test]
async fn custom_codecs_must_match_on_both_sides() {
    let broker = MemoryBroker::new();
    let server = instance(&broker);
    let client = instance(&broker);
    for hemera in [&server, &client] {
        hemera.with_encoder(|encoder| {
            encoder.reset().add(Arc::new(MsgPackCodec));
        });
        hemera.with_decoder(|decoder| {
            decoder.reset().add(Arc::new(MsgPackCodec));
        });
    }
    server
        .add(json!({ "topic": "echo" }), |req: Request, _reply: Reply| async move {
            Ok::<_, HemeraError>(req.get("text").cloned().unwrap_or(Value::Null))
        })
        .await
        .unwrap();

    assert_eq!(
        client.act(json!({ "topic": "echo", "text": "über" })).await.unwrap(),
        json!("über")
    );
}
