//! Interceptor dispatch: span lifecycle, observers, reentrancy, isolation.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracekit_core::{
    CallableIdentity, HookPhase, HookRegistry, MemorySink, SpanSink, Tracer, TracerCallback,
    TracerOptions,
};

mod common;

fn noop_tracer() -> TracerCallback {
    Arc::new(|_span, _outcome| {})
}

fn build(registry: HookRegistry) -> (Tracer, Arc<MemorySink>) {
    common::init_logging();
    let sink = Arc::new(MemorySink::new());
    let tracer = Tracer::new(registry)
        .with_sink(sink.clone() as Arc<dyn SpanSink>)
        .with_service("test-service");
    (tracer, sink)
}

#[test]
fn test_single_interception_produces_one_closed_span() {
    let target = CallableIdentity::method("MemcachedClient", "get");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    let result = tracer
        .intercept(&target, &[json!("user:42")], |args| {
            assert_eq!(args[0], json!("user:42"));
            Ok(json!("hit"))
        })
        .unwrap();

    assert_eq!(result, json!("hit"));
    assert_eq!(tracer.contexts().depth(), 0);

    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "MemcachedClient.get");
    assert_eq!(spans[0].service, "test-service");
    assert!(spans[0].parent_id.is_none());
    assert!(spans[0].is_closed());
    assert!(!spans[0].error());
}

#[test]
fn test_nested_interception_parent_correctness() {
    let outer = CallableIdentity::function("handle_request");
    let inner = CallableIdentity::method("Db", "query");
    let mut registry = HookRegistry::new();
    registry.register_tracer(outer.clone(), noop_tracer(), TracerOptions::default());
    registry.register_tracer(inner.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    tracer
        .intercept(&outer, &[], |_| {
            assert_eq!(tracer.contexts().depth(), 1);
            tracer.intercept(&inner, &[], |_| {
                assert_eq!(tracer.contexts().depth(), 2);
                Ok(Value::Null)
            })
        })
        .unwrap();

    // Stack discipline: no orphaned frames after a normal sequence.
    assert_eq!(tracer.contexts().depth(), 0);

    let spans = sink.take();
    assert_eq!(spans.len(), 2);
    // Close order: inner first.
    assert_eq!(spans[0].name, "Db.query");
    assert_eq!(spans[1].name, "handle_request");
    assert_eq!(spans[0].parent_id, Some(spans[1].id));
    assert!(spans[1].parent_id.is_none());
}

fn recurse(tracer: &Tracer, target: &CallableIdentity, depth: i64) -> anyhow::Result<Value> {
    tracer.intercept(target, &[json!(depth)], |_| {
        if depth == 0 {
            Ok(json!("bottom"))
        } else {
            recurse(tracer, target, depth - 1)
        }
    })
}

#[test]
fn test_reentrancy_suppression_one_span_for_recursive_calls() {
    let target = CallableIdentity::function("walk_tree");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    recurse(&tracer, &target, 4).unwrap();

    // Five nested invocations, exactly one span.
    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "walk_tree");
    assert_eq!(tracer.contexts().depth(), 0);
}

#[test]
fn test_recurse_option_opens_span_per_level() {
    let target = CallableIdentity::function("walk_tree");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions { recurse: true });
    let (tracer, sink) = build(registry);

    recurse(&tracer, &target, 2).unwrap();

    let spans = sink.take();
    assert_eq!(spans.len(), 3);
    // Innermost closes first; each is parented to the level above.
    assert_eq!(spans[0].parent_id, Some(spans[1].id));
    assert_eq!(spans[1].parent_id, Some(spans[2].id));
    assert!(spans[2].parent_id.is_none());
}

#[test]
fn test_reentrancy_counter_resets_after_sequence() {
    let target = CallableIdentity::function("walk_tree");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    recurse(&tracer, &target, 2).unwrap();
    recurse(&tracer, &target, 2).unwrap();

    // A fresh sequence opens a fresh span.
    assert_eq!(sink.take().len(), 2);
}

#[test]
fn test_tracer_callback_sees_args_and_retval() {
    let target = CallableIdentity::method("Db", "query");
    let mut registry = HookRegistry::new();
    registry.register_tracer(
        target.clone(),
        Arc::new(|span, outcome| {
            if let Some(sql) = outcome.args.first().and_then(|v| v.as_str()) {
                span.resource = sql.to_string();
            }
            if let Some(rows) = outcome.retval.and_then(|v| v.as_i64()) {
                span.set_metric("rows", rows as f64);
            }
            assert!(!outcome.is_error());
        }),
        TracerOptions::default(),
    );
    let (tracer, sink) = build(registry);

    tracer
        .intercept(&target, &[json!("SELECT 1")], |_| Ok(json!(3)))
        .unwrap();

    let spans = sink.take();
    assert_eq!(spans[0].resource, "SELECT 1");
    assert_eq!(spans[0].metric("rows"), Some(3.0));
}

#[test]
fn test_error_propagates_unmodified_and_marks_span() {
    let target = CallableIdentity::method("Db", "query");
    let error_hits = Arc::new(AtomicUsize::new(0));
    let post_hits = Arc::new(AtomicUsize::new(0));

    let mut registry = HookRegistry::new();
    registry.register_tracer(
        target.clone(),
        Arc::new(|span, outcome| {
            assert!(outcome.retval.is_none());
            assert!(outcome.error.is_some());
            span.set_tag("error.msg", outcome.error.unwrap_or_default());
        }),
        TracerOptions::default(),
    );
    {
        let error_hits = Arc::clone(&error_hits);
        registry.register_observer(
            target.clone(),
            HookPhase::Error,
            Arc::new(move |obs| {
                assert!(obs.error.is_some());
                error_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    {
        let post_hits = Arc::clone(&post_hits);
        registry.register_observer(
            target.clone(),
            HookPhase::Post,
            Arc::new(move |_| {
                post_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    let (tracer, sink) = build(registry);

    let result = tracer.intercept(&target, &[], |_| anyhow::bail!("connection refused"));

    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "connection refused");
    assert_eq!(error_hits.load(Ordering::SeqCst), 1);
    assert_eq!(post_hits.load(Ordering::SeqCst), 0);

    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].error());
    assert!(spans[0].is_closed());
    assert_eq!(spans[0].tag("error.msg"), Some("connection refused"));
    assert_eq!(tracer.contexts().depth(), 0);
}

#[test]
fn test_panic_in_callable_still_closes_span() {
    let target = CallableIdentity::function("explodes");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = tracer.intercept(&target, &[], |_| panic!("kaboom"));
    }));

    // The panic is re-raised to the caller.
    assert!(caught.is_err());

    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].error());
    assert!(spans[0].is_closed());
    assert_eq!(tracer.contexts().depth(), 0);
}

#[test]
fn test_closure_isolation_panicking_hooks_never_break_lifecycle() {
    let target = CallableIdentity::method("Cache", "get");
    let mut registry = HookRegistry::new();
    registry.register_tracer(
        target.clone(),
        Arc::new(|_span, _outcome| panic!("tracer callback bug")),
        TracerOptions::default(),
    );
    registry.register_observer(
        target.clone(),
        HookPhase::Pre,
        Arc::new(|_| panic!("pre observer bug")),
    );
    registry.register_observer(
        target.clone(),
        HookPhase::Post,
        Arc::new(|_| panic!("post observer bug")),
    );
    let (tracer, sink) = build(registry);

    // All three hooks panic; the call itself succeeds untouched.
    let result = tracer.intercept(&target, &[], |_| Ok(json!("value")));
    assert_eq!(result.unwrap(), json!("value"));

    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].is_closed());
    assert!(!spans[0].error());
    assert_eq!(tracer.contexts().depth(), 0);
}

#[test]
fn test_observer_order_and_phases() {
    let target = CallableIdentity::function("handler");
    let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut registry = HookRegistry::new();
    for label in ["first", "second"] {
        let log = Arc::clone(&log);
        registry.register_observer(
            target.clone(),
            HookPhase::Pre,
            Arc::new(move |obs| {
                assert!(obs.retval.is_none());
                log.lock().unwrap().push(format!("pre-{label}"));
            }),
        );
    }
    {
        let log = Arc::clone(&log);
        registry.register_observer(
            target.clone(),
            HookPhase::Post,
            Arc::new(move |obs| {
                assert_eq!(obs.retval, Some(&json!(7)));
                log.lock().unwrap().push("post".to_string());
            }),
        );
    }
    let (tracer, sink) = build(registry);

    tracer.intercept(&target, &[], |_| Ok(json!(7))).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["pre-first", "pre-second", "post"]
    );
    // Observer-only target: no tracer hook, no span.
    assert!(sink.is_empty());
}

#[test]
fn test_tracer_override_only_latest_registration_fires() {
    let target = CallableIdentity::method("Client", "call");
    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let mut registry = HookRegistry::new();
    {
        let first_hits = Arc::clone(&first_hits);
        registry.register_tracer(
            target.clone(),
            Arc::new(move |_span, _outcome| {
                first_hits.fetch_add(1, Ordering::SeqCst);
            }),
            TracerOptions::default(),
        );
    }
    {
        let second_hits = Arc::clone(&second_hits);
        registry.register_tracer(
            target.clone(),
            Arc::new(move |span, _outcome| {
                second_hits.fetch_add(1, Ordering::SeqCst);
                span.set_tag("version", "2");
            }),
            TracerOptions::default(),
        );
    }
    let (tracer, sink) = build(registry);

    tracer.intercept(&target, &[], |_| Ok(Value::Null)).unwrap();

    assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].tag("version"), Some("2"));
}

#[test]
fn test_shared_callback_on_method_and_function_targets() {
    // One callback wired to both a class-method target and a free-function
    // target; invoking the method once produces exactly one span.
    let method = CallableIdentity::method("MemcachedClient", "get");
    let function = CallableIdentity::function("memcached_get");
    let shared: TracerCallback = Arc::new(|span, _outcome| {
        span.set_tag("command", "get");
    });

    let mut registry = HookRegistry::new();
    registry.register_tracer(method.clone(), Arc::clone(&shared), TracerOptions::default());
    registry.register_tracer(function.clone(), shared, TracerOptions::default());
    let (tracer, sink) = build(registry);

    tracer
        .intercept(&method, &[json!("key")], |_| Ok(json!("hit")))
        .unwrap();

    let spans = sink.take();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "MemcachedClient.get");
    assert_eq!(spans[0].tag("command"), Some("get"));
}

#[test]
fn test_uninstrumented_target_passes_through() {
    let (tracer, sink) = build(HookRegistry::new());
    let target = CallableIdentity::function("plain");

    let result = tracer
        .intercept(&target, &[json!(1)], |args| Ok(args[0].clone()))
        .unwrap();

    assert_eq!(result, json!(1));
    assert!(sink.is_empty());
    assert_eq!(tracer.contexts().depth(), 0);
}

#[test]
fn test_manual_and_intercepted_spans_nest() {
    let target = CallableIdentity::method("Db", "query");
    let mut registry = HookRegistry::new();
    registry.register_tracer(target.clone(), noop_tracer(), TracerOptions::default());
    let (tracer, sink) = build(registry);

    let request = tracer.start_span("web.request");
    tracer
        .intercept(&target, &[], |_| Ok(Value::Null))
        .unwrap();
    tracer.close_span(request);

    let spans = sink.take();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].name, "Db.query");
    assert_eq!(spans[0].parent_id, Some(request.span_id()));
    assert_eq!(spans[1].name, "web.request");
}
