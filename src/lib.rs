//! tracekit-core - interception and span-activation engine for automatic
//! tracing instrumentation.
//!
//! Integration modules register tracer and observer hooks against callable
//! identities during the load phase; at runtime the [`Tracer`] trampoline
//! wraps instrumented calls with span lifecycle and observer dispatch,
//! while per-context span stacks stay consistent across synchronous
//! nesting, errors, and cooperative coroutine suspend/resume.
//!
//! ```
//! use std::sync::Arc;
//! use tracekit_core::{CallableIdentity, HookRegistry, Tracer, TracerOptions};
//!
//! let mut registry = HookRegistry::new();
//! let target = CallableIdentity::method("MemcachedClient", "get");
//! registry.register_tracer(
//!     target.clone(),
//!     Arc::new(|span, _outcome| span.set_tag("command", "get")),
//!     TracerOptions::default(),
//! );
//!
//! let tracer = Tracer::new(registry).with_service("cache");
//! let result = tracer.intercept(&target, &[], |_args| Ok(serde_json::json!("hit")));
//! assert!(result.is_ok());
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod span;

pub use context::{ContextId, ContextKind, ContextManager, ExecutionContext};
pub use engine::integration::{Integration, IntegrationLoader, LoadState};
pub use engine::registry::{
    CallObservation, CallOutcome, CallableIdentity, HookPhase, HookRegistry, ObserverCallback,
    TracerCallback, TracerOptions,
};
pub use engine::{DeferredClose, Tracer};
pub use error::{ContextError, EngineFault};
pub use span::{MemorySink, NullSink, Span, SpanHandle, SpanId, SpanKind, SpanSink, SpanStack};
