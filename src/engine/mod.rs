//! The interception engine - dispatch logic at instrumented call sites.
//!
//! [`Tracer`] composes the hook registry, the execution-context manager,
//! and the closure dispatcher behind one facade. [`Tracer::intercept`] is
//! the explicit trampoline inserted at the instrumentation boundary: it
//! wraps a call to the original callable with span lifecycle and observer
//! dispatch, and guarantees that a span is opened if and only if it is
//! closed exactly once, under errors, panics, and failing callbacks.

use anyhow::Result;
use serde_json::Value;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub mod dispatch;
pub mod integration;
pub mod registry;

use crate::context::ContextManager;
use crate::error::EngineFault;
use crate::span::{NullSink, Span, SpanHandle, SpanId, SpanSink};
use dispatch::ClosureDispatcher;
use registry::{
    CallOutcome, CallObservation, CallableIdentity, HookPhase, HookRegistry, HookSet,
    TracerCallback,
};

/// Explicit deferred-completion record: a span handle plus the captured
/// call arguments and enrichment callback, registered with the async
/// runtime's completion notification instead of a closure capturing engine
/// state. Completed via [`Tracer::complete_deferred`].
pub struct DeferredClose {
    handle: SpanHandle,
    captured_args: Vec<Value>,
    callback: Option<TracerCallback>,
}

impl DeferredClose {
    pub fn handle(&self) -> SpanHandle {
        self.handle
    }
}

/// The tracing engine facade.
///
/// Built once at process start from a registry the integrations populated
/// during the load phase; afterwards the registry is read lock-free on
/// every intercepted call.
pub struct Tracer {
    registry: Arc<HookRegistry>,
    contexts: ContextManager,
    dispatcher: ClosureDispatcher,
    sink: Arc<dyn SpanSink>,
    service: String,
}

impl Tracer {
    pub fn new(registry: HookRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            contexts: ContextManager::new(),
            dispatcher: ClosureDispatcher::new(),
            sink: Arc::new(NullSink),
            service: String::new(),
        }
    }

    /// Replace the closed-span consumer. The default discards spans.
    pub fn with_sink(mut self, sink: Arc<dyn SpanSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Service name stamped on every span this engine opens.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Execution-context operations: coroutine spawn, suspend, resume,
    /// destroy.
    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    // ========================================================================
    // Interception
    // ========================================================================

    /// Invoke `call` as the instrumented `target`.
    ///
    /// If a tracer hook is registered a span is opened around the call
    /// (subject to reentrancy suppression), Pre/Post/Error observers fire in
    /// registration order, and the tracer callback enriches the span just
    /// before it closes. The span is opened before Pre-phase observers run,
    /// so they already see it as active. The original callable's error or
    /// panic is re-raised unmodified; hooks never suppress errors.
    pub fn intercept<F>(&self, target: &CallableIdentity, args: &[Value], call: F) -> Result<Value>
    where
        F: FnOnce(&[Value]) -> Result<Value>,
    {
        let hooks = self.registry.lookup(target);
        let has_tracer = hooks.tracer.is_some();

        let opened = match hooks.tracer {
            Some(tracer) => self.contexts.with_current(|ctx| {
                let previous = ctx.enter_target(target);
                if previous == 0 || tracer.recurse {
                    let parent = ctx.active_parent();
                    let mut span = Span::new(target.to_string(), parent);
                    span.service = self.service.clone();
                    let id = span.id;
                    trace!(target = %target, span = %id, "opened span");
                    ctx.stack_mut().push(span);
                    Some(id)
                } else {
                    trace!(target = %target, depth = previous, "reentrant call, span suppressed");
                    None
                }
            }),
            None => None,
        };

        self.run_observers(&hooks, HookPhase::Pre, target, args, None, None);

        let outcome = catch_unwind(AssertUnwindSafe(|| call(args)));

        let result = match outcome {
            Ok(Ok(retval)) => {
                self.finish(target, &hooks, opened, args, Some(&retval), None);
                Ok(retval)
            }
            Ok(Err(error)) => {
                let message = format!("{error:#}");
                self.finish(target, &hooks, opened, args, None, Some(&message));
                Err(error)
            }
            Err(payload) => {
                let message = dispatch::panic_message(payload.as_ref());
                self.finish(target, &hooks, opened, args, None, Some(&message));
                if has_tracer {
                    self.contexts.with_current(|ctx| ctx.exit_target(target));
                }
                resume_unwind(payload)
            }
        };

        if has_tracer {
            self.contexts.with_current(|ctx| ctx.exit_target(target));
        }
        result
    }

    /// Exit half of the interception algorithm: tracer callback, phase
    /// observers, then guaranteed close. Runs on every exit path.
    fn finish(
        &self,
        target: &CallableIdentity,
        hooks: &HookSet<'_>,
        opened: Option<SpanId>,
        args: &[Value],
        retval: Option<&Value>,
        error: Option<&str>,
    ) {
        // Tracer callback enriches the span strictly before close. The span
        // is lifted off the stack while the callback runs so third-party
        // code never executes inside the context borrow; callbacks must not
        // open or close spans on this context.
        if let (Some(id), Some(tracer)) = (opened, hooks.tracer) {
            let lifted = self.contexts.with_current(|ctx| ctx.stack_mut().lift(id));
            if let Some((index, mut span)) = lifted {
                let outcome = CallOutcome {
                    args,
                    retval,
                    error,
                };
                let callback = Arc::clone(&tracer.callback);
                self.dispatcher.invoke(&target.to_string(), "tracer", || {
                    callback(&mut span, &outcome)
                });
                if error.is_some() {
                    span.set_error(true);
                }
                self.contexts
                    .with_current(|ctx| ctx.stack_mut().reinsert(index, span));
            } else {
                warn!(target = %target, span = %id, "opened span vanished before enrichment");
            }
        }

        let phase = if error.is_some() {
            HookPhase::Error
        } else {
            HookPhase::Post
        };
        self.run_observers(hooks, phase, target, args, retval, error);

        if let Some(id) = opened {
            self.close_frame(id, false);
        }
    }

    fn run_observers(
        &self,
        hooks: &HookSet<'_>,
        phase: HookPhase,
        target: &CallableIdentity,
        args: &[Value],
        retval: Option<&Value>,
        error: Option<&str>,
    ) {
        for observer in hooks.observers.iter().filter(|o| o.phase == phase) {
            let observation = CallObservation {
                target,
                phase,
                args,
                retval,
                error,
            };
            let callback = Arc::clone(&observer.callback);
            self.dispatcher
                .invoke(&target.to_string(), phase.as_str(), || {
                    callback(&observation)
                });
        }
    }

    /// Pop the span with `id` from the current stack and emit it. Frames
    /// above it are force-popped, logged as a `ReentrancyViolation`, closed
    /// and emitted too, so no dangling top remains.
    fn close_frame(&self, id: SpanId, cancelled: bool) {
        let context = self.contexts.current_id();
        let popped = self
            .contexts
            .with_current(|ctx| ctx.stack_mut().remove(id));
        let Some(popped) = popped else {
            warn!(span = %id, context = %context, "close for a span not on the stack, ignoring");
            return;
        };

        if !popped.discarded.is_empty() {
            let fault = EngineFault::ReentrancyViolation {
                context,
                discarded: popped.discarded.len(),
            };
            warn!(fault = %fault, span = %id, "recovered span stack");
            for mut stray in popped.discarded {
                stray.close();
                self.sink.on_close(stray);
            }
        }

        let mut span = popped.span;
        if cancelled {
            span.set_error(true);
        }
        span.close();
        debug!(span = %id, name = %span.name, "closed span");
        self.sink.on_close(span);
    }

    // ========================================================================
    // Manual span API
    // ========================================================================

    /// Open a span outside any interception point. The span becomes the
    /// active span of the current context until closed.
    pub fn start_span(&self, name: impl Into<String>) -> SpanHandle {
        let name = name.into();
        self.contexts.with_current(|ctx| {
            let parent = ctx.active_parent();
            let mut span = Span::new(name, parent);
            span.service = self.service.clone();
            let handle = SpanHandle {
                span_id: span.id,
                context_id: ctx.id(),
            };
            trace!(span = %span.id, "opened manual span");
            ctx.stack_mut().push(span);
            handle
        })
    }

    /// Close a manually started span. Out-of-order closes force-pop the
    /// frames above it; closes from a context other than the owner are
    /// ignored with a warning, never crossing stacks.
    pub fn close_span(&self, handle: SpanHandle) {
        self.end_manual(handle, false);
    }

    /// Forced close marking an error - the cancellation/timeout model.
    pub fn cancel_span(&self, handle: SpanHandle) {
        self.end_manual(handle, true);
    }

    fn end_manual(&self, handle: SpanHandle, cancelled: bool) {
        if handle.context_id != self.contexts.current_id() {
            warn!(
                span = %handle.span_id,
                owner = %handle.context_id,
                current = %self.contexts.current_id(),
                "span closed from a foreign context, ignoring"
            );
            return;
        }
        self.close_frame(handle.span_id, cancelled);
    }

    /// Handle to the span currently active in this context, if any.
    pub fn active_span(&self) -> Option<SpanHandle> {
        self.contexts.with_current(|ctx| {
            ctx.stack().top_id().map(|span_id| SpanHandle {
                span_id,
                context_id: ctx.id(),
            })
        })
    }

    /// Run an enrichment closure against the active span. The closure must
    /// not open or close spans on this context. Returns `None` when no span
    /// is active, or when the closure panicked: like every other enrichment
    /// callback the panic is contained and logged, and the span stays on the
    /// stack.
    pub fn with_active_span<R>(&self, f: impl FnOnce(&mut Span) -> R) -> Option<R> {
        let handle = self.active_span()?;
        let lifted = self
            .contexts
            .with_current(|ctx| ctx.stack_mut().lift(handle.span_id))?;
        let (index, mut span) = lifted;
        let mut result = None;
        let name = span.name.clone();
        self.dispatcher.invoke(&name, "enrichment", || {
            result = Some(f(&mut span));
        });
        self.contexts
            .with_current(|ctx| ctx.stack_mut().reinsert(index, span));
        result
    }

    // ========================================================================
    // Deferred completion
    // ========================================================================

    /// Build a deferred-completion record for a span whose outcome arrives
    /// asynchronously (a promise callback, a completion notification). The
    /// record captures the arguments and enrichment callback explicitly.
    pub fn defer_close(
        &self,
        handle: SpanHandle,
        captured_args: Vec<Value>,
        callback: Option<TracerCallback>,
    ) -> DeferredClose {
        DeferredClose {
            handle,
            captured_args,
            callback,
        }
    }

    /// Complete a deferred record: run its enrichment callback with the
    /// late outcome, then close the span. Must be invoked on the context
    /// that owns the span.
    pub fn complete_deferred(
        &self,
        record: DeferredClose,
        retval: Option<Value>,
        error: Option<String>,
    ) {
        let DeferredClose {
            handle,
            captured_args,
            callback,
        } = record;

        if handle.context_id != self.contexts.current_id() {
            warn!(
                span = %handle.span_id,
                owner = %handle.context_id,
                "deferred completion from a foreign context, ignoring"
            );
            return;
        }

        let lifted = self
            .contexts
            .with_current(|ctx| ctx.stack_mut().lift(handle.span_id));
        let Some((index, mut span)) = lifted else {
            warn!(span = %handle.span_id, "deferred completion for a closed span, ignoring");
            return;
        };

        if let Some(callback) = callback {
            let outcome = CallOutcome {
                args: &captured_args,
                retval: retval.as_ref(),
                error: error.as_deref(),
            };
            self.dispatcher.invoke(&span.name.clone(), "deferred", || {
                callback(&mut span, &outcome)
            });
        }
        if error.is_some() {
            span.set_error(true);
        }
        self.contexts
            .with_current(|ctx| ctx.stack_mut().reinsert(index, span));

        self.close_frame(handle.span_id, false);
    }
}
