//! Execution contexts and the span-activation state machine.
//!
//! Every OS thread gets a root context; cooperative coroutines multiplexed
//! onto that thread get their own nested contexts, each with its own
//! [`SpanStack`]. A context moves between `Running` and
//! `Suspended(saved_top)`: suspending records the active span, resuming
//! restores it, and whatever the resumer opened or closed in between never
//! leaks into the coroutine's stack.
//!
//! Context state lives in thread-local storage keyed by manager instance,
//! so a stack is never reachable from another thread and two engines on the
//! same thread stay independent.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::engine::registry::CallableIdentity;
use crate::error::{ContextError, EngineFault};
use crate::span::{SpanId, SpanStack};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique execution-context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Thread,
    Coroutine,
}

/// `Running ⇄ Suspended(saved_top)`. A freshly spawned coroutine starts
/// `Suspended(None)`; its first resume starts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Running,
    Suspended { saved_top: Option<SpanId> },
}

// ============================================================================
// ExecutionContext
// ============================================================================

/// One span-stack owner: a thread or a coroutine.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    kind: ContextKind,
    creator: Option<ContextId>,
    /// Parent for the first span opened in this context, captured from the
    /// creator's stack top at spawn time. Lexical inheritance: resume-time
    /// state of the creator is irrelevant.
    inherited_parent: Option<SpanId>,
    stack: SpanStack,
    state: ContextState,
    /// Per-target reentrancy counters; see `Tracer::intercept`.
    reentrancy: HashMap<CallableIdentity, u32>,
}

impl ExecutionContext {
    fn new(kind: ContextKind, creator: Option<ContextId>, inherited_parent: Option<SpanId>) -> Self {
        let state = match kind {
            ContextKind::Thread => ContextState::Running,
            ContextKind::Coroutine => ContextState::Suspended { saved_top: None },
        };
        Self {
            id: ContextId::next(),
            kind,
            creator,
            inherited_parent,
            stack: SpanStack::new(),
            state,
            reentrancy: HashMap::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn creator(&self) -> Option<ContextId> {
        self.creator
    }

    pub fn stack(&self) -> &SpanStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut SpanStack {
        &mut self.stack
    }

    /// Parent for a span opened right now: the stack top, or for an
    /// still-empty coroutine stack, the parent inherited at spawn.
    pub fn active_parent(&self) -> Option<SpanId> {
        self.stack.top_id().or(self.inherited_parent)
    }

    /// Bump the reentrancy counter for `target`; returns the previous value.
    pub(crate) fn enter_target(&mut self, target: &CallableIdentity) -> u32 {
        let counter = self.reentrancy.entry(target.clone()).or_insert(0);
        let previous = *counter;
        *counter += 1;
        previous
    }

    pub(crate) fn exit_target(&mut self, target: &CallableIdentity) {
        if let Some(counter) = self.reentrancy.get_mut(target) {
            *counter = counter.saturating_sub(1);
            if *counter == 0 {
                self.reentrancy.remove(target);
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Teardown with open spans loses those spans, nothing else.
        if !self.stack.is_empty() {
            let fault = EngineFault::ReentrancyViolation {
                context: self.id,
                discarded: self.stack.depth(),
            };
            warn!(fault = %fault, "context torn down with open spans");
        }
    }
}

// ============================================================================
// Per-thread storage
// ============================================================================

struct ThreadContexts {
    contexts: HashMap<ContextId, ExecutionContext>,
    /// Entered contexts, root first; the last entry is current.
    active: Vec<ContextId>,
}

impl Default for ThreadContexts {
    fn default() -> Self {
        let root = ExecutionContext::new(ContextKind::Thread, None, None);
        let id = root.id;
        debug!(context = %id, "created thread root context");
        Self {
            contexts: HashMap::from([(id, root)]),
            active: vec![id],
        }
    }
}

impl ThreadContexts {
    fn current_id(&self) -> ContextId {
        *self
            .active
            .last()
            .expect("the thread root context is always active")
    }
}

thread_local! {
    static STORE: RefCell<HashMap<u64, ThreadContexts>> = RefCell::new(HashMap::new());
}

// ============================================================================
// ContextManager
// ============================================================================

/// Owns the execution contexts of one engine instance.
///
/// All operations act on the calling thread's contexts; handles from other
/// threads resolve to nothing here, which is what keeps every stack
/// single-threaded by construction.
pub struct ContextManager {
    id: u64,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut ThreadContexts) -> R) -> R {
        STORE.with(|cell| {
            let mut map = cell.borrow_mut();
            let contexts = map.entry(self.id).or_default();
            f(contexts)
        })
    }

    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        self.with_store(|tc| {
            let id = tc.current_id();
            let context = tc
                .contexts
                .get_mut(&id)
                .expect("current context is registered");
            f(context)
        })
    }

    /// Context for the calling thread/coroutine.
    pub fn current_id(&self) -> ContextId {
        self.with_store(|tc| tc.current_id())
    }

    pub fn current_kind(&self) -> ContextKind {
        self.with_current(|ctx| ctx.kind())
    }

    /// Open-span depth of the current context.
    pub fn depth(&self) -> usize {
        self.with_current(|ctx| ctx.stack().depth())
    }

    /// Parent a span opened right now would get.
    pub fn active_parent(&self) -> Option<SpanId> {
        self.with_current(|ctx| ctx.active_parent())
    }

    /// Create a coroutine context. Its stack starts empty; the first span
    /// opened inside it will be parented to the current context's active
    /// span as of this call.
    pub fn spawn_coroutine(&self) -> ContextId {
        self.with_store(|tc| {
            let creator_id = tc.current_id();
            let inherited = tc
                .contexts
                .get(&creator_id)
                .and_then(|c| c.active_parent());
            let context =
                ExecutionContext::new(ContextKind::Coroutine, Some(creator_id), inherited);
            let id = context.id;
            debug!(context = %id, creator = %creator_id, "spawned coroutine context");
            tc.contexts.insert(id, context);
            id
        })
    }

    /// Make `ctx` current. The span active inside it is whatever was
    /// recorded at suspend time, independent of anything the resumer did in
    /// between; a snapshot mismatch is repaired by force-popping.
    pub fn resume(&self, ctx: ContextId) -> Result<(), ContextError> {
        self.with_store(|tc| {
            if tc.active.contains(&ctx) {
                return Err(ContextError::AlreadyRunning(ctx));
            }
            let context = tc
                .contexts
                .get_mut(&ctx)
                .ok_or(ContextError::UnknownContext(ctx))?;
            let saved_top = match context.state {
                ContextState::Suspended { saved_top } => saved_top,
                ContextState::Running => return Err(ContextError::NotSuspended(ctx)),
            };

            if context.stack.top_id() != saved_top {
                let fault = EngineFault::FiberContextCorruption {
                    context: ctx,
                    remaining: context.stack.depth(),
                };
                warn!(fault = %fault, "resume snapshot mismatch, repairing stack");
                while context.stack.top_id() != saved_top {
                    let Some(mut orphan) = context.stack.take_top() else {
                        break;
                    };
                    orphan.close();
                }
            }

            context.state = ContextState::Running;
            tc.active.push(ctx);
            debug!(context = %ctx, "resumed coroutine context");
            Ok(())
        })
    }

    /// Park the current coroutine. Records its stack top as the snapshot to
    /// restore; control returns to the previous context, which immediately
    /// becomes current again with its own stack untouched.
    pub fn suspend(&self, ctx: ContextId) -> Result<(), ContextError> {
        self.with_store(|tc| {
            if tc.current_id() != ctx {
                return Err(ContextError::NotCurrent(ctx));
            }
            let context = tc
                .contexts
                .get_mut(&ctx)
                .ok_or(ContextError::UnknownContext(ctx))?;
            if context.kind == ContextKind::Thread {
                return Err(ContextError::SuspendRootContext);
            }
            context.state = ContextState::Suspended {
                saved_top: context.stack.top_id(),
            };
            tc.active.pop();
            debug!(context = %ctx, "suspended coroutine context");
            Ok(())
        })
    }

    /// Tear down a coroutine context. The stack must be empty; leftover
    /// frames are a `FiberContextCorruption` — logged, discarded, and fatal
    /// only to that context's tracing.
    pub fn destroy(&self, ctx: ContextId) -> Result<(), ContextError> {
        self.with_store(|tc| {
            if tc.active.contains(&ctx) {
                return Err(ContextError::DestroyActive(ctx));
            }
            let mut context = tc
                .contexts
                .remove(&ctx)
                .ok_or(ContextError::UnknownContext(ctx))?;
            if !context.stack.is_empty() {
                let fault = EngineFault::FiberContextCorruption {
                    context: ctx,
                    remaining: context.stack.depth(),
                };
                warn!(fault = %fault, "destroying context with open spans");
                for mut frame in context.stack_mut().drain_all() {
                    frame.close();
                }
            }
            debug!(context = %ctx, "destroyed coroutine context");
            Ok(())
        })
    }

    pub fn context_exists(&self, ctx: ContextId) -> bool {
        self.with_store(|tc| tc.contexts.contains_key(&ctx))
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContextManager {
    fn drop(&mut self) {
        // Best-effort cleanup of this thread's state; other threads' entries
        // go away when their thread-local storage is destroyed.
        let _ = STORE.try_with(|cell| {
            if let Ok(mut map) = cell.try_borrow_mut() {
                map.remove(&self.id);
            }
        });
    }
}
