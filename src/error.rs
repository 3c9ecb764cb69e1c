//! Error taxonomy for the interception engine.
//!
//! Two families, with different propagation rules:
//!
//! - [`EngineFault`] — recoverable internal faults. These are logged and the
//!   engine degrades to losing a span or a tag; they never escape into the
//!   instrumented program's control flow.
//! - [`ContextError`] — typed misuse of the execution-context state machine
//!   (resuming a running context, suspending a non-current one, and so on).
//!   Returned to the caller of the context API.

use thiserror::Error;

use crate::context::ContextId;

/// Recoverable internal faults. Logged via `tracing`, never propagated.
#[derive(Debug, Error)]
pub enum EngineFault {
    /// A second tracer hook was registered for a target that already had one.
    /// The previous registration is replaced.
    #[error("duplicate tracer hook for `{target}`; previous registration replaced")]
    RegistrationConflict { target: String },

    /// A span was closed while it was not the top of its stack. The engine
    /// force-pops the stray frames above it rather than leaving a dangling
    /// top.
    #[error("out-of-order span close on context {context}; force-popped {discarded} stray frame(s)")]
    ReentrancyViolation { context: ContextId, discarded: usize },

    /// A user-supplied enrichment callback panicked. The panic is contained
    /// and the span lifecycle continues unaffected.
    #[error("enrichment callback for `{target}` panicked during {phase}: {message}")]
    ClosureFailure {
        target: String,
        phase: String,
        message: String,
    },

    /// An integration failed to initialize. Other integrations still load.
    #[error("integration `{name}` unavailable: {reason}")]
    IntegrationUnavailable { name: String, reason: String },

    /// A coroutine context's span stack no longer matches what the state
    /// machine expects (stray frames at resume or teardown). Confined to
    /// that context's tracing.
    #[error("span stack for context {context} corrupted: {remaining} stray frame(s)")]
    FiberContextCorruption {
        context: ContextId,
        remaining: usize,
    },
}

/// Misuse of the execution-context state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("unknown execution context {0}")]
    UnknownContext(ContextId),

    #[error("context {0} is not suspended")]
    NotSuspended(ContextId),

    #[error("context {0} is already running")]
    AlreadyRunning(ContextId),

    #[error("context {0} is not the current context")]
    NotCurrent(ContextId),

    #[error("the thread root context cannot be suspended")]
    SuspendRootContext,

    #[error("context {0} is still active and cannot be destroyed")]
    DestroyActive(ContextId),
}
