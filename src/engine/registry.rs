//! Hook registry - maps callable identities to their registered
//! interceptions.
//!
//! The registry is write-mostly-at-init: integrations register hooks during
//! the load phase through `&mut` access, after which the registry moves
//! behind an `Arc` and every intercepted call reads it lock-free. A target
//! carries at most one tracer hook (last registration wins, with a warning)
//! and any number of observer hooks, run in registration order.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::EngineFault;
use crate::span::Span;

// ============================================================================
// Callable identity
// ============================================================================

/// Stable key identifying a function or method: an optional scope (type or
/// module) plus a name. Displays as `Scope.name` or the bare name, which is
/// also the default span name for hook-opened spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallableIdentity {
    scope: Option<String>,
    name: String,
}

impl CallableIdentity {
    /// Identity of a free function.
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
        }
    }

    /// Identity of a method on a type (or a function in a module).
    pub fn method(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            name: name.into(),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CallableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{scope}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ============================================================================
// Hook specs
// ============================================================================

/// Observer hook phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Before the original callable runs.
    Pre,
    /// After a normal return.
    Post,
    /// After an error or panic.
    Error,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
            HookPhase::Error => "error",
        }
    }
}

/// What a tracer callback sees when its span is about to close.
#[derive(Debug)]
pub struct CallOutcome<'a> {
    /// Arguments the callable was invoked with.
    pub args: &'a [Value],
    /// Return value on the normal path; `None` on error.
    pub retval: Option<&'a Value>,
    /// Error message when the callable failed or panicked.
    pub error: Option<&'a str>,
}

impl CallOutcome<'_> {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// What an observer callback sees.
#[derive(Debug)]
pub struct CallObservation<'a> {
    pub target: &'a CallableIdentity,
    pub phase: HookPhase,
    pub args: &'a [Value],
    pub retval: Option<&'a Value>,
    pub error: Option<&'a str>,
}

/// Enrichment callback owning the span lifecycle at a target. Runs once per
/// opened span, just before the span closes.
pub type TracerCallback = Arc<dyn Fn(&mut Span, &CallOutcome<'_>) + Send + Sync>;

/// Side-effect callback with no span ownership.
pub type ObserverCallback = Arc<dyn Fn(&CallObservation<'_>) + Send + Sync>;

/// Options for tracer-hook registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracerOptions {
    /// Open a span on every recursive invocation instead of only the
    /// outermost one.
    pub recurse: bool,
}

pub struct TracerHook {
    pub(crate) callback: TracerCallback,
    pub recurse: bool,
}

pub struct ObserverHook {
    pub phase: HookPhase,
    pub(crate) callback: ObserverCallback,
}

/// Hooks registered for one target.
pub struct HookSet<'a> {
    pub tracer: Option<&'a TracerHook>,
    pub observers: &'a [ObserverHook],
}

impl HookSet<'_> {
    pub fn is_empty(&self) -> bool {
        self.tracer.is_none() && self.observers.is_empty()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Table of interception points. Mutated only during the load phase; shared
/// immutably afterwards.
#[derive(Default)]
pub struct HookRegistry {
    tracers: HashMap<CallableIdentity, TracerHook>,
    observers: HashMap<CallableIdentity, Vec<ObserverHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the tracer hook for `target`. A duplicate registration
    /// replaces the previous one and logs a `RegistrationConflict` warning;
    /// it never fails the caller.
    pub fn register_tracer(
        &mut self,
        target: CallableIdentity,
        callback: TracerCallback,
        options: TracerOptions,
    ) {
        let hook = TracerHook {
            callback,
            recurse: options.recurse,
        };
        if self.tracers.insert(target.clone(), hook).is_some() {
            let fault = EngineFault::RegistrationConflict {
                target: target.to_string(),
            };
            warn!(fault = %fault, "tracer hook replaced");
        } else {
            debug!(target = %target, "registered tracer hook");
        }
    }

    /// Append an observer hook for `target`. Multiple observers per target
    /// and phase are allowed and run in registration order.
    pub fn register_observer(
        &mut self,
        target: CallableIdentity,
        phase: HookPhase,
        callback: ObserverCallback,
    ) {
        debug!(target = %target, phase = phase.as_str(), "registered observer hook");
        self.observers
            .entry(target)
            .or_default()
            .push(ObserverHook { phase, callback });
    }

    /// Hooks for `target`. Read-only; safe for concurrent use once the
    /// registry is shared.
    pub fn lookup(&self, target: &CallableIdentity) -> HookSet<'_> {
        HookSet {
            tracer: self.tracers.get(target),
            observers: self
                .observers
                .get(target)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }

    pub fn is_instrumented(&self, target: &CallableIdentity) -> bool {
        self.tracers.contains_key(target) || self.observers.contains_key(target)
    }

    /// Number of targets with a tracer hook.
    pub fn tracer_count(&self) -> usize {
        self.tracers.len()
    }

    /// Total number of observer hooks across all targets.
    pub fn observer_count(&self) -> usize {
        self.observers.values().map(Vec::len).sum()
    }
}
