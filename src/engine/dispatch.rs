//! Isolated execution of user-supplied enrichment callbacks.
//!
//! Enrichment callbacks are third-party integration code. A panicking
//! callback must not corrupt tracing state or crash the host program, so
//! every callback runs under `catch_unwind`: a panic becomes a logged
//! `ClosureFailure` and the interceptor's lifecycle continues unaffected.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

use crate::error::EngineFault;

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Runs enrichment callbacks with panic containment.
#[derive(Debug, Default)]
pub struct ClosureDispatcher;

impl ClosureDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback`. Returns `false` when it panicked; the panic is
    /// logged and swallowed.
    pub fn invoke(&self, target: &str, phase: &str, callback: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => true,
            Err(payload) => {
                let fault = EngineFault::ClosureFailure {
                    target: target.to_string(),
                    phase: phase.to_string(),
                    message: panic_message(payload.as_ref()),
                };
                warn!(fault = %fault, "enrichment callback failed");
                false
            }
        }
    }
}
