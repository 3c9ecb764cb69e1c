//! Integration contract and loader.
//!
//! An integration is a collaborator module that registers hooks for one
//! third-party library. The loader initializes each integration exactly
//! once during startup, handing it the hook registry by `&mut` — no hidden
//! statics. A failure while one integration registers its hooks is caught,
//! logged, and never prevents other integrations from loading.

use anyhow::Result;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

use super::dispatch::panic_message;
use super::registry::HookRegistry;
use crate::error::EngineFault;

/// Outcome of an integration's `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Hooks registered; the integration is active.
    Loaded,
    /// The integration declined to load (disabled, nothing to do).
    NotLoaded,
    /// A prerequisite is missing (library absent, wrong version).
    NotAvailable,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LoadState::Loaded => "loaded",
            LoadState::NotLoaded => "not-loaded",
            LoadState::NotAvailable => "not-available",
        };
        write!(f, "{text}")
    }
}

/// Contract implemented by integration modules.
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    /// Register this integration's hooks. Called exactly once by the
    /// loader, before steady-state traffic.
    fn init(&self, registry: &mut HookRegistry) -> Result<LoadState>;
}

struct IntegrationEntry {
    integration: Box<dyn Integration>,
    /// `None` until `init` has run.
    state: Option<LoadState>,
}

/// Discovers and initializes integration modules.
#[derive(Default)]
pub struct IntegrationLoader {
    entries: Vec<IntegrationEntry>,
}

impl IntegrationLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, integration: Box<dyn Integration>) {
        self.entries.push(IntegrationEntry {
            integration,
            state: None,
        });
    }

    /// Initialize every integration that has not been initialized yet.
    /// Repeated calls are no-ops for already-initialized entries. Returns
    /// the number of integrations that reported `Loaded` during this call.
    pub fn load_all(&mut self, registry: &mut HookRegistry) -> usize {
        let mut loaded = 0;
        for entry in &mut self.entries {
            if entry.state.is_some() {
                debug!(
                    integration = entry.integration.name(),
                    "already initialized, skipping"
                );
                continue;
            }

            let name = entry.integration.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.integration.init(registry)));

            let state = match outcome {
                Ok(Ok(state)) => {
                    match state {
                        LoadState::Loaded => {
                            info!(integration = %name, "integration loaded");
                            loaded += 1;
                        }
                        LoadState::NotLoaded => {
                            debug!(integration = %name, "integration declined to load");
                        }
                        LoadState::NotAvailable => {
                            let fault = EngineFault::IntegrationUnavailable {
                                name: name.clone(),
                                reason: "missing prerequisite".to_string(),
                            };
                            warn!(fault = %fault, "integration skipped");
                        }
                    }
                    state
                }
                Ok(Err(error)) => {
                    let fault = EngineFault::IntegrationUnavailable {
                        name: name.clone(),
                        reason: format!("{error:#}"),
                    };
                    warn!(fault = %fault, "integration init failed");
                    LoadState::NotAvailable
                }
                Err(payload) => {
                    let fault = EngineFault::IntegrationUnavailable {
                        name: name.clone(),
                        reason: format!("init panicked: {}", panic_message(payload.as_ref())),
                    };
                    warn!(fault = %fault, "integration init panicked");
                    LoadState::NotAvailable
                }
            };
            entry.state = Some(state);
        }
        loaded
    }

    /// State of a named integration; `None` while uninitialized or unknown.
    pub fn state(&self, name: &str) -> Option<LoadState> {
        self.entries
            .iter()
            .find(|e| e.integration.name() == name)
            .and_then(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
