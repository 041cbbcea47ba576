//! Orchestration backends.
//!
//! A backend drives a started [`RunContext`] until the input is exhausted,
//! the exit token arrives or the run is interrupted. Whatever the exit path,
//! every component is closed before `run` returns.

pub mod message_bus;
pub mod sequential;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use woodwork_common::config::OrchestrationMode;
use woodwork_common::error::{Result, WoodworkError};

use crate::bus::event::BusStats;
use crate::component::{Payload, Pulled};
use crate::context::{RunContext, panic_message};
use crate::settings::RuntimeSettings;

pub use self::message_bus::BusBackend;
pub use self::sequential::SequentialBackend;

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    /// The input produced the exit token.
    ExitToken,
    /// The input reported it has nothing more.
    InputExhausted,
    /// The input failed.
    InputError(String),
    /// The run was cancelled from outside.
    Interrupted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitToken => write!(f, "exit token received"),
            Self::InputExhausted => write!(f, "input exhausted"),
            Self::InputError(e) => write!(f, "input failed: {e}"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of a backend run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Backend that ran.
    pub backend: &'static str,
    /// Inputs taken from the input component.
    pub iterations: u64,
    /// Why the run ended.
    pub exit: ExitReason,
    /// Components whose close call failed.
    pub close_failures: usize,
    /// Bus counters, for the bus backend.
    pub bus: Option<BusStats>,
}

/// Drives a started context.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Short name for logs and plans.
    fn name(&self) -> &'static str;

    /// Runs until exit or `shutdown` is cancelled, then closes every
    /// component.
    ///
    /// # Errors
    ///
    /// Returns an error if the context has no input component.
    async fn run(&self, ctx: Arc<RunContext>, shutdown: CancellationToken) -> Result<RunSummary>;
}

/// Builds the backend `settings` select.
#[must_use]
pub fn select(settings: &RuntimeSettings) -> Box<dyn OrchestrationBackend> {
    match settings.mode {
        OrchestrationMode::Sequential => Box::new(
            SequentialBackend::new(settings.exit_token.clone()).with_grace(settings.bus.shutdown_grace()),
        ),
        OrchestrationMode::MessageBus => {
            Box::new(BusBackend::new(settings.bus.clone(), settings.exit_token.clone()))
        }
    }
}

/// The reason to stop, if `pulled` asks the loop to.
pub(crate) fn exit_requested(pulled: &Pulled, exit_token: &str) -> Option<ExitReason> {
    match pulled {
        Pulled::Exit => Some(ExitReason::InputExhausted),
        Pulled::Value(Payload::String(text)) if text.trim() == exit_token => Some(ExitReason::ExitToken),
        Pulled::Value(_) => None,
    }
}

/// Waits up to `grace` for a blocking worker that may still be inside a
/// component call. Returns its result if it finished in time.
pub(crate) async fn settle<T>(worker: JoinHandle<T>, grace: Duration, what: &str) -> Option<T> {
    match tokio::time::timeout(grace, worker).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(worker = what, error = %e, "worker failed while settling");
            None
        }
        Err(_) => {
            tracing::warn!(
                worker = what,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "worker still busy after the grace period, closing components anyway"
            );
            None
        }
    }
}

/// Runs one component call, turning a panic into a component error.
pub(crate) fn contained<T>(component: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|panic| {
        Err(WoodworkError::component(
            component,
            format!("panicked: {}", panic_message(panic.as_ref())),
        ))
    })
}
