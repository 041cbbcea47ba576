//! Message bus backend.
//!
//! Registers every component with the bus, then pulls inputs on a blocking
//! worker and publishes each one as an `input_received` event. On interrupt
//! a pull in progress gets the shutdown grace period to return before the
//! bus stops and components close.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use woodwork_common::config::BusConfig;
use woodwork_common::constants::{
    SUBSCRIBE_KEY, TOPIC_AGENT_RESPONSE, TOPIC_INPUT_RECEIVED, TOPIC_STREAM_STARTED,
};
use woodwork_common::error::{Result, WoodworkError};

use super::{ExitReason, OrchestrationBackend, RunSummary, contained, exit_requested, settle};
use crate::bus::MessageBus;
use crate::bus::adapters::{HandlerSubscriber, OutputAdapter, ProcessorAdapter};
use crate::bus::event::Event;
use crate::component::{Capability, Component, Pulled};
use crate::context::RunContext;

/// Runs the pipeline over the asynchronous message bus.
#[derive(Debug, Clone)]
pub struct BusBackend {
    config: BusConfig,
    exit_token: String,
}

impl BusBackend {
    /// Creates the backend with the given bus policy.
    #[must_use]
    pub fn new(config: BusConfig, exit_token: impl Into<String>) -> Self {
        Self {
            config,
            exit_token: exit_token.into(),
        }
    }
}

/// Subscribes every component of `ctx` to `bus`.
///
/// Event handlers subscribe to their own topics plus their `subscribe`
/// list; other processors and outputs are wrapped in adapters.
///
/// # Errors
///
/// Returns an error if a `subscribe` list is malformed.
pub async fn register(bus: &mut MessageBus, ctx: &RunContext) -> Result<()> {
    let outputs: Vec<String> = ctx
        .outputs()
        .filter(|e| !e.has(Capability::EventHandler))
        .map(|e| e.name().to_string())
        .collect();

    for entry in ctx.entries() {
        let name = entry.name();
        let component = Arc::clone(entry.component());
        if entry.has(Capability::EventHandler) {
            let mut topics = match component.as_event_handler() {
                Some(handler) => handler.topics().await,
                None => Vec::new(),
            };
            for topic in entry.config().string_list(SUBSCRIBE_KEY)? {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
            bus.subscribe(name, &topics, Arc::new(HandlerSubscriber::new(name, component)))?;
        } else if entry.has(Capability::Processor) {
            bus.subscribe(
                name,
                &[TOPIC_INPUT_RECEIVED.to_string()],
                Arc::new(ProcessorAdapter::new(name, component, outputs.clone())),
            )?;
        } else if entry.has(Capability::Output) {
            bus.subscribe(
                name,
                &[TOPIC_STREAM_STARTED.to_string(), TOPIC_AGENT_RESPONSE.to_string()],
                Arc::new(OutputAdapter::new(name, component)),
            )?;
        }
    }
    Ok(())
}

fn spawn_pull(input: Arc<dyn Component>, name: String) -> JoinHandle<Result<Pulled>> {
    tokio::task::spawn_blocking(move || {
        contained(&name, || {
            input
                .as_input()
                .ok_or_else(|| WoodworkError::component(&name, "is not an input"))?
                .pull_input()
        })
    })
}

#[async_trait]
impl OrchestrationBackend for BusBackend {
    fn name(&self) -> &'static str {
        "message-bus"
    }

    async fn run(&self, ctx: Arc<RunContext>, shutdown: CancellationToken) -> Result<RunSummary> {
        let guard = ctx.close_guard();
        let (input_name, input) = ctx
            .input()
            .map(|e| (e.name().to_string(), Arc::clone(e.component())))
            .ok_or_else(|| WoodworkError::NotFound {
                kind: "input component",
                id: "any".into(),
            })?;

        let mut bus = MessageBus::new(self.config.clone());
        register(&mut bus, &ctx).await?;
        bus.start();
        let handle = bus.handle();
        tracing::info!(input = %input_name, session = %ctx.session_id(), "message bus main loop running");

        let mut iterations = 0_u64;
        let mut pulling: Option<JoinHandle<Result<Pulled>>> = None;
        let exit = loop {
            let worker = pulling.get_or_insert_with(|| spawn_pull(Arc::clone(&input), input_name.clone()));
            let joined = tokio::select! {
                () = shutdown.cancelled() => break ExitReason::Interrupted,
                joined = worker => joined,
            };
            pulling = None;
            let pulled = joined
                .map_err(|e| WoodworkError::runtime(format!("input worker failed: {e}")))
                .and_then(|pulled| pulled);
            let pulled = match pulled {
                Ok(pulled) => pulled,
                Err(e) => {
                    tracing::error!(input = %input_name, error = %e, "input failed");
                    break ExitReason::InputError(e.to_string());
                }
            };
            if let Some(reason) = exit_requested(&pulled, &self.exit_token) {
                break reason;
            }
            let Pulled::Value(value) = pulled else {
                break ExitReason::InputExhausted;
            };
            iterations += 1;
            let event = Event::new(
                TOPIC_INPUT_RECEIVED,
                json!({
                    "input": value,
                    "session_id": ctx.session_id(),
                    "iteration": iterations,
                }),
            )
            .with_session(ctx.session_id().clone())
            .with_source(&input_name);
            if let Err(e) = handle.emit(event).await {
                tracing::warn!(iteration = iterations, error = %e, "could not publish input");
            }
        };
        tracing::info!(exit = %exit, iterations, "main loop stopped");

        if let Some(worker) = pulling.take() {
            let late = settle(worker, self.config.shutdown_grace(), "input").await;
            if matches!(late, Some(Ok(Pulled::Value(_)))) {
                tracing::debug!(input = %input_name, "input read during shutdown discarded");
            }
        }
        let report = bus.shutdown().await;
        let close_failures = ctx.close_all().len();
        drop(guard);
        Ok(RunSummary {
            backend: self.name(),
            iterations,
            exit,
            close_failures,
            bus: Some(report.stats),
        })
    }
}
