//! Sequential chain backend.
//!
//! One blocking worker loops: pull an input, pass it through every processor
//! in dependency order, deliver the result to every output. An interrupt is
//! seen between steps; components are closed once the worker has stopped or
//! the grace period is over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use woodwork_common::config::BusConfig;
use woodwork_common::error::{Result, WoodworkError};

use super::{ExitReason, OrchestrationBackend, RunSummary, contained, exit_requested, settle};
use crate::component::{OutputSink, Payload, Processor, Pulled};
use crate::context::RunContext;

/// Runs the pipeline as a synchronous chain.
#[derive(Debug, Clone)]
pub struct SequentialBackend {
    exit_token: String,
    grace: Duration,
}

impl SequentialBackend {
    /// Creates the backend, stopping on `exit_token`.
    #[must_use]
    pub fn new(exit_token: impl Into<String>) -> Self {
        Self {
            exit_token: exit_token.into(),
            grace: BusConfig::default().shutdown_grace(),
        }
    }

    /// Sets how long an interrupted run waits for the current step before
    /// closing components.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl OrchestrationBackend for SequentialBackend {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn run(&self, ctx: Arc<RunContext>, shutdown: CancellationToken) -> Result<RunSummary> {
        let guard = ctx.close_guard();
        let input = ctx
            .input()
            .map(|e| e.name().to_string())
            .ok_or_else(|| WoodworkError::NotFound {
                kind: "input component",
                id: "any".into(),
            })?;
        tracing::info!(input = %input, processors = ctx.processors().count(), outputs = ctx.outputs().count(), "sequential chain running");

        let iterations = Arc::new(AtomicU64::new(0));
        let mut worker = {
            let ctx = Arc::clone(&ctx);
            let exit_token = self.exit_token.clone();
            let stop = shutdown.clone();
            let iterations = Arc::clone(&iterations);
            tokio::task::spawn_blocking(move || run_chain(&ctx, &input, &exit_token, &stop, &iterations))
        };

        let finished = tokio::select! {
            joined = &mut worker => Some(joined.unwrap_or_else(|e| ExitReason::InputError(format!("chain worker failed: {e}")))),
            () = shutdown.cancelled() => None,
        };
        let exit = match finished {
            Some(exit) => exit,
            None => {
                tracing::info!("interrupted, waiting for the current step to finish");
                let _ = settle(worker, self.grace, "sequential chain").await;
                ExitReason::Interrupted
            }
        };
        tracing::info!(exit = %exit, "sequential chain stopped");

        let close_failures = ctx.close_all().len();
        drop(guard);
        Ok(RunSummary {
            backend: self.name(),
            iterations: iterations.load(Ordering::Acquire),
            exit,
            close_failures,
            bus: None,
        })
    }
}

fn run_chain(
    ctx: &RunContext,
    input_name: &str,
    exit_token: &str,
    stop: &CancellationToken,
    iterations: &AtomicU64,
) -> ExitReason {
    let Some(input) = ctx.get(input_name).and_then(|e| e.component().as_input()) else {
        return ExitReason::InputError(format!("\"{input_name}\" is not an input"));
    };
    let processors: Vec<(&str, &dyn Processor)> = ctx
        .processors()
        .filter_map(|e| e.component().as_processor().map(|p| (e.name(), p)))
        .collect();
    let outputs: Vec<(&str, &dyn OutputSink)> = ctx
        .outputs()
        .filter_map(|e| e.component().as_output().map(|o| (e.name(), o)))
        .collect();

    loop {
        if stop.is_cancelled() {
            return ExitReason::Interrupted;
        }
        let pulled = match contained(input_name, || input.pull_input()) {
            Ok(pulled) => pulled,
            Err(e) => {
                tracing::error!(input = %input_name, error = %e, "input failed");
                return ExitReason::InputError(e.to_string());
            }
        };
        if stop.is_cancelled() {
            return ExitReason::Interrupted;
        }
        if let Some(reason) = exit_requested(&pulled, exit_token) {
            return reason;
        }
        let Pulled::Value(value) = pulled else {
            return ExitReason::InputExhausted;
        };
        let iteration = iterations.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(iteration, "input received");

        let Some(result) = process(&processors, value) else {
            continue;
        };
        for (name, output) in &outputs {
            if let Err(e) = contained(name, || output.deliver(result.clone())) {
                tracing::warn!(output = %name, iteration, error = %e, "delivery failed");
            }
        }
    }
}

fn process(processors: &[(&str, &dyn Processor)], mut value: Payload) -> Option<Payload> {
    for (name, processor) in processors {
        match contained(name, || processor.process(value)) {
            Ok(next) => value = next,
            Err(e) => {
                tracing::warn!(processor = %name, error = %e, "processing failed, skipping input");
                return None;
            }
        }
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use serde_json::json;

    use super::*;
    use crate::component::{Component, InputSource};
    use crate::config::ComponentConfig;
    use crate::context::ComponentEntry;

    struct Script(Mutex<VecDeque<Result<Pulled>>>);

    impl Component for Script {
        fn as_input(&self) -> Option<&dyn InputSource> {
            Some(self)
        }
    }

    impl InputSource for Script {
        fn pull_input(&self) -> Result<Pulled> {
            self.0.lock().unwrap().pop_front().unwrap_or(Ok(Pulled::Exit))
        }
    }

    struct Suffix(&'static str);

    impl Component for Suffix {
        fn as_processor(&self) -> Option<&dyn Processor> {
            Some(self)
        }
    }

    impl Processor for Suffix {
        fn process(&self, input: Payload) -> Result<Payload> {
            let text = input
                .as_str()
                .ok_or_else(|| WoodworkError::component("suffix", "expected text"))?;
            Ok(json!(format!("{text}{}", self.0)))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Payload>>);

    impl Component for Collect {
        fn as_output(&self) -> Option<&dyn OutputSink> {
            Some(self)
        }
    }

    impl OutputSink for Collect {
        fn deliver(&self, payload: Payload) -> Result<()> {
            self.0.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn context(inputs: Vec<Result<Pulled>>, sink: &Arc<Collect>) -> Arc<RunContext> {
        let entry = |name: &str, c: Arc<dyn Component>| ComponentEntry::new(name, c, ComponentConfig::default());
        Arc::new(
            RunContext::builder()
                .entry(entry("in", Arc::new(Script(Mutex::new(inputs.into())))))
                .entry(entry("a", Arc::new(Suffix("-a"))))
                .entry(entry("b", Arc::new(Suffix("-b"))))
                .entry(entry("out", Arc::clone(sink) as Arc<dyn Component>))
                .build()
                .expect("build"),
        )
    }

    #[tokio::test]
    async fn chains_processors_in_order_until_exit_token() {
        let sink = Arc::new(Collect::default());
        let ctx = context(
            vec![
                Ok(Pulled::Value(json!("one"))),
                Ok(Pulled::Value(json!(42))),
                Ok(Pulled::Value(json!("two"))),
                Ok(Pulled::Value(json!("exit"))),
                Ok(Pulled::Value(json!("never"))),
            ],
            &sink,
        );
        let summary = SequentialBackend::new("exit")
            .run(Arc::clone(&ctx), CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(summary.exit, ExitReason::ExitToken);
        assert_eq!(summary.iterations, 3);
        assert_eq!(*sink.0.lock().unwrap(), vec![json!("one-a-b"), json!("two-a-b")]);
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn input_error_ends_the_run_and_closes() {
        let sink = Arc::new(Collect::default());
        let ctx = context(vec![Err(WoodworkError::runtime("stdin closed"))], &sink);
        let summary = SequentialBackend::new("exit")
            .run(Arc::clone(&ctx), CancellationToken::new())
            .await
            .expect("run");
        assert!(matches!(summary.exit, ExitReason::InputError(ref e) if e.contains("stdin closed")));
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn exhausted_input_ends_the_run() {
        let sink = Arc::new(Collect::default());
        let ctx = context(vec![Ok(Pulled::Value(json!("x")))], &sink);
        let summary = SequentialBackend::new("exit")
            .run(ctx, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(summary.exit, ExitReason::InputExhausted);
        assert_eq!(summary.iterations, 1);
    }

    /// Emits `"tick"` forever.
    struct Ticker;

    impl Component for Ticker {
        fn as_input(&self) -> Option<&dyn InputSource> {
            Some(self)
        }
    }

    impl InputSource for Ticker {
        fn pull_input(&self) -> Result<Pulled> {
            Ok(Pulled::Value(json!("tick")))
        }
    }

    /// Sleeps inside `process` and notes any `close` that lands meanwhile.
    #[derive(Default)]
    struct Slow {
        delay: Duration,
        busy: AtomicBool,
        closed_while_busy: AtomicBool,
        processed: AtomicU64,
    }

    impl Component for Slow {
        fn as_processor(&self) -> Option<&dyn Processor> {
            Some(self)
        }

        fn close(&self) -> Result<()> {
            if self.busy.load(Ordering::SeqCst) {
                self.closed_while_busy.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    impl Processor for Slow {
        fn process(&self, input: Payload) -> Result<Payload> {
            self.busy.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let _ = self.processed.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            Ok(input)
        }
    }

    fn slow_context(slow: &Arc<Slow>) -> Arc<RunContext> {
        let entry = |name: &str, c: Arc<dyn Component>| ComponentEntry::new(name, c, ComponentConfig::default());
        Arc::new(
            RunContext::builder()
                .entry(entry("in", Arc::new(Ticker)))
                .entry(entry("slow", Arc::clone(slow) as Arc<dyn Component>))
                .build()
                .expect("build"),
        )
    }

    fn cancel_after(millis: u64) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            trigger.cancel();
        });
        shutdown
    }

    #[tokio::test]
    async fn interrupt_waits_for_the_running_step_before_closing() {
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(400),
            ..Slow::default()
        });
        let ctx = slow_context(&slow);
        let summary = SequentialBackend::new("exit")
            .run(Arc::clone(&ctx), cancel_after(50))
            .await
            .expect("run");

        assert_eq!(summary.exit, ExitReason::Interrupted);
        assert!(ctx.is_closed());
        assert_eq!(slow.processed.load(Ordering::SeqCst), 1);
        assert!(!slow.closed_while_busy.load(Ordering::SeqCst), "closed during process()");
    }

    #[tokio::test]
    async fn grace_period_bounds_the_wait() {
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(1_000),
            ..Slow::default()
        });
        let ctx = slow_context(&slow);
        let started = std::time::Instant::now();
        let summary = SequentialBackend::new("exit")
            .with_grace(Duration::from_millis(50))
            .run(Arc::clone(&ctx), cancel_after(20))
            .await
            .expect("run");

        assert_eq!(summary.exit, ExitReason::Interrupted);
        assert!(ctx.is_closed());
        assert!(started.elapsed() < Duration::from_millis(800), "waited {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn missing_input_is_an_error_but_still_closes() {
        let ctx = Arc::new(
            RunContext::builder()
                .entry(ComponentEntry::new("a", Arc::new(Suffix("-a")), ComponentConfig::default()))
                .build()
                .expect("build"),
        );
        let result = SequentialBackend::new("exit")
            .run(Arc::clone(&ctx), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WoodworkError::NotFound { .. })));
        assert!(ctx.is_closed());
    }
}
