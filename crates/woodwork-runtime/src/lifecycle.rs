//! Concurrent init/start driver.
//!
//! Every component gets its own task. Within a phase the parallel variant
//! runs first on a blocking worker, bounded by a semaphore of `workers`
//! permits; the sequential variant then runs in the single orchestrating
//! lane. A component starts only once every component it references is
//! `Started`. Failures and panics are contained to the component they hit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use woodwork_common::error::Result;
use woodwork_common::types::{LifecycleState, Phase};

use crate::component::Capability;
use crate::context::{ComponentEntry, RunContext, panic_message};
use crate::progress::{ProgressReporter, ProgressSender};

/// Outcome of bringing a context up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    /// Final state of every component, in document order.
    pub states: Vec<(String, LifecycleState)>,
    /// Components that failed, with the reason.
    pub failures: Vec<(String, String)>,
    /// Number of phases dispatched to blocking workers.
    pub workers_dispatched: usize,
}

impl LifecycleReport {
    /// Returns `true` if every component reached `Started`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs init then start for every component of a context.
#[derive(Debug, Clone)]
pub struct LifecycleDriver {
    workers: usize,
    progress: Option<ProgressSender>,
}

struct Shared {
    ctx: Arc<RunContext>,
    permits: Arc<Semaphore>,
    lane: Mutex<()>,
    dispatched: AtomicUsize,
    progress: Option<ProgressSender>,
}

impl LifecycleDriver {
    /// Creates a driver allowing `workers` concurrent blocking phases.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            progress: None,
        }
    }

    /// Publishes progress updates on `sender`.
    #[must_use]
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Initializes and starts every component of `ctx`.
    ///
    /// Never fails as a whole; per-component failures land in the report.
    pub async fn bring_up(&self, ctx: &Arc<RunContext>) -> LifecycleReport {
        let shared = Arc::new(Shared {
            ctx: Arc::clone(ctx),
            permits: Arc::new(Semaphore::new(self.workers)),
            lane: Mutex::new(()),
            dispatched: AtomicUsize::new(0),
            progress: self.progress.clone(),
        });
        tracing::info!(components = ctx.len(), workers = self.workers, "bringing components up");

        let mut tasks = JoinSet::new();
        for index in 0..ctx.len() {
            let shared = Arc::clone(&shared);
            let _ = tasks.spawn(async move { drive(&shared, index).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "lifecycle task aborted");
            }
        }

        let mut report = LifecycleReport {
            workers_dispatched: shared.dispatched.load(Ordering::Acquire),
            ..LifecycleReport::default()
        };
        for entry in ctx.entries() {
            let state = entry.state();
            if let LifecycleState::Failed(reason) = &state {
                report.failures.push((entry.name().to_string(), reason.clone()));
            }
            report.states.push((entry.name().to_string(), state));
        }
        tracing::info!(
            failures = report.failures.len(),
            workers_dispatched = report.workers_dispatched,
            "lifecycle complete"
        );
        report
    }
}

async fn drive(shared: &Arc<Shared>, index: usize) {
    let entry = &shared.ctx.entries()[index];

    if let Err(reason) = run_phase(shared, entry, Phase::Init).await {
        fail(shared, entry, Phase::Init, reason);
        return;
    }

    for dep in entry.dependencies() {
        let Some(dep_entry) = shared.ctx.get(dep) else {
            continue;
        };
        let mut state = dep_entry.subscribe_state();
        let outcome = state.wait_for(LifecycleState::is_terminal).await.map(|s| (*s).clone());
        match outcome {
            Ok(LifecycleState::Started) => {}
            Ok(_) | Err(_) => {
                fail(shared, entry, Phase::Start, format!("dependency \"{dep}\" failed"));
                return;
            }
        }
    }

    if let Err(reason) = run_phase(shared, entry, Phase::Start).await {
        fail(shared, entry, Phase::Start, reason);
    }
}

async fn run_phase(shared: &Arc<Shared>, entry: &ComponentEntry, phase: Phase) -> std::result::Result<(), String> {
    let (parallel, sequential, running, done) = match phase {
        Phase::Init => (
            entry.has(Capability::ParallelInit),
            entry.has(Capability::Init),
            LifecycleState::Initializing,
            LifecycleState::Initialized,
        ),
        Phase::Start => (
            entry.has(Capability::ParallelStart),
            entry.has(Capability::Start),
            LifecycleState::Starting,
            LifecycleState::Started,
        ),
    };
    let reporter = ProgressReporter::new(
        shared.progress.clone(),
        entry.name(),
        phase,
        entry.subscribe_state(),
    );
    entry.transition(running).map_err(|e| e.to_string())?;

    if !parallel && !sequential {
        entry.transition(done.clone()).map_err(|e| e.to_string())?;
        reporter.report_state(100, done);
        return Ok(());
    }
    reporter.report(0);

    if parallel {
        let permit = Arc::clone(&shared.permits)
            .acquire_owned()
            .await
            .map_err(|e| e.to_string())?;
        let _ = shared.dispatched.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(component = %entry.name(), %phase, "dispatching parallel phase");

        let component = Arc::clone(entry.component());
        let config = Arc::clone(entry.config());
        let worker_reporter = reporter.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match phase {
                Phase::Init => component
                    .as_parallel_initializable()
                    .map_or(Ok(()), |c| c.parallel_init(&worker_reporter, &config)),
                Phase::Start => component
                    .as_parallel_startable()
                    .map_or(Ok(()), |c| c.parallel_start(&worker_reporter, &config)),
            }
        })
        .await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(e) if e.is_panic() => {
                return Err(format!("panicked: {}", panic_message(e.into_panic().as_ref())));
            }
            Err(e) => return Err(e.to_string()),
        }
        if sequential {
            reporter.report(50);
        }
    }

    if sequential {
        let _lane = shared.lane.lock().await;
        tracing::debug!(component = %entry.name(), %phase, "running sequential phase");
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let component = entry.component();
            let config = entry.config();
            match phase {
                Phase::Init => component
                    .as_initializable()
                    .map_or(Ok(()), |c| c.init(&reporter, config)),
                Phase::Start => component
                    .as_startable()
                    .map_or(Ok(()), |c| c.start(&reporter, config)),
            }
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(panic) => return Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    entry.transition(done.clone()).map_err(|e| e.to_string())?;
    reporter.report_state(100, done);
    Ok(())
}

fn fail(shared: &Shared, entry: &ComponentEntry, phase: Phase, reason: String) {
    tracing::error!(component = %entry.name(), %phase, reason = %reason, "component failed");
    let state = LifecycleState::Failed(reason);
    if let Err(e) = entry.transition(state.clone()) {
        tracing::warn!(component = %entry.name(), error = %e, "could not record failure");
    }
    let reporter = ProgressReporter::new(shared.progress.clone(), entry.name(), phase, entry.subscribe_state());
    reporter.report_state(100, state);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use woodwork_common::error::WoodworkError;
    use woodwork_common::types::ProgressUpdate;

    use super::*;
    use crate::component::{Component, Initializable, ParallelInitializable, Startable};
    use crate::config::ComponentConfig;
    use crate::progress;

    #[derive(Default)]
    struct Witness {
        log: Arc<StdMutex<Vec<String>>>,
        name: &'static str,
        parallel: bool,
        sequential: bool,
        fail_init: bool,
        panic_init: bool,
    }

    impl Component for Witness {
        fn as_parallel_initializable(&self) -> Option<&dyn ParallelInitializable> {
            self.parallel.then_some(self as &dyn ParallelInitializable)
        }

        fn as_initializable(&self) -> Option<&dyn Initializable> {
            self.sequential.then_some(self as &dyn Initializable)
        }

        fn as_startable(&self) -> Option<&dyn Startable> {
            Some(self)
        }
    }

    impl ParallelInitializable for Witness {
        fn parallel_init(&self, _: &ProgressReporter, _: &ComponentConfig) -> Result<()> {
            assert!(!self.panic_init, "init exploded");
            if self.fail_init {
                return Err(WoodworkError::component(self.name, "no credentials"));
            }
            self.log.lock().unwrap().push(format!("pinit:{}", self.name));
            Ok(())
        }
    }

    impl Initializable for Witness {
        fn init(&self, _: &ProgressReporter, _: &ComponentConfig) -> Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }
    }

    impl Startable for Witness {
        fn start(&self, _: &ProgressReporter, _: &ComponentConfig) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }
    }

    struct Nothing;

    impl Component for Nothing {}

    fn entry(witness: Witness, deps: &[&str]) -> ComponentEntry {
        let name = witness.name;
        ComponentEntry::new(name, Arc::new(witness), ComponentConfig::default())
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn component_without_work_completes_without_workers() {
        let ctx = Arc::new(
            RunContext::builder()
                .entry(ComponentEntry::new("idle", Arc::new(Nothing), ComponentConfig::default()))
                .build()
                .expect("build"),
        );
        let (tx, mut rx) = progress::channel();
        let report = LifecycleDriver::new(2).with_progress(tx).bring_up(&ctx).await;

        assert!(report.is_success());
        assert_eq!(report.workers_dispatched, 0);
        assert_eq!(ctx.get("idle").expect("idle").state(), LifecycleState::Started);

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 2, "{updates:?}");
        assert!(updates.iter().all(|u| u.percent == 100));
        assert_eq!(updates[0].phase, Phase::Init);
        assert_eq!(updates[1].phase, Phase::Start);
    }

    #[tokio::test]
    async fn both_halves_report_zero_fifty_hundred() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let witness = Witness {
            log: Arc::clone(&log),
            name: "llm",
            parallel: true,
            sequential: true,
            ..Witness::default()
        };
        let ctx = Arc::new(RunContext::builder().entry(entry(witness, &[])).build().expect("build"));
        let (tx, mut rx) = progress::channel();
        let report = LifecycleDriver::new(1).with_progress(tx).bring_up(&ctx).await;

        assert!(report.is_success());
        assert_eq!(report.workers_dispatched, 1);
        let init: Vec<u8> = drain(&mut rx)
            .into_iter()
            .filter(|u| u.phase == Phase::Init)
            .map(|u| u.percent)
            .collect();
        assert_eq!(init, vec![0, 50, 100]);
        assert_eq!(*log.lock().unwrap(), vec!["pinit:llm", "init:llm", "start:llm"]);
    }

    #[tokio::test]
    async fn failure_is_contained_and_propagates_to_dependents() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let ctx = Arc::new(
            RunContext::builder()
                .entry(entry(
                    Witness {
                        log: Arc::clone(&log),
                        name: "broken",
                        parallel: true,
                        fail_init: true,
                        ..Witness::default()
                    },
                    &[],
                ))
                .entry(entry(
                    Witness {
                        log: Arc::clone(&log),
                        name: "sibling",
                        parallel: true,
                        ..Witness::default()
                    },
                    &[],
                ))
                .entry(entry(
                    Witness {
                        log: Arc::clone(&log),
                        name: "dependent",
                        ..Witness::default()
                    },
                    &["broken"],
                ))
                .build()
                .expect("build"),
        );
        let report = LifecycleDriver::new(4).bring_up(&ctx).await;

        assert_eq!(ctx.get("sibling").expect("sibling").state(), LifecycleState::Started);
        assert!(matches!(
            ctx.get("broken").expect("broken").state(),
            LifecycleState::Failed(reason) if reason.contains("no credentials")
        ));
        assert!(matches!(
            ctx.get("dependent").expect("dependent").state(),
            LifecycleState::Failed(reason) if reason.contains("broken")
        ));
        assert_eq!(report.failures.len(), 2);
        assert!(!log.lock().unwrap().contains(&"start:dependent".to_string()));
    }

    #[tokio::test]
    async fn worker_panic_fails_only_that_component() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let ctx = Arc::new(
            RunContext::builder()
                .entry(entry(
                    Witness {
                        log: Arc::clone(&log),
                        name: "panicky",
                        parallel: true,
                        panic_init: true,
                        ..Witness::default()
                    },
                    &[],
                ))
                .entry(entry(
                    Witness {
                        log: Arc::clone(&log),
                        name: "steady",
                        parallel: true,
                        ..Witness::default()
                    },
                    &[],
                ))
                .build()
                .expect("build"),
        );
        let report = LifecycleDriver::new(2).bring_up(&ctx).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "panicky");
        assert!(report.failures[0].1.contains("init exploded"), "{report:?}");
        assert_eq!(ctx.get("steady").expect("steady").state(), LifecycleState::Started);
    }

    #[tokio::test]
    async fn start_waits_for_dependencies() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = RunContext::builder();
        builder.push(entry(
            Witness {
                log: Arc::clone(&log),
                name: "store",
                parallel: true,
                ..Witness::default()
            },
            &[],
        ));
        builder.push(entry(
            Witness {
                log: Arc::clone(&log),
                name: "agent",
                ..Witness::default()
            },
            &["store"],
        ));
        let ctx = Arc::new(builder.build().expect("build"));
        let report = LifecycleDriver::new(1).bring_up(&ctx).await;
        assert!(report.is_success());

        let log = log.lock().unwrap();
        let pos = |needle: &str| log.iter().position(|l| l == needle).expect(needle);
        assert!(pos("start:store") < pos("start:agent"), "{log:?}");
    }
}
