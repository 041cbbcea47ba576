//! Lifecycle progress reporting.
//!
//! The driver and the components themselves publish [`ProgressUpdate`]s on an
//! unbounded channel; a renderer folds them into a [`ProgressTracker`].

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use woodwork_common::types::{LifecycleState, Phase, ProgressUpdate};

/// Sending half of the progress channel.
pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Creates a progress channel.
#[must_use]
pub fn channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressUpdate>) {
    mpsc::unbounded_channel()
}

/// Reports progress of one component in one phase.
///
/// Cheap to clone and usable from blocking workers.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Option<ProgressSender>,
    component: String,
    phase: Phase,
    state: watch::Receiver<LifecycleState>,
}

impl ProgressReporter {
    /// Creates a reporter publishing on `sender`, reading the component's
    /// current state from `state`.
    #[must_use]
    pub fn new(
        sender: Option<ProgressSender>,
        component: impl Into<String>,
        phase: Phase,
        state: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            sender,
            component: component.into(),
            phase,
            state,
        }
    }

    /// A reporter that publishes nowhere.
    #[must_use]
    pub fn detached(component: impl Into<String>, phase: Phase) -> Self {
        let (_tx, rx) = watch::channel(LifecycleState::Created);
        Self::new(None, component, phase, rx)
    }

    /// Component the reporter belongs to.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Phase the reporter belongs to.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Publishes `percent` (clamped to 100) with the current state.
    pub fn report(&self, percent: u8) {
        let state = self.state.borrow().clone();
        self.report_state(percent, state);
    }

    pub(crate) fn report_state(&self, percent: u8, state: LifecycleState) {
        let Some(sender) = &self.sender else {
            return;
        };
        let update = ProgressUpdate {
            component: self.component.clone(),
            phase: self.phase,
            percent: percent.min(100),
            state,
        };
        // The renderer may have gone away; progress is best effort.
        let _ = sender.send(update);
    }
}

/// Per-component progress as seen by a renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentProgress {
    /// Init completion, 0 to 100.
    pub init: u8,
    /// Start completion, 0 to 100.
    pub start: u8,
    /// Last reported state.
    pub state: LifecycleState,
}

impl Default for ComponentProgress {
    fn default() -> Self {
        Self {
            init: 0,
            start: 0,
            state: LifecycleState::Created,
        }
    }
}

/// Folds progress updates into per-component and aggregate percentages.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    order: Vec<String>,
    components: HashMap<String, ComponentProgress>,
}

impl ProgressTracker {
    /// Tracks `names`, reported in the given order.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tracker = Self::default();
        for name in names {
            let name = name.into();
            if !tracker.components.contains_key(&name) {
                let _ = tracker.components.insert(name.clone(), ComponentProgress::default());
                tracker.order.push(name);
            }
        }
        tracker
    }

    /// Applies one update. Updates for unknown components start tracking them.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if !self.components.contains_key(&update.component) {
            self.order.push(update.component.clone());
        }
        let entry = self.components.entry(update.component.clone()).or_default();
        match update.phase {
            Phase::Init => entry.init = entry.init.max(update.percent),
            Phase::Start => {
                entry.init = 100;
                entry.start = entry.start.max(update.percent);
            }
        }
        if let LifecycleState::Failed(_) = update.state {
            entry.init = 100;
            entry.start = 100;
        }
        entry.state = update.state.clone();
    }

    /// Progress of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ComponentProgress> {
        self.components.get(name)
    }

    /// Tracked components in order with their progress.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ComponentProgress)> {
        self.order
            .iter()
            .filter_map(|name| self.components.get(name).map(|p| (name.as_str(), p)))
    }

    /// Overall completion across both phases of every component.
    #[must_use]
    pub fn aggregate(&self) -> u8 {
        if self.components.is_empty() {
            return 100;
        }
        let total: usize = self
            .components
            .values()
            .map(|p| usize::from(p.init) + usize::from(p.start))
            .sum();
        let max = self.components.len() * 200;
        u8::try_from(total * 100 / max).unwrap_or(100)
    }

    /// Returns `true` once every component is started or failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.components.values().all(|p| p.state.is_terminal())
    }

    /// Names of failed components, in order.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, p)| matches!(p.state, LifecycleState::Failed(_)))
            .map(|(name, _)| name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(component: &str, phase: Phase, percent: u8, state: LifecycleState) -> ProgressUpdate {
        ProgressUpdate {
            component: component.into(),
            phase,
            percent,
            state,
        }
    }

    #[test]
    fn reporter_publishes_clamped_percent_with_current_state() {
        let (tx, mut rx) = channel();
        let (_state_tx, state_rx) = watch::channel(LifecycleState::Initializing);
        let reporter = ProgressReporter::new(Some(tx), "llm", Phase::Init, state_rx);
        reporter.report(42);
        reporter.report(250);

        let first = rx.try_recv().expect("first update");
        assert_eq!(first.percent, 42);
        assert_eq!(first.state, LifecycleState::Initializing);
        assert_eq!(rx.try_recv().expect("second update").percent, 100);
    }

    #[test]
    fn detached_reporter_is_silent() {
        let reporter = ProgressReporter::detached("x", Phase::Start);
        reporter.report(10);
        assert_eq!(reporter.component(), "x");
        assert_eq!(reporter.phase(), Phase::Start);
    }

    #[test]
    fn tracker_aggregates_both_phases() {
        let mut tracker = ProgressTracker::new(["a", "b"]);
        assert_eq!(tracker.aggregate(), 0);

        tracker.apply(&update("a", Phase::Init, 100, LifecycleState::Initialized));
        assert_eq!(tracker.aggregate(), 25);

        tracker.apply(&update("a", Phase::Start, 100, LifecycleState::Started));
        tracker.apply(&update("b", Phase::Init, 50, LifecycleState::Initializing));
        assert_eq!(tracker.aggregate(), 62);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn failure_completes_component() {
        let mut tracker = ProgressTracker::new(["a"]);
        tracker.apply(&update("a", Phase::Init, 0, LifecycleState::Failed("boom".into())));
        assert_eq!(tracker.aggregate(), 100);
        assert!(tracker.is_complete());
        assert_eq!(tracker.failed(), vec!["a"]);
    }

    #[test]
    fn percentages_never_go_backwards() {
        let mut tracker = ProgressTracker::new(["a"]);
        tracker.apply(&update("a", Phase::Init, 50, LifecycleState::Initializing));
        tracker.apply(&update("a", Phase::Init, 0, LifecycleState::Initializing));
        assert_eq!(tracker.get("a").expect("tracked").init, 50);
    }

    #[test]
    fn empty_tracker_is_complete() {
        let tracker = ProgressTracker::new(Vec::<String>::new());
        assert_eq!(tracker.aggregate(), 100);
        assert!(tracker.is_complete());
    }
}
