//! Run-scoped registry of live components.
//!
//! A [`RunContext`] is assembled once through [`RunContextBuilder`], shared
//! as `Arc<RunContext>` while the run lasts, and torn down by
//! [`RunContext::close_all`]. Only lifecycle states change after build.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::{LifecycleState, SessionId};

use crate::component::{Capabilities, Capability, Component};
use crate::config::ComponentConfig;

/// One registered component.
pub struct ComponentEntry {
    name: String,
    kind: String,
    component_type: String,
    component: Arc<dyn Component>,
    capabilities: Capabilities,
    config: Arc<ComponentConfig>,
    dependencies: Vec<String>,
    state: watch::Sender<LifecycleState>,
}

impl std::fmt::Debug for ComponentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("type", &self.component_type)
            .field("capabilities", &self.capabilities)
            .field("dependencies", &self.dependencies)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ComponentEntry {
    /// Registers `component` under `name`, probing its capabilities.
    #[must_use]
    pub fn new(name: impl Into<String>, component: Arc<dyn Component>, config: ComponentConfig) -> Self {
        let capabilities = Capabilities::detect(component.as_ref());
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            name: name.into(),
            kind: String::new(),
            component_type: String::new(),
            component,
            capabilities,
            config: Arc::new(config),
            dependencies: Vec::new(),
            state,
        }
    }

    /// Records the declaration's component kind and type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>, component_type: impl Into<String>) -> Self {
        self.kind = kind.into();
        self.component_type = component_type.into();
        self
    }

    /// Records the names this component references.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Declared name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component kind, e.g. `input`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Implementation type, e.g. `console`.
    #[must_use]
    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    /// The live instance.
    #[must_use]
    pub const fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    /// Capabilities detected at registration.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns `true` if the component has `capability`.
    #[must_use]
    pub const fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<ComponentConfig> {
        &self.config
    }

    /// Names of the components this one references.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Watches lifecycle state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifecycle forbids the transition.
    pub fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut refused = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                true
            } else {
                refused = Some(current.clone());
                false
            }
        });
        match refused {
            Some(current) if !changed => Err(WoodworkError::component(
                &self.name,
                format!("invalid lifecycle transition {current} -> {next}"),
            )),
            _ => {
                tracing::trace!(component = %self.name, state = %next, "lifecycle transition");
                Ok(())
            }
        }
    }
}

/// Registry of every live component of one run.
#[derive(Debug)]
pub struct RunContext {
    session_id: SessionId,
    entries: Vec<ComponentEntry>,
    index: HashMap<String, usize>,
    input: Option<String>,
    closed: AtomicBool,
}

impl RunContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    /// Session identifier of the run.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Entries in document order.
    #[must_use]
    pub fn entries(&self) -> &[ComponentEntry] {
        &self.entries
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no component is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ComponentEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// The input component driving the main loop: the designated one if
    /// set, else the first input-capable component.
    #[must_use]
    pub fn input(&self) -> Option<&ComponentEntry> {
        self.input.as_deref().map_or_else(
            || self.entries.iter().find(|e| e.has(Capability::Input)),
            |name| self.get(name),
        )
    }

    /// Processor components in document order.
    pub fn processors(&self) -> impl Iterator<Item = &ComponentEntry> {
        self.with_capability(Capability::Processor)
    }

    /// Output components in document order.
    pub fn outputs(&self) -> impl Iterator<Item = &ComponentEntry> {
        self.with_capability(Capability::Output)
    }

    /// Components with `capability`, in document order.
    pub fn with_capability(&self, capability: Capability) -> impl Iterator<Item = &ComponentEntry> {
        self.entries.iter().filter(move |e| e.has(capability))
    }

    /// Returns `true` once [`RunContext::close_all`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every component in reverse document order, once.
    ///
    /// Failures and panics are logged and collected; every component gets its
    /// close call. Later calls return an empty list.
    pub fn close_all(&self) -> Vec<WoodworkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let mut failures = Vec::new();
        for entry in self.entries.iter().rev() {
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.component.close()));
            let error = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(component = %entry.name, "component closed");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(panic) => WoodworkError::component(
                    &entry.name,
                    format!("panicked while closing: {}", panic_message(panic.as_ref())),
                ),
            };
            tracing::error!(component = %entry.name, error = %error, "close failed");
            failures.push(error);
        }
        tracing::info!(components = self.entries.len(), failures = failures.len(), "components closed");
        failures
    }

    /// Returns a guard that runs [`RunContext::close_all`] when dropped.
    #[must_use]
    pub fn close_guard(self: &Arc<Self>) -> CloseGuard {
        CloseGuard(Arc::clone(self))
    }
}

/// Closes all components of a context when dropped.
#[derive(Debug)]
pub struct CloseGuard(Arc<RunContext>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let _ = self.0.close_all();
    }
}

/// Assembles a [`RunContext`].
#[derive(Debug, Default)]
pub struct RunContextBuilder {
    session_id: Option<SessionId>,
    entries: Vec<ComponentEntry>,
    input: Option<String>,
}

impl RunContextBuilder {
    /// Uses `session_id` instead of a generated one.
    #[must_use]
    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Designates the input component by name.
    #[must_use]
    pub fn input(mut self, name: Option<String>) -> Self {
        self.input = name;
        self
    }

    /// Appends an entry after the ones already added.
    #[must_use]
    pub fn entry(mut self, entry: ComponentEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Appends an entry in place.
    pub fn push(&mut self, entry: ComponentEntry) {
        self.entries.push(entry);
    }

    /// Finishes the context.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names, or if the designated input is
    /// not a registered input-capable component.
    pub fn build(self) -> Result<RunContext> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            if index.insert(entry.name.clone(), i).is_some() {
                return Err(WoodworkError::Config {
                    message: format!("component \"{}\" registered twice", entry.name),
                });
            }
        }
        if let Some(name) = &self.input {
            match index.get(name).map(|&i| &self.entries[i]) {
                None => {
                    return Err(WoodworkError::NotFound {
                        kind: "input component",
                        id: name.clone(),
                    });
                }
                Some(entry) if !entry.has(Capability::Input) => {
                    return Err(WoodworkError::Config {
                        message: format!("component \"{name}\" cannot be used as input"),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(RunContext {
            session_id: self.session_id.unwrap_or_else(SessionId::generate),
            entries: self.entries,
            index,
            input: self.input,
            closed: AtomicBool::new(false),
        })
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
