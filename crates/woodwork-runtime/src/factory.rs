//! Component construction.
//!
//! A [`FactoryRegistry`] maps a `(kind, type)` pair, or a whole kind, to a
//! constructor. [`instantiate`] walks a resolved graph in document order so
//! every reference points at an instance that already exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use woodwork_common::constants::MESSAGE_BUS_KIND;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::SessionId;
use woodwork_compose::graph::ComponentGraph;

use crate::component::Component;
use crate::config::ComponentConfig;
use crate::context::{ComponentEntry, RunContext, panic_message};
use crate::settings::RuntimeSettings;

/// Builds one component from its configuration.
pub type Constructor = Arc<dyn Fn(&ComponentConfig) -> Result<Arc<dyn Component>> + Send + Sync>;

const ANY_TYPE: &str = "*";

/// Registered constructors keyed by component kind and type.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    constructors: HashMap<(String, String), Constructor>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.constructors.keys().map(|(k, t)| format!("{k}/{t}")).collect();
        keys.sort_unstable();
        f.debug_struct("FactoryRegistry").field("constructors", &keys).finish()
    }
}

impl FactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` for `kind`/`component_type`, replacing any
    /// previous registration.
    pub fn register<F>(&mut self, kind: &str, component_type: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ComponentConfig) -> Result<Arc<dyn Component>> + Send + Sync + 'static,
    {
        let _ = self
            .constructors
            .insert((kind.to_string(), component_type.to_string()), Arc::new(constructor));
        self
    }

    /// Registers `constructor` for every type of `kind` without an exact
    /// registration.
    pub fn register_kind<F>(&mut self, kind: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ComponentConfig) -> Result<Arc<dyn Component>> + Send + Sync + 'static,
    {
        self.register(kind, ANY_TYPE, constructor)
    }

    /// Finds the constructor for `kind`/`component_type`, exact match first.
    #[must_use]
    pub fn lookup(&self, kind: &str, component_type: &str) -> Option<&Constructor> {
        self.constructors
            .get(&(kind.to_string(), component_type.to_string()))
            .or_else(|| self.constructors.get(&(kind.to_string(), ANY_TYPE.to_string())))
    }

    /// Returns `true` if a constructor would be found.
    #[must_use]
    pub fn contains(&self, kind: &str, component_type: &str) -> bool {
        self.lookup(kind, component_type).is_some()
    }
}

/// Builds every component of `graph` into a fresh [`RunContext`].
///
/// `message_bus` declarations configure the run and are not built.
///
/// # Errors
///
/// Returns `NotFound` for a declaration with no registered constructor, or
/// the constructor's own error. Components built before the failure are
/// closed first.
pub fn instantiate(
    graph: &ComponentGraph,
    registry: &FactoryRegistry,
    settings: &RuntimeSettings,
) -> Result<RunContext> {
    let mut builder = RunContext::builder()
        .session_id(SessionId::generate())
        .input(settings.bus.input.clone());
    let mut built: HashMap<String, Arc<dyn Component>> = HashMap::new();
    let mut order: Vec<Arc<dyn Component>> = Vec::new();

    for decl in graph.iter() {
        if decl.component == MESSAGE_BUS_KIND {
            continue;
        }
        let name = decl.variable.as_str();
        let Some(constructor) = registry.lookup(&decl.component, &decl.component_type) else {
            abandon(&order);
            return Err(WoodworkError::NotFound {
                kind: "component factory",
                id: format!("{} {} (for \"{name}\")", decl.component, decl.component_type),
            });
        };

        let deps: Vec<String> = graph
            .dependencies(name)
            .iter()
            .filter(|dep| built.contains_key(dep.as_str()))
            .cloned()
            .collect();
        let config = deps.iter().fold(
            ComponentConfig::new(name, decl.config.clone()),
            |config, dep| config.with_ref(dep.as_str(), Arc::clone(&built[dep])),
        );

        let component = match constructor(&config) {
            Ok(component) => component,
            Err(e) => {
                tracing::error!(component = %name, error = %e, "construction failed");
                abandon(&order);
                return Err(e);
            }
        };
        tracing::debug!(component = %name, kind = %decl.component, component_type = %decl.component_type, "component built");

        let _ = built.insert(name.to_string(), Arc::clone(&component));
        order.push(Arc::clone(&component));
        builder.push(
            ComponentEntry::new(name, component, config)
                .with_kind(&decl.component, &decl.component_type)
                .with_dependencies(deps),
        );
    }

    let ctx = builder.build().inspect_err(|_| abandon(&order))?;
    tracing::info!(components = ctx.len(), session = %ctx.session_id(), "components instantiated");
    Ok(ctx)
}

/// Closes what a failed instantiation already built, newest first.
fn abandon(built: &[Arc<dyn Component>]) {
    for component in built.iter().rev() {
        let closed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| component.close()));
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "close after failed instantiation failed"),
            Err(panic) => {
                tracing::error!(panic = %panic_message(panic.as_ref()), "close after failed instantiation panicked");
            }
        }
    }
}
