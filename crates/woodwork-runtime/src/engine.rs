//! Runtime engine that runs a configuration end to end.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use woodwork_common::config::RuntimeConfig;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_compose::graph::ComponentGraph;

use crate::backend::{self, OrchestrationBackend, RunSummary};
use crate::context::RunContext;
use crate::factory::{self, FactoryRegistry};
use crate::lifecycle::{LifecycleDriver, LifecycleReport};
use crate::progress::ProgressSender;
use crate::settings::RuntimeSettings;

/// The runtime engine that coordinates parsing, construction, bring-up and
/// orchestration.
///
/// Holds the factories components are built from and the runtime
/// configuration every run starts from.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    registry: FactoryRegistry,
    config: RuntimeConfig,
}

impl Engine {
    /// Creates an engine building components from `registry`.
    #[must_use]
    pub fn new(registry: FactoryRegistry, config: RuntimeConfig) -> Self {
        Self { registry, config }
    }

    /// Registered component factories.
    #[must_use]
    pub const fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    /// Mutable access for registering more factories.
    pub const fn registry_mut(&mut self) -> &mut FactoryRegistry {
        &mut self.registry
    }

    /// Base runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or the parse error.
    pub fn load(&self, path: &Path) -> Result<ComponentGraph> {
        tracing::info!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| WoodworkError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.parse(&content)
    }

    /// Parses configuration text.
    ///
    /// # Errors
    ///
    /// Returns a parse, forbidden-name or unresolved-reference error.
    pub fn parse(&self, text: &str) -> Result<ComponentGraph> {
        let graph = woodwork_compose::parse(text)?;
        tracing::debug!(declarations = graph.len(), "configuration parsed");
        Ok(graph)
    }

    /// Settings a run of `graph` would use.
    ///
    /// # Errors
    ///
    /// Returns an error if the `message_bus` declaration is invalid.
    pub fn settings(&self, graph: &ComponentGraph) -> Result<RuntimeSettings> {
        RuntimeSettings::from_graph(graph, &self.config)
    }

    /// Builds every component of `graph`.
    ///
    /// # Errors
    ///
    /// Returns an error if a factory is missing or a constructor fails.
    pub fn instantiate(&self, graph: &ComponentGraph, settings: &RuntimeSettings) -> Result<Arc<RunContext>> {
        factory::instantiate(graph, &self.registry, settings).map(Arc::new)
    }

    /// Initializes and starts every component.
    pub async fn bring_up(
        &self,
        ctx: &Arc<RunContext>,
        settings: &RuntimeSettings,
        progress: Option<ProgressSender>,
    ) -> LifecycleReport {
        let driver = LifecycleDriver::new(settings.workers);
        let driver = match progress {
            Some(sender) => driver.with_progress(sender),
            None => driver,
        };
        driver.bring_up(ctx).await
    }

    /// Backend `settings` select.
    #[must_use]
    pub fn backend(&self, settings: &RuntimeSettings) -> Box<dyn OrchestrationBackend> {
        backend::select(settings)
    }

    /// Runs `graph` until the input ends or `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if settings or construction fail, if any component
    /// fails to come up (after closing them all), or if the backend fails.
    pub async fn run(
        &self,
        graph: &ComponentGraph,
        progress: Option<ProgressSender>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary> {
        let settings = self.settings(graph)?;
        let ctx = self.instantiate(graph, &settings)?;

        let report = self.bring_up(&ctx, &settings, progress).await;
        if !report.is_success() {
            let _ = ctx.close_all();
            let failed: Vec<String> = report
                .failures
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect();
            return Err(WoodworkError::runtime(format!(
                "{} component(s) failed to start: {}",
                failed.len(),
                failed.join("; ")
            )));
        }

        let backend = self.backend(&settings);
        tracing::info!(backend = backend.name(), session = %ctx.session_id(), "run starting");
        let summary = backend.run(ctx, shutdown).await?;
        tracing::info!(
            backend = summary.backend,
            iterations = summary.iterations,
            exit = %summary.exit,
            "run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    struct Inert;

    impl Component for Inert {}

    #[test]
    fn load_reports_missing_file() {
        let err = Engine::default().load(Path::new("/nonexistent/main.ww")).unwrap_err();
        assert!(matches!(err, WoodworkError::Io { .. }), "{err}");
    }

    #[test]
    fn load_parses_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.ww");
        std::fs::write(&path, "store = memory local { }").expect("write");
        let graph = Engine::default().load(&path).expect("load");
        assert!(graph.contains("store"));
    }

    #[tokio::test]
    async fn run_without_input_closes_and_fails() {
        let mut engine = Engine::default();
        let _ = engine
            .registry_mut()
            .register_kind("memory", |_| Ok(Arc::new(Inert) as Arc<dyn Component>));
        let graph = engine.parse("store = memory local { }").expect("parse");
        let err = engine
            .run(&graph, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WoodworkError::NotFound { .. }), "{err}");
    }
}
