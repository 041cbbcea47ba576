//! Effective run settings.
//!
//! Merges the [`RuntimeConfig`] defaults and overrides with the optional
//! `message_bus` declaration of a configuration file.

use serde::Serialize;
use woodwork_common::config::{BusConfig, OrchestrationMode, RuntimeConfig};
use woodwork_common::constants::{DEFAULT_EXIT_TOKEN, DEFAULT_WORKERS, MESSAGE_BUS_KIND, SUBSCRIBE_KEY};
use woodwork_common::error::{Result, WoodworkError};
use woodwork_compose::graph::ComponentGraph;
use woodwork_compose::parser::ast::Declaration;
use woodwork_compose::value::ConfigValue;

/// Settings a run actually uses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSettings {
    /// Selected backend.
    pub mode: OrchestrationMode,
    /// Lifecycle worker permits.
    pub workers: usize,
    /// Input value that ends the main loop.
    pub exit_token: String,
    /// Bus policy, also carrying the designated input.
    pub bus: BusConfig,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: OrchestrationMode::Sequential,
            workers: DEFAULT_WORKERS,
            exit_token: DEFAULT_EXIT_TOKEN.to_string(),
            bus: BusConfig::default(),
        }
    }
}

impl RuntimeSettings {
    /// Derives settings for `graph` on top of `base`.
    ///
    /// A `message_bus` declaration selects the bus backend unless it sets
    /// `enabled: false`; its keys override the bus defaults. A mode forced
    /// in `base` wins over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a bus key has the wrong type or the merged bus
    /// policy is invalid.
    pub fn from_graph(graph: &ComponentGraph, base: &RuntimeConfig) -> Result<Self> {
        let mut bus = base.bus.clone();
        let mut mode = OrchestrationMode::Sequential;

        if let Some(decl) = graph.declarations_of_kind(MESSAGE_BUS_KIND).next() {
            if graph.declarations_of_kind(MESSAGE_BUS_KIND).nth(1).is_some() {
                tracing::warn!(used = %decl.variable, "several message_bus declarations, using the first");
            }
            if apply_bus_declaration(decl, &mut bus)? {
                mode = OrchestrationMode::MessageBus;
            }
        }
        if let Some(forced) = base.mode {
            mode = forced;
        }
        bus.validate()?;

        tracing::debug!(%mode, workers = base.workers, "runtime settings resolved");
        Ok(Self {
            mode,
            workers: base.workers,
            exit_token: base.exit_token.clone(),
            bus,
        })
    }
}

/// Copies the declaration's keys into `bus`; returns whether the bus is enabled.
fn apply_bus_declaration(decl: &Declaration, bus: &mut BusConfig) -> Result<bool> {
    let mut enabled = true;
    for (key, value) in decl.config.iter() {
        if value.is_absent() {
            continue;
        }
        let field = Field { decl, key, value };
        match key {
            "enabled" => enabled = field.boolean()?,
            "max_attempts" => bus.max_attempts = field.integer()?,
            "retry_delay_ms" => bus.retry_delay_ms = field.integer()?,
            "backoff_multiplier" => bus.backoff_multiplier = field.float()?,
            "max_retry_delay_ms" => bus.max_retry_delay_ms = field.integer()?,
            "retry_interval_ms" => bus.retry_interval_ms = field.integer()?,
            "cleanup_interval_ms" => bus.cleanup_interval_ms = field.integer()?,
            "stream_ttl_ms" => bus.stream_ttl_ms = field.integer()?,
            "retry_ttl_ms" => bus.retry_ttl_ms = field.integer()?,
            "stream_capacity" => bus.stream_capacity = field.integer()?,
            "queue_capacity" => bus.queue_capacity = field.integer()?,
            "shutdown_grace_ms" => bus.shutdown_grace_ms = field.integer()?,
            "dead_letter_capacity" => bus.dead_letter_capacity = field.integer()?,
            "input" => bus.input = Some(field.name()?),
            SUBSCRIBE_KEY => {}
            other => tracing::warn!(declaration = %decl.variable, key = other, "unknown message_bus key ignored"),
        }
    }
    Ok(enabled)
}

struct Field<'a> {
    decl: &'a Declaration,
    key: &'a str,
    value: &'a ConfigValue,
}

impl Field<'_> {
    fn invalid(&self, expected: &'static str) -> WoodworkError {
        WoodworkError::InvalidConfigValue {
            component: self.decl.variable.clone(),
            key: self.key.to_string(),
            expected,
        }
    }

    fn boolean(&self) -> Result<bool> {
        self.value.as_bool().ok_or_else(|| self.invalid("a boolean"))
    }

    fn integer<T: TryFrom<i64>>(&self) -> Result<T> {
        self.value
            .as_i64()
            .and_then(|n| T::try_from(n).ok())
            .ok_or_else(|| self.invalid("a non-negative integer"))
    }

    fn float(&self) -> Result<f64> {
        self.value.as_f64().ok_or_else(|| self.invalid("a number"))
    }

    fn name(&self) -> Result<String> {
        self.value
            .as_str()
            .or_else(|| self.value.as_component_ref())
            .map(str::to_string)
            .ok_or_else(|| self.invalid("a component name"))
    }
}
