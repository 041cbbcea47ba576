//! Value resolution in document order.
//!
//! Environment references are replaced by their live value (or
//! [`ConfigValue::Absent`] when unset) and every component reference is
//! checked against the declarations that precede it. Resolution is a single
//! linear pass: a declaration may only reference names declared earlier.

use std::collections::HashMap;

use woodwork_common::error::Result;

use crate::graph::ComponentGraph;
use crate::parser::ast::Declaration;
use crate::value::{ConfigMap, ConfigValue};

/// Source of environment variable values.
pub trait Environment {
    /// Returns the value of `name`, or `None` if it is unset.
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Resolves parsed declarations into a component graph.
///
/// # Errors
///
/// Returns [`woodwork_common::error::WoodworkError::UnresolvedReference`] if
/// a declaration references a name not declared before it.
pub fn resolve(declarations: Vec<Declaration>, env: &dyn Environment) -> Result<ComponentGraph> {
    let mut graph = ComponentGraph::new();
    for mut decl in declarations {
        resolve_env_in_map(&mut decl.config, env);
        tracing::debug!(name = %decl.variable, kind = %decl.component, "resolved declaration");
        graph.insert(decl)?;
    }
    tracing::info!(components = graph.len(), "configuration resolved");
    Ok(graph)
}

/// Replaces every environment reference under `map`, at any depth.
pub fn resolve_env_in_map(map: &mut ConfigMap, env: &dyn Environment) {
    resolve_all(map.values_mut().collect(), env);
}

/// Replaces environment references in `value` in place.
pub fn resolve_env(value: &mut ConfigValue, env: &dyn Environment) {
    resolve_all(vec![value], env);
}

fn resolve_all<'a>(mut pending: Vec<&'a mut ConfigValue>, env: &dyn Environment) {
    while let Some(value) = pending.pop() {
        if let ConfigValue::EnvRef(name) = value {
            let resolved = env.var(name).map_or_else(
                || {
                    tracing::debug!(var = %name, "environment variable unset");
                    ConfigValue::Absent
                },
                ConfigValue::String,
            );
            *value = resolved;
            continue;
        }
        match value {
            ConfigValue::Mapping(map) => pending.extend(map.values_mut()),
            ConfigValue::List(items) => pending.extend(items.iter_mut()),
            ConfigValue::String(_)
            | ConfigValue::Bool(_)
            | ConfigValue::Number(_)
            | ConfigValue::EnvRef(_)
            | ConfigValue::ComponentRef(_)
            | ConfigValue::Absent => {}
        }
    }
}
