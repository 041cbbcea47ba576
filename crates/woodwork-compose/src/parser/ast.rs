//! Declaration records produced by the grammar parser.

use serde::Serialize;

use crate::value::ConfigMap;

/// One `name = component type { ... }` unit.
///
/// Immutable once the parser closes its block; the resolver only rewrites
/// environment references inside `config`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declaration {
    /// Declared name, unique across the document.
    pub variable: String,
    /// Component kind, e.g. `llm` or `input`.
    pub component: String,
    /// Implementation type within the kind, e.g. `openai`.
    #[serde(rename = "type")]
    pub component_type: String,
    /// The block contents in declaration order.
    pub config: ConfigMap,
    /// Source line of the declaration name.
    #[serde(skip)]
    pub line: usize,
}

impl Declaration {
    /// Creates a declaration with an empty block.
    #[must_use]
    pub fn new(
        variable: impl Into<String>,
        component: impl Into<String>,
        component_type: impl Into<String>,
    ) -> Self {
        Self {
            variable: variable.into(),
            component: component.into(),
            component_type: component_type.into(),
            config: ConfigMap::new(),
            line: 0,
        }
    }

    /// Sets the block contents.
    #[must_use]
    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    /// Names of every declaration referenced from the block, in source order,
    /// without duplicates.
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.config.component_refs(&mut refs);
        let mut seen = std::collections::HashSet::new();
        refs.retain(|name| seen.insert(*name));
        refs
    }
}
