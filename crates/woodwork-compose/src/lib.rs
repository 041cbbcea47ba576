//! # woodwork-compose
//!
//! Parser and resolver for the Woodwork configuration language.
//!
//! Handles:
//! - **Parser**: Lexing, grammar parsing and name validation of declarations.
//! - **Value**: The closed [`ConfigValue`](value::ConfigValue) tree and its
//!   insertion-ordered [`ConfigMap`](value::ConfigMap).
//! - **Resolver**: Environment-variable substitution and reference checking
//!   in document order.
//! - **Graph**: The resolved [`ComponentGraph`](graph::ComponentGraph) with its
//!   dependency edges.
//!
//! ```
//! use woodwork_compose::value::ConfigValue;
//!
//! let graph = woodwork_compose::parse(r#"name1 = keyword1 keyword2 { key1: "value1" }"#)
//!     .expect("valid configuration");
//! let decl = graph.get("name1").expect("declared");
//! assert_eq!(decl.component, "keyword1");
//! assert_eq!(decl.config.get("key1"), Some(&ConfigValue::String("value1".into())));
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod graph;
pub mod parser;
pub mod resolver;
pub mod value;

use woodwork_common::error::Result;

use crate::graph::ComponentGraph;
use crate::resolver::{Environment, ProcessEnv};

/// Parses configuration text into a resolved component graph, reading
/// `$NAME` references from the process environment.
///
/// # Errors
///
/// Returns a parse, forbidden-name or unresolved-reference error; no partial
/// graph is ever returned.
pub fn parse(input: &str) -> Result<ComponentGraph> {
    parse_with_env(input, &ProcessEnv)
}

/// Parses configuration text, resolving `$NAME` references through `env`.
///
/// # Errors
///
/// Returns a parse, forbidden-name or unresolved-reference error.
pub fn parse_with_env(input: &str, env: &dyn Environment) -> Result<ComponentGraph> {
    let declarations = parser::parse_declarations(input)?;
    resolver::resolve(declarations, env)
}
