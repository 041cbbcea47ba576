//! Component graph built on `petgraph`.
//!
//! Holds resolved declarations in document order together with a directed
//! graph of reference edges. Declarations are inserted one at a time and may
//! only reference names already present, so every edge points backwards in
//! the document and the graph stays acyclic.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use woodwork_common::error::{ForbiddenReason, Result, WoodworkError};

use crate::parser::ast::Declaration;

/// Resolved declarations and their dependency edges.
#[derive(Debug, Default)]
pub struct ComponentGraph {
    declarations: Vec<Declaration>,
    dependencies: Vec<Vec<String>>,
    index: HashMap<String, usize>,
    nodes: Vec<NodeIndex>,
    /// Edges point from a dependency to its dependent.
    graph: DiGraph<usize, ()>,
}

impl ComponentGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a declaration after every declaration already present.
    ///
    /// # Errors
    ///
    /// Returns a forbidden-name error if the name is taken, or an
    /// unresolved-reference error if the declaration references a name
    /// not yet in the graph.
    pub fn insert(&mut self, decl: Declaration) -> Result<()> {
        if self.index.contains_key(&decl.variable) {
            return Err(WoodworkError::ForbiddenVariableName {
                name: decl.variable,
                reason: ForbiddenReason::Duplicate,
            });
        }

        let deps: Vec<String> = decl.references().into_iter().map(str::to_string).collect();
        let mut dep_nodes = Vec::with_capacity(deps.len());
        for dep in &deps {
            let Some(&pos) = self.index.get(dep) else {
                return Err(WoodworkError::UnresolvedReference {
                    name: dep.clone(),
                    referenced_by: decl.variable,
                });
            };
            dep_nodes.push(self.nodes[pos]);
        }

        let pos = self.declarations.len();
        let node = self.graph.add_node(pos);
        for dep in dep_nodes {
            let _ = self.graph.add_edge(dep, node, ());
        }
        let _ = self.index.insert(decl.variable.clone(), pos);
        self.nodes.push(node);
        self.dependencies.push(deps);
        self.declarations.push(decl);
        Ok(())
    }

    /// Returns the declaration named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.index.get(name).map(|&pos| &self.declarations[pos])
    }

    /// Returns `true` if `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns `true` if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Declarations in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter()
    }

    /// Declarations whose component kind is `kind`, in document order.
    pub fn declarations_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Declaration> {
        self.declarations.iter().filter(move |d| d.component == kind)
    }

    /// Names `name` references, in source order. Empty for unknown names.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map_or(&[] as &[String], |&pos| self.dependencies[pos].as_slice())
    }

    /// Names that reference `name`, in document order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&pos) = self.index.get(name) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .neighbors_directed(self.nodes[pos], Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|p| self.declarations[p].variable.as_str())
            .collect()
    }

    /// Returns a topological ordering with dependencies first.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph contains cycles.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .iter()
                .map(|&idx| self.declarations[self.graph[idx]].variable.clone())
                .collect()),
            Err(_cycle) => Err(WoodworkError::Config {
                message: "cyclic dependency detected in component graph".into(),
            }),
        }
    }
}

impl Serialize for ComponentGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.declarations.len()))?;
        for decl in &self.declarations {
            map.serialize_entry(&decl.variable, decl)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ConfigMap, ConfigValue};

    fn decl(name: &str, refs: &[&str]) -> Declaration {
        let config: ConfigMap = refs
            .iter()
            .enumerate()
            .map(|(i, r)| (format!("dep{i}"), ConfigValue::ComponentRef((*r).to_string())))
            .collect();
        Declaration::new(name, "kind", "type").with_config(config)
    }

    fn pos(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).expect(name)
    }

    #[test]
    fn empty_graph_resolves_to_empty() {
        let graph = ComponentGraph::new();
        assert!(graph.resolve_order().expect("should resolve").is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn linear_dependency_chain() {
        let mut graph = ComponentGraph::new();
        graph.insert(decl("db", &[])).expect("db");
        graph.insert(decl("api", &["db"])).expect("api");

        let order = graph.resolve_order().expect("should resolve");
        assert!(pos(&order, "db") < pos(&order, "api"), "{order:?}");
        assert_eq!(graph.dependents("db"), vec!["api"]);
        assert!(graph.dependents("api").is_empty());
    }

    #[test]
    fn diamond_dependency() {
        let mut graph = ComponentGraph::new();
        graph.insert(decl("d", &[])).expect("d");
        graph.insert(decl("b", &["d"])).expect("b");
        graph.insert(decl("c", &["d"])).expect("c");
        graph.insert(decl("a", &["b", "c"])).expect("a");

        let order = graph.resolve_order().expect("should resolve");
        assert_eq!(order.len(), 4);
        assert!(pos(&order, "d") < pos(&order, "b"));
        assert!(pos(&order, "d") < pos(&order, "c"));
        assert!(pos(&order, "b") < pos(&order, "a"));
        assert!(pos(&order, "c") < pos(&order, "a"));
        assert_eq!(graph.dependents("d"), vec!["b", "c"]);
        assert_eq!(graph.dependencies("a"), ["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn unknown_reference_rejected_and_graph_unchanged() {
        let mut graph = ComponentGraph::new();
        let err = graph.insert(decl("a", &["ghost"])).unwrap_err();
        assert!(err.to_string().contains("ghost"), "got: {err}");
        assert!(graph.is_empty());
        assert!(!graph.contains("a"));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut graph = ComponentGraph::new();
        graph.insert(decl("a", &[])).expect("a");
        assert!(matches!(
            graph.insert(decl("a", &[])),
            Err(WoodworkError::ForbiddenVariableName { .. })
        ));
    }

    #[test]
    fn iteration_follows_document_order() {
        let mut graph = ComponentGraph::new();
        for name in ["z", "m", "a"] {
            graph.insert(decl(name, &[])).expect(name);
        }
        let names: Vec<_> = graph.iter().map(|d| d.variable.as_str()).collect();
        assert_eq!(names, vec!["z", "m", "a"]);
    }

    #[test]
    fn serializes_as_name_keyed_object() {
        let mut graph = ComponentGraph::new();
        graph.insert(decl("db", &[])).expect("db");
        graph.insert(decl("api", &["db"])).expect("api");
        let json = serde_json::to_value(&graph).expect("serialize");
        assert_eq!(json["api"]["variable"], "api");
        assert_eq!(json["api"]["type"], "type");
        assert_eq!(json["api"]["config"]["dep0"], "db");
    }
}
