//! Live dependency graph
//!
//! Nodes are loaded instances; edges are static or dynamic dependencies.
//! Namespace includes ride along with identical static/dynamic semantics.
//! The graph stores pure structure; reference-count side effects belong
//! to the callers in `context` and the commit engine. Acyclicity is
//! enforced on every edge insertion, so the graph is a DAG at every
//! quiescent point.

use crate::error::{ModuleError, ModuleResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Whether an edge was recorded at load time or added at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Recorded at load, immutable for the instance's lifetime
    Static,
    /// Added and removable while the instance is live
    Dynamic,
}

/// Result of a dependency or include query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyState {
    /// No edge
    Removed,
    /// A dynamic edge is present
    Dynamic,
    /// A static edge is present
    Static,
}

impl From<Option<EdgeKind>> for DependencyState {
    fn from(kind: Option<EdgeKind>) -> Self {
        match kind {
            None => DependencyState::Removed,
            Some(EdgeKind::Dynamic) => DependencyState::Dynamic,
            Some(EdgeKind::Static) => DependencyState::Static,
        }
    }
}

#[derive(Default)]
struct Node {
    /// Outgoing dependency edges, keyed by target instance name
    edges: HashMap<String, EdgeKind>,
    /// Included namespaces
    includes: HashMap<String, EdgeKind>,
}

/// The process dependency graph
pub(crate) struct DependencyGraph {
    inner: Mutex<HashMap<String, Node>>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a node; idempotent
    pub(crate) fn add_node(&self, name: &str) {
        self.inner.lock().entry(name.to_string()).or_default();
    }

    /// Drop a node, returning its outgoing edges for refcount release
    pub(crate) fn remove_node(&self, name: &str) -> Vec<(String, EdgeKind)> {
        match self.inner.lock().remove(name) {
            Some(node) => node.edges.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Insert an edge `from -> to`
    ///
    /// Fails when the edge already exists or when a path `to -> … -> from`
    /// would close a cycle. The graph stays untouched on failure.
    pub(crate) fn add_edge(&self, from: &str, to: &str, kind: EdgeKind) -> ModuleResult<()> {
        let mut nodes = self.inner.lock();
        if from == to || reachable(&nodes, to, from) {
            return Err(ModuleError::DependencyCycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let node = nodes.entry(from.to_string()).or_default();
        if node.edges.contains_key(to) {
            return Err(ModuleError::DuplicateDependency {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        node.edges.insert(to.to_string(), kind);
        Ok(())
    }

    /// Remove a dynamic edge `from -> to`
    pub(crate) fn remove_edge(&self, from: &str, to: &str) -> ModuleResult<()> {
        let mut nodes = self.inner.lock();
        let node = nodes
            .get_mut(from)
            .ok_or_else(|| ModuleError::DependencyNotFound {
                from: from.to_string(),
                to: to.to_string(),
            })?;
        match node.edges.get(to) {
            None => Err(ModuleError::DependencyNotFound {
                from: from.to_string(),
                to: to.to_string(),
            }),
            Some(EdgeKind::Static) => Err(ModuleError::StaticDependency {
                from: from.to_string(),
                to: to.to_string(),
            }),
            Some(EdgeKind::Dynamic) => {
                node.edges.remove(to);
                Ok(())
            }
        }
    }

    /// Query the edge `from -> to`
    pub(crate) fn query_edge(&self, from: &str, to: &str) -> DependencyState {
        let nodes = self.inner.lock();
        nodes
            .get(from)
            .and_then(|node| node.edges.get(to).copied())
            .into()
    }

    /// Whether `from` holds any edge to `to`
    pub(crate) fn depends_on(&self, from: &str, to: &str) -> bool {
        self.query_edge(from, to) != DependencyState::Removed
    }

    /// Record a namespace include
    pub(crate) fn add_include(&self, instance: &str, namespace: &str, kind: EdgeKind) -> ModuleResult<()> {
        let mut nodes = self.inner.lock();
        let node = nodes.entry(instance.to_string()).or_default();
        if node.includes.contains_key(namespace) {
            return Err(ModuleError::DuplicateDependency {
                from: instance.to_string(),
                to: format!("namespace '{}'", namespace),
            });
        }
        node.includes.insert(namespace.to_string(), kind);
        Ok(())
    }

    /// Remove a dynamic namespace include
    pub(crate) fn remove_include(&self, instance: &str, namespace: &str) -> ModuleResult<()> {
        let mut nodes = self.inner.lock();
        let node = nodes
            .get_mut(instance)
            .ok_or_else(|| ModuleError::NamespaceNotIncluded(namespace.to_string()))?;
        match node.includes.get(namespace) {
            None => Err(ModuleError::NamespaceNotIncluded(namespace.to_string())),
            Some(EdgeKind::Static) => Err(ModuleError::StaticDependency {
                from: instance.to_string(),
                to: format!("namespace '{}'", namespace),
            }),
            Some(EdgeKind::Dynamic) => {
                node.includes.remove(namespace);
                Ok(())
            }
        }
    }

    /// Query the include of `namespace` by `instance`
    pub(crate) fn query_include(&self, instance: &str, namespace: &str) -> DependencyState {
        let nodes = self.inner.lock();
        nodes
            .get(instance)
            .and_then(|node| node.includes.get(namespace).copied())
            .into()
    }

    /// Order `candidates` so every instance precedes its dependencies
    ///
    /// Used by the prune pass: importers are destroyed before the
    /// instances they import from.
    pub(crate) fn destruction_order(&self, candidates: &[String]) -> Vec<String> {
        let nodes = self.inner.lock();
        let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::with_capacity(candidates.len());

        // Post-order over the candidate-restricted subgraph yields
        // dependencies first; reversing puts importers first.
        fn visit(
            nodes: &HashMap<String, Node>,
            candidate_set: &HashSet<&str>,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
            name: &str,
        ) {
            if !visited.insert(name.to_string()) {
                return;
            }
            if let Some(node) = nodes.get(name) {
                for target in node.edges.keys() {
                    if candidate_set.contains(target.as_str()) {
                        visit(nodes, candidate_set, visited, order, target);
                    }
                }
            }
            order.push(name.to_string());
        }

        for name in candidates {
            visit(&nodes, &candidate_set, &mut visited, &mut order, name);
        }
        order.reverse();
        order
    }
}

/// Depth-first reachability along dependency edges
fn reachable(nodes: &HashMap<String, Node>, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut stack = vec![from];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(node) = nodes.get(current) {
            for target in node.edges.keys() {
                if target == to {
                    return true;
                }
                stack.push(target);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_abc() -> DependencyGraph {
        let graph = DependencyGraph::new();
        graph.add_node("a");
        graph.add_node("b");
        graph.add_node("c");
        graph
    }

    #[test]
    fn add_then_remove_restores_query() {
        let graph = graph_abc();
        assert_eq!(graph.query_edge("a", "b"), DependencyState::Removed);
        graph.add_edge("a", "b", EdgeKind::Dynamic).unwrap();
        assert_eq!(graph.query_edge("a", "b"), DependencyState::Dynamic);
        graph.remove_edge("a", "b").unwrap();
        assert_eq!(graph.query_edge("a", "b"), DependencyState::Removed);
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let graph = graph_abc();
        graph.add_edge("a", "b", EdgeKind::Dynamic).unwrap();
        graph.add_edge("b", "c", EdgeKind::Dynamic).unwrap();

        let err = graph.add_edge("c", "a", EdgeKind::Dynamic).unwrap_err();
        assert!(matches!(err, ModuleError::DependencyCycle { .. }));
        assert_eq!(graph.query_edge("c", "a"), DependencyState::Removed);

        // Self-edges are cycles too.
        assert!(graph.add_edge("a", "a", EdgeKind::Dynamic).is_err());
    }

    #[test]
    fn duplicate_edge_is_rejected() {
        let graph = graph_abc();
        graph.add_edge("a", "b", EdgeKind::Dynamic).unwrap();
        assert!(matches!(
            graph.add_edge("a", "b", EdgeKind::Static),
            Err(ModuleError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn static_edges_cannot_be_removed() {
        let graph = graph_abc();
        graph.add_edge("a", "b", EdgeKind::Static).unwrap();
        assert!(matches!(
            graph.remove_edge("a", "b"),
            Err(ModuleError::StaticDependency { .. })
        ));
        assert_eq!(graph.query_edge("a", "b"), DependencyState::Static);
    }

    #[test]
    fn includes_follow_the_same_semantics() {
        let graph = graph_abc();
        graph.add_include("a", "gfx", EdgeKind::Dynamic).unwrap();
        assert_eq!(graph.query_include("a", "gfx"), DependencyState::Dynamic);
        assert!(graph.add_include("a", "gfx", EdgeKind::Dynamic).is_err());
        graph.remove_include("a", "gfx").unwrap();
        assert_eq!(graph.query_include("a", "gfx"), DependencyState::Removed);

        graph.add_include("a", "hal", EdgeKind::Static).unwrap();
        assert!(matches!(
            graph.remove_include("a", "hal"),
            Err(ModuleError::StaticDependency { .. })
        ));
    }

    #[test]
    fn destruction_order_puts_importers_first() {
        let graph = graph_abc();
        // a imports b, b imports c.
        graph.add_edge("a", "b", EdgeKind::Static).unwrap();
        graph.add_edge("b", "c", EdgeKind::Static).unwrap();

        let order = graph.destruction_order(&[
            "c".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn removed_node_releases_its_edges() {
        let graph = graph_abc();
        graph.add_edge("a", "b", EdgeKind::Static).unwrap();
        graph.add_edge("a", "c", EdgeKind::Dynamic).unwrap();
        let mut released = graph.remove_node("a");
        released.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            released,
            vec![
                ("b".to_string(), EdgeKind::Static),
                ("c".to_string(), EdgeKind::Dynamic)
            ]
        );
    }
}
