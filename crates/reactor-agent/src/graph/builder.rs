use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use reactor_core::error::{ReactorError, Result};
use reactor_core::Node;

use super::edge::{Edge, Router, END};

/// Immutable workflow definition.
///
/// Holds no per-session data, so one `Arc<GraphDefinition>` is shared by every
/// session that runs it.
pub struct GraphDefinition {
    name: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
    interrupt_before: HashSet<String>,
}

impl GraphDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    /// Outgoing edge of a node. `None` means the node is terminal.
    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    pub fn is_interrupt_point(&self, name: &str) -> bool {
        self.interrupt_before.contains(name)
    }

    /// Node names, sorted.
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for GraphDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDefinition")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.node_names())
            .field("edges", &self.edges)
            .field("interrupt_before", &self.interrupt_before)
            .finish()
    }
}

/// Builder for [`GraphDefinition`]. Problems are collected and reported by `build`.
pub struct GraphBuilder {
    name: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
    interrupt_before: HashSet<String>,
    problems: Vec<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            interrupt_before: HashSet::new(),
            problems: vec![],
        }
    }

    /// Add a named node.
    pub fn node(self, name: impl Into<String>, node: impl Node) -> Self {
        self.shared_node(name, Arc::new(node))
    }

    /// Add a named node that is already behind an `Arc`.
    pub fn shared_node(mut self, name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        let name = name.into();
        if name == END {
            self.problems.push(format!("'{}' is reserved", END));
        } else if self.nodes.insert(name.clone(), node).is_some() {
            self.problems.push(format!("duplicate node '{}'", name));
        }
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Static edge `from -> to`. `to` may be [`END`].
    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_edge(from.into(), Edge::Static(to.into()))
    }

    /// Conditional edge: `router` returns one of the route names in `routes`,
    /// each mapped to a target node (or [`END`]).
    pub fn conditional<I, K, V>(self, from: impl Into<String>, router: impl Router, routes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let routes: BTreeMap<String, String> = routes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.add_edge(
            from.into(),
            Edge::Conditional {
                router: Arc::new(router),
                routes,
            },
        )
    }

    /// Pause the session before `name` runs.
    pub fn interrupt_before(mut self, name: impl Into<String>) -> Self {
        self.interrupt_before.insert(name.into());
        self
    }

    fn add_edge(mut self, from: String, edge: Edge) -> Self {
        if self.edges.insert(from.clone(), edge).is_some() {
            self.problems
                .push(format!("node '{}' has more than one outgoing edge", from));
        }
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<GraphDefinition> {
        if let Some(problem) = self.problems.into_iter().next() {
            return Err(ReactorError::InvalidGraph(problem));
        }
        let entry = self
            .entry
            .ok_or_else(|| ReactorError::InvalidGraph("no entry node".into()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(ReactorError::UnknownNode(entry));
        }

        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(ReactorError::UnknownNode(from.clone()));
            }
            if let Edge::Conditional { routes, .. } = edge {
                if routes.is_empty() {
                    return Err(ReactorError::InvalidGraph(format!(
                        "conditional edge from '{}' declares no routes",
                        from
                    )));
                }
            }
            for target in edge.targets() {
                if !self.nodes.contains_key(target) {
                    return Err(ReactorError::UnknownNode(target.to_string()));
                }
            }
        }

        for name in &self.interrupt_before {
            if !self.nodes.contains_key(name) {
                return Err(ReactorError::UnknownNode(name.clone()));
            }
        }

        Ok(GraphDefinition {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            entry,
            interrupt_before: self.interrupt_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::from_fn;
    use reactor_core::{ExecutionState, StateUpdate};

    fn noop() -> impl Node {
        from_fn(|_| Ok(StateUpdate::new()))
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = GraphBuilder::new("linear")
            .node("a", noop())
            .node("b", noop())
            .entry("a")
            .edge("a", "b")
            .edge("b", END)
            .interrupt_before("b")
            .build()
            .unwrap();

        assert_eq!(graph.name(), "linear");
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.node_names(), vec!["a", "b"]);
        assert!(graph.is_interrupt_point("b"));
        assert!(!graph.is_interrupt_point("a"));
        assert!(graph.edge("a").is_some());
    }

    #[test]
    fn test_missing_entry() {
        let err = GraphBuilder::new("g").node("a", noop()).build().unwrap_err();
        assert!(matches!(err, ReactorError::InvalidGraph(_)));
    }

    #[test]
    fn test_unknown_edge_target() {
        let err = GraphBuilder::new("g")
            .node("a", noop())
            .entry("a")
            .edge("a", "ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::UnknownNode(n) if n == "ghost"));
    }

    #[test]
    fn test_unknown_route_target() {
        let err = GraphBuilder::new("g")
            .node("a", noop())
            .entry("a")
            .conditional("a", |_: &ExecutionState| "x", [("x", "nowhere")])
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::UnknownNode(n) if n == "nowhere"));
    }

    #[test]
    fn test_duplicate_node_and_edge() {
        let err = GraphBuilder::new("g")
            .node("a", noop())
            .node("a", noop())
            .entry("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::InvalidGraph(_)));

        let err = GraphBuilder::new("g")
            .node("a", noop())
            .node("b", noop())
            .entry("a")
            .edge("a", "b")
            .edge("a", END)
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::InvalidGraph(_)));
    }

    #[test]
    fn test_reserved_end_name() {
        let err = GraphBuilder::new("g")
            .node(END, noop())
            .entry(END)
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::InvalidGraph(_)));
    }

    #[test]
    fn test_unknown_interrupt_point() {
        let err = GraphBuilder::new("g")
            .node("a", noop())
            .entry("a")
            .interrupt_before("approve")
            .build()
            .unwrap_err();
        assert!(matches!(err, ReactorError::UnknownNode(n) if n == "approve"));
    }
}
