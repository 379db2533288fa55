use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use reactor_core::error::{ReactorError, Result};
use reactor_core::ExecutionState;

/// Pseudo-node marking the end of the graph.
pub const END: &str = "__end__";

/// Routing function for a conditional edge.
///
/// Must be pure: the same state always yields the same route name.
pub trait Router: Send + Sync + 'static {
    fn route(&self, state: &ExecutionState) -> String;
}

impl<F, R> Router for F
where
    F: Fn(&ExecutionState) -> R + Send + Sync + 'static,
    R: Into<String>,
{
    fn route(&self, state: &ExecutionState) -> String {
        self(state).into()
    }
}

/// The single outgoing edge of a node.
#[derive(Clone)]
pub enum Edge {
    /// Always go to the target (or [`END`]).
    Static(String),
    /// Ask the router for a route name and map it to a target.
    Conditional {
        router: Arc<dyn Router>,
        /// Route name -> target node (or [`END`]).
        routes: BTreeMap<String, String>,
    },
}

impl Edge {
    /// Resolve the next node after `from`, given the merged state.
    ///
    /// `Ok(None)` means the graph is terminal. A route name the edge does not
    /// declare is a [`ReactorError::Routing`].
    pub fn next(&self, from: &str, state: &ExecutionState) -> Result<Option<String>> {
        let target = match self {
            Edge::Static(target) => target.clone(),
            Edge::Conditional { router, routes } => {
                let route = router.route(state);
                match routes.get(&route) {
                    Some(target) => target.clone(),
                    None => {
                        return Err(ReactorError::Routing {
                            node: from.to_string(),
                            route,
                        })
                    }
                }
            }
        };
        Ok(if target == END { None } else { Some(target) })
    }

    /// Every node this edge can lead to, [`END`] excluded.
    pub fn targets(&self) -> Vec<&str> {
        let all: Vec<&str> = match self {
            Edge::Static(target) => vec![target.as_str()],
            Edge::Conditional { routes, .. } => routes.values().map(String::as_str).collect(),
        };
        all.into_iter().filter(|t| *t != END).collect()
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Static(target) => f.debug_tuple("Static").field(target).finish(),
            Edge::Conditional { routes, .. } => f
                .debug_struct("Conditional")
                .field("routes", routes)
                .finish_non_exhaustive(),
        }
    }
}
