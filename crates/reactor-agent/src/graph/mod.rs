//! Graph execution engine with checkpointing and interrupt points.
//!
//! A workflow is a set of named [`Node`](reactor_core::Node)s connected by
//! edges. Each node returns a partial [`StateUpdate`](reactor_core::StateUpdate)
//! that the executor merges into the session state. Static edges always lead to
//! the same target; conditional edges ask a [`Router`] for a route name and map
//! it to a declared target.
//!
//! The [`GraphExecutor`] walks the graph from the entry node, flushing a
//! checkpoint after every step. Nodes declared as interrupt points pause the
//! session before they run; `resume` injects an external value and continues.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod node;

pub use builder::{GraphBuilder, GraphDefinition};
pub use edge::{Edge, Router, END};
pub use executor::{GraphExecutor, Outcome, StepObserver, StepReport, DEFAULT_STEP_LIMIT};
pub use node::{from_async, from_fn, AsyncFnNode, FnNode};
