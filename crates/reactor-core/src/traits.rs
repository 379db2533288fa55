use futures::future::BoxFuture;

use crate::error::NodeError;
use crate::state::{ExecutionState, StateUpdate};
use crate::types::ProgressEvent;

/// A single step of a workflow graph.
///
/// Receives a snapshot of the session state and returns only the fields it
/// changed. External work (LLM calls, shell commands, file edits) goes through
/// collaborators injected into the node, never through globals.
pub trait Node: Send + Sync + 'static {
    fn run<'a>(&'a self, state: &'a ExecutionState)
        -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>>;
}

/// Subscriber for instance progress.
///
/// Failures are reported back to the emitter and never abort the execution
/// or the other subscribers.
pub trait ProgressCallback: Send + Sync + 'static {
    fn on_progress<'a>(
        &'a self,
        event: &'a ProgressEvent,
    ) -> BoxFuture<'a, std::result::Result<(), String>>;
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressEvent) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    fn on_progress<'a>(
        &'a self,
        event: &'a ProgressEvent,
    ) -> BoxFuture<'a, std::result::Result<(), String>> {
        let result = self(event);
        Box::pin(async move { result })
    }
}
