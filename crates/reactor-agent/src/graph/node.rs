use std::future::Future;

use futures::future::BoxFuture;

use reactor_core::{ExecutionState, Node, NodeError, StateUpdate};

/// Node backed by a synchronous closure.
pub struct FnNode<F> {
    f: F,
}

/// Wrap a synchronous closure as a [`Node`].
pub fn from_fn<F>(f: F) -> FnNode<F>
where
    F: Fn(&ExecutionState) -> Result<StateUpdate, NodeError> + Send + Sync + 'static,
{
    FnNode { f }
}

impl<F> Node for FnNode<F>
where
    F: Fn(&ExecutionState) -> Result<StateUpdate, NodeError> + Send + Sync + 'static,
{
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, Result<StateUpdate, NodeError>> {
        let result = (self.f)(state);
        Box::pin(async move { result })
    }
}

/// Node backed by an async closure. The closure receives its own copy of the state.
pub struct AsyncFnNode<F> {
    f: F,
}

/// Wrap an async closure as a [`Node`].
pub fn from_async<F, Fut>(f: F) -> AsyncFnNode<F>
where
    F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    AsyncFnNode { f }
}

impl<F, Fut> Node for AsyncFnNode<F>
where
    F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, Result<StateUpdate, NodeError>> {
        Box::pin((self.f)(state.clone()))
    }
}
