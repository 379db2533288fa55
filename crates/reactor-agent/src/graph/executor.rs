use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reactor_core::error::{ReactorError, Result};
use reactor_core::{
    AgentEvent, Checkpoint, Checkpointer, EventBus, ExecutionState, SessionId, StateError,
    StateUpdate,
};

use super::builder::GraphDefinition;

/// Default number of node invocations allowed per run.
pub const DEFAULT_STEP_LIMIT: usize = 50;

/// How a call to the executor ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The graph reached a terminal node.
    Completed(ExecutionState),
    /// The session paused before an interrupt point and waits for `resume`.
    Interrupted {
        pending_node: String,
        state: ExecutionState,
    },
}

impl Outcome {
    pub fn state(&self) -> &ExecutionState {
        match self {
            Outcome::Completed(state) => state,
            Outcome::Interrupted { state, .. } => state,
        }
    }

    pub fn into_state(self) -> ExecutionState {
        match self {
            Outcome::Completed(state) => state,
            Outcome::Interrupted { state, .. } => state,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted { .. })
    }

    pub fn pending_node(&self) -> Option<&str> {
        match self {
            Outcome::Interrupted { pending_node, .. } => Some(pending_node),
            Outcome::Completed(_) => None,
        }
    }
}

/// One committed step, handed to the [`StepObserver`].
pub struct StepReport<'a> {
    pub session_id: &'a SessionId,
    pub node: &'a str,
    pub step: u64,
    /// What the node returned (after error conversion).
    pub update: &'a StateUpdate,
    /// The merged state that was checkpointed.
    pub state: &'a ExecutionState,
}

/// Receives every committed step, after its checkpoint is flushed.
pub trait StepObserver: Send + Sync + 'static {
    fn on_step<'a>(&'a self, report: StepReport<'a>) -> BoxFuture<'a, ()>;
}

/// Runs a [`GraphDefinition`] for one session at a time.
///
/// Every committed step is flushed through the [`Checkpointer`] before the
/// next node runs, so a crash loses at most the in-flight node. Nodes that are
/// interrupt points are never run on the first visit: the executor saves a
/// checkpoint with `pending_node` set and returns [`Outcome::Interrupted`].
pub struct GraphExecutor {
    graph: Arc<GraphDefinition>,
    checkpointer: Arc<dyn Checkpointer>,
    step_limit: usize,
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
    observer: Option<Arc<dyn StepObserver>>,
}

impl GraphExecutor {
    pub fn new(graph: Arc<GraphDefinition>, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            graph,
            checkpointer,
            step_limit: DEFAULT_STEP_LIMIT,
            cancel: CancellationToken::new(),
            events: None,
            observer: None,
        }
    }

    /// Maximum node invocations per `run`/`resume`/`recover`/`continue_with` call.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Token polled between steps. Cancelling it also abandons an in-flight node.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn graph(&self) -> &Arc<GraphDefinition> {
        &self.graph
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a session at the entry node. Any previous checkpoint for the
    /// session id is replaced.
    pub async fn run(&self, session_id: &SessionId, initial: ExecutionState) -> Result<Outcome> {
        let entry = self.graph.entry().to_string();
        info!(session = %session_id, graph = %self.graph.name(), "Starting graph run");

        let mut cp = Checkpoint::new(session_id.clone(), initial.clone());
        cp.cursor = Some(entry.clone());
        self.checkpointer.save(cp).await?;

        self.drive(session_id, initial, entry, 0, None).await
    }

    /// Continue a session paused at an interrupt point.
    ///
    /// `value` is stored in `ExecutionState::resume_value` for the pending node
    /// to interpret; it is cleared once that node has run.
    pub async fn resume(&self, session_id: &SessionId, value: serde_json::Value) -> Result<Outcome> {
        let cp = self.load(session_id).await?;
        let pending = cp
            .pending_node
            .clone()
            .ok_or_else(|| ReactorError::NotInterrupted(session_id.to_string()))?;

        let mut state = cp.state;
        state.resume_value = Some(value);

        let mut next = Checkpoint::new(session_id.clone(), state.clone());
        next.cursor = Some(pending.clone());
        next.step = cp.step;
        self.checkpointer.save(next).await?;

        info!(session = %session_id, node = %pending, "Resuming session");
        self.publish(AgentEvent::Resumed {
            session_id: session_id.clone(),
            node: pending.clone(),
        });

        self.drive(session_id, state, pending.clone(), cp.step, Some(pending))
            .await
    }

    /// Continue a session from its last committed checkpoint, e.g. after a
    /// process restart. A paused session stays paused; a finished one is
    /// reported as completed without running anything.
    pub async fn recover(&self, session_id: &SessionId) -> Result<Outcome> {
        let cp = self.load(session_id).await?;

        if let Some(pending) = cp.pending_node {
            return Ok(Outcome::Interrupted {
                pending_node: pending,
                state: cp.state,
            });
        }

        match cp.cursor {
            None => Ok(Outcome::Completed(cp.state)),
            Some(cursor) => {
                info!(session = %session_id, node = %cursor, step = cp.step, "Recovering session");
                // A stored resume value belongs to the node the session was resumed into.
                let resumed = cp.state.resume_value.as_ref().map(|_| cursor.clone());
                self.drive(session_id, cp.state, cursor, cp.step, resumed)
                    .await
            }
        }
    }

    /// Feed an incremental update into a finished session and run the graph
    /// again from its entry node, keeping the transcript.
    pub async fn continue_with(&self, session_id: &SessionId, update: StateUpdate) -> Result<Outcome> {
        let cp = self.load(session_id).await?;
        if !cp.is_terminal() {
            return Err(ReactorError::SessionNotTerminal(session_id.to_string()));
        }

        let mut state = cp.state;
        state.apply(update);

        let entry = self.graph.entry().to_string();
        let mut next = Checkpoint::new(session_id.clone(), state.clone());
        next.cursor = Some(entry.clone());
        next.step = cp.step;
        self.checkpointer.save(next).await?;

        info!(session = %session_id, "Continuing finished session");
        self.drive(session_id, state, entry, cp.step, None).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Checkpoint> {
        self.checkpointer
            .load(session_id)
            .await?
            .ok_or_else(|| ReactorError::NoCheckpoint(session_id.to_string()))
    }

    /// The step loop. `resumed` names the interrupt point being entered with a
    /// resume value, which must run instead of pausing again.
    async fn drive(
        &self,
        session_id: &SessionId,
        mut state: ExecutionState,
        start: String,
        mut step: u64,
        mut resumed: Option<String>,
    ) -> Result<Outcome> {
        let mut current = start;
        let mut invocations = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                info!(session = %session_id, node = %current, "Execution cancelled");
                return Err(ReactorError::Cancelled);
            }

            let resuming_here = resumed.as_deref() == Some(current.as_str());
            if self.graph.is_interrupt_point(&current) && !resuming_here {
                let mut cp = Checkpoint::new(session_id.clone(), state.clone());
                cp.pending_node = Some(current.clone());
                cp.cursor = Some(current.clone());
                cp.step = step;
                self.checkpointer.save(cp).await?;

                info!(session = %session_id, node = %current, "Interrupted before node");
                self.publish(AgentEvent::Interrupted {
                    session_id: session_id.clone(),
                    pending_node: current.clone(),
                });
                return Ok(Outcome::Interrupted {
                    pending_node: current,
                    state,
                });
            }

            if invocations >= self.step_limit {
                warn!(
                    session = %session_id,
                    node = %current,
                    limit = self.step_limit,
                    "Step limit exceeded"
                );
                return Err(ReactorError::StepLimitExceeded(self.step_limit));
            }

            let node = self
                .graph
                .node(&current)
                .ok_or_else(|| ReactorError::UnknownNode(current.clone()))?;

            debug!(session = %session_id, node = %current, step, "Running node");
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(session = %session_id, node = %current, "Execution cancelled mid-node");
                    return Err(ReactorError::Cancelled);
                }
                result = node.run(&state) => result,
            };
            invocations += 1;
            step += 1;

            let update = match result {
                Ok(update) => update,
                Err(e) => {
                    warn!(session = %session_id, node = %current, error = %e, "Node failed");
                    StateUpdate::new().error(StateError {
                        node: current.clone(),
                        message: e.message,
                        retryable: e.retryable,
                    })
                }
            };

            state.apply(update.clone());
            if resuming_here {
                state.resume_value = None;
                resumed = None;
            }

            let next = match self.graph.edge(&current) {
                Some(edge) => edge.next(&current, &state).map_err(|e| {
                    warn!(session = %session_id, node = %current, error = %e, "Routing failed");
                    e
                })?,
                None => None,
            };

            let mut cp = Checkpoint::new(session_id.clone(), state.clone());
            cp.cursor = next.clone();
            cp.step = step;
            self.checkpointer.save(cp).await?;

            self.publish(AgentEvent::StepCompleted {
                session_id: session_id.clone(),
                node: current.clone(),
                step,
            });
            if let Some(observer) = &self.observer {
                observer
                    .on_step(StepReport {
                        session_id,
                        node: &current,
                        step,
                        update: &update,
                        state: &state,
                    })
                    .await;
            }

            match next {
                Some(next) => {
                    debug!(session = %session_id, from = %current, to = %next, "Following edge");
                    current = next;
                }
                None => {
                    info!(session = %session_id, node = %current, step, "Graph completed");
                    return Ok(Outcome::Completed(state));
                }
            }
        }
    }

    fn publish(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::graph::{from_fn, GraphBuilder, END};
    use reactor_core::{ChatMessage, NodeError};
    use serde_json::json;

    fn executor(graph: GraphDefinition) -> (GraphExecutor, Arc<MemoryCheckpointer>) {
        let store = Arc::new(MemoryCheckpointer::new());
        (GraphExecutor::new(Arc::new(graph), store.clone()), store)
    }

    #[tokio::test]
    async fn test_single_node_graph() {
        let graph = GraphBuilder::new("one")
            .node("a", from_fn(|_| Ok(StateUpdate::new().set("done", json!(true)))))
            .entry("a")
            .build()
            .unwrap();
        let (exec, store) = executor(graph);
        let sid = SessionId::from_string("s1");

        let outcome = exec.run(&sid, ExecutionState::default()).await.unwrap();
        assert!(!outcome.is_interrupted());
        assert_eq!(outcome.state().get("done"), Some(&json!(true)));

        let cp = store.load(&sid).await.unwrap().unwrap();
        assert!(cp.is_terminal());
        assert_eq!(cp.step, 1);
    }

    #[tokio::test]
    async fn test_node_error_written_to_state() {
        let graph = GraphBuilder::new("err")
            .node("a", from_fn(|_| Err(NodeError::retryable("network down"))))
            .node("b", from_fn(|s| {
                let seen = s.error.as_ref().map(|e| e.node.clone()).unwrap_or_default();
                Ok(StateUpdate::new().set("saw_error_from", json!(seen)))
            }))
            .entry("a")
            .edge("a", "b")
            .build()
            .unwrap();
        let (exec, _) = executor(graph);

        let state = exec
            .run(&SessionId::new(), ExecutionState::default())
            .await
            .unwrap()
            .into_state();
        assert_eq!(state.get_str("saw_error_from"), Some("a"));
        let err = state.error.unwrap();
        assert_eq!(err.message, "network down");
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_interrupt_at_entry_then_resume() {
        let graph = GraphBuilder::new("gate")
            .node("approve", from_fn(|s| {
                Ok(StateUpdate::new().approved(s.resume_text().as_deref() == Some("yes")))
            }))
            .entry("approve")
            .edge("approve", END)
            .interrupt_before("approve")
            .build()
            .unwrap();
        let (exec, store) = executor(graph);
        let sid = SessionId::new();

        let outcome = exec.run(&sid, ExecutionState::default()).await.unwrap();
        assert_eq!(outcome.pending_node(), Some("approve"));
        assert!(store.load(&sid).await.unwrap().unwrap().is_paused());

        let state = exec.resume(&sid, json!("yes")).await.unwrap().into_state();
        assert!(state.approved);
        assert!(state.resume_value.is_none());
    }

    #[tokio::test]
    async fn test_resume_requires_pause() {
        let graph = GraphBuilder::new("g")
            .node("a", from_fn(|_| Ok(StateUpdate::new())))
            .entry("a")
            .build()
            .unwrap();
        let (exec, _) = executor(graph);
        let sid = SessionId::new();

        let err = exec.resume(&sid, json!("x")).await.unwrap_err();
        assert!(matches!(err, ReactorError::NoCheckpoint(_)));

        exec.run(&sid, ExecutionState::default()).await.unwrap();
        let err = exec.resume(&sid, json!("x")).await.unwrap_err();
        assert!(matches!(err, ReactorError::NotInterrupted(_)));
    }

    #[tokio::test]
    async fn test_continue_with_appends_and_reruns() {
        let graph = GraphBuilder::new("echo")
            .node("reply", from_fn(|s| {
                Ok(StateUpdate::new().message(ChatMessage::assistant(format!("re: {}", s.user_input))))
            }))
            .entry("reply")
            .build()
            .unwrap();
        let (exec, _) = executor(graph);
        let sid = SessionId::new();

        exec.run(&sid, ExecutionState::for_task("one")).await.unwrap();
        let state = exec
            .continue_with(
                &sid,
                StateUpdate::new()
                    .message(ChatMessage::user("two"))
                    .user_input("two"),
            )
            .await
            .unwrap()
            .into_state();

        let texts: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "re: one", "two", "re: two"]);
    }

    #[tokio::test]
    async fn test_continue_with_rejects_paused_session() {
        let graph = GraphBuilder::new("gate")
            .node("a", from_fn(|_| Ok(StateUpdate::new())))
            .entry("a")
            .interrupt_before("a")
            .build()
            .unwrap();
        let (exec, _) = executor(graph);
        let sid = SessionId::new();

        exec.run(&sid, ExecutionState::default()).await.unwrap();
        let err = exec.continue_with(&sid, StateUpdate::new()).await.unwrap_err();
        assert!(matches!(err, ReactorError::SessionNotTerminal(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let graph = GraphBuilder::new("g")
            .node("a", from_fn(|_| Ok(StateUpdate::new())))
            .entry("a")
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = GraphExecutor::new(Arc::new(graph), Arc::new(MemoryCheckpointer::new()))
            .with_cancel(cancel);

        let err = exec.run(&SessionId::new(), ExecutionState::default()).await.unwrap_err();
        assert!(matches!(err, ReactorError::Cancelled));
    }

    #[tokio::test]
    async fn test_step_events_published() {
        let graph = GraphBuilder::new("two")
            .node("a", from_fn(|_| Ok(StateUpdate::new())))
            .node("b", from_fn(|_| Ok(StateUpdate::new())))
            .entry("a")
            .edge("a", "b")
            .build()
            .unwrap();
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let (exec, _) = executor(graph);
        let exec = exec.with_events(bus);

        exec.run(&SessionId::new(), ExecutionState::default()).await.unwrap();

        let mut nodes = vec![];
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::StepCompleted { node, step, .. } = event {
                nodes.push((node, step));
            }
        }
        assert_eq!(nodes, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }
}
