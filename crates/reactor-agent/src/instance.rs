use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reactor_core::error::{ReactorError, Result};
use reactor_core::{
    AgentEvent, ChatMessage, Checkpointer, EventBus, ExecutionState, Lifecycle, ProgressCallback,
    ProgressEvent, Role, SessionId, StateUpdate,
};

use crate::graph::{GraphDefinition, GraphExecutor, Outcome, StepObserver, StepReport};

const PROGRESS_PREVIEW_CHARS: usize = 200;

/// A progress callback that failed or panicked.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackFailure {
    /// Position of the callback in registration order.
    pub index: usize,
    pub error: String,
}

/// What `send_message` did with the text.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A finished session was re-entered with the message as new input.
    Continued,
    /// A paused session was resumed with the message as the external value.
    Resumed,
    /// Nothing happened; the instance is in a state that takes no messages.
    Ignored { lifecycle: Lifecycle },
}

/// Snapshot of an instance for listings.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub agent_name: String,
    pub task: String,
    pub skills: Vec<String>,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pending_node: Option<String>,
    pub latest_progress: String,
    pub error: Option<String>,
}

/// Settings for a new instance.
#[derive(Clone)]
pub struct InstanceConfig {
    pub agent_name: String,
    pub skills: Vec<String>,
    pub step_limit: usize,
    pub stop_grace: Duration,
    /// Starting state. Defaults to `ExecutionState::for_task(task)`.
    pub initial_state: Option<ExecutionState>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            agent_name: "default".into(),
            skills: vec![],
            step_limit: crate::graph::DEFAULT_STEP_LIMIT,
            stop_grace: Duration::from_millis(2_000),
            initial_state: None,
        }
    }
}

struct InstanceInner {
    lifecycle: Lifecycle,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    pending_node: Option<String>,
    error: Option<String>,
    handle: Option<JoinHandle<()>>,
}

/// Fans committed steps out to progress callbacks and keeps the output log.
struct ProgressRelay {
    instance_id: String,
    callbacks: RwLock<Vec<Arc<dyn ProgressCallback>>>,
    outputs: Mutex<Vec<String>>,
    failures: Mutex<Vec<CallbackFailure>>,
    cancel: CancellationToken,
}

impl ProgressRelay {
    fn record_output(&self, text: &str) {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.push(text.to_string());
        }
    }

    async fn emit(&self, event: &ProgressEvent) -> Vec<CallbackFailure> {
        let callbacks: Vec<Arc<dyn ProgressCallback>> = match self.callbacks.read() {
            Ok(cbs) => cbs.clone(),
            Err(_) => return vec![],
        };

        let mut failures = Vec::new();
        for (index, callback) in callbacks.iter().enumerate() {
            let call = AssertUnwindSafe(async { callback.on_progress(event).await }).catch_unwind();
            let error = match call.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => panic_message(panic),
            };
            warn!(
                instance = %self.instance_id,
                callback = index,
                error = %error,
                "Progress callback failed"
            );
            failures.push(CallbackFailure { index, error });
        }
        failures
    }
}

impl StepObserver for ProgressRelay {
    fn on_step<'a>(&'a self, report: StepReport<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(message) = report.update.notable_messages().last().cloned() else {
                return;
            };
            if message.role == Role::Assistant {
                self.record_output(&message.content);
            }

            let event = ProgressEvent {
                instance_id: self.instance_id.clone(),
                session_id: report.session_id.clone(),
                node: report.node.to_string(),
                message,
                timestamp: Utc::now(),
            };
            let failures = self.emit(&event).await;
            if !failures.is_empty() {
                if let Ok(mut all) = self.failures.lock() {
                    all.extend(failures);
                }
            }
        })
    }
}

fn finish(inner: &mut InstanceInner) {
    inner.completed_at = Some(Utc::now());
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

enum Work {
    Run(ExecutionState),
    Resume(serde_json::Value),
    Continue(StateUpdate),
}

/// One session running in its own background task.
///
/// Lifecycle: `initializing -> running -> {completed | paused | error | stopped}`,
/// `paused -> running` on resume, `completed -> running` on a follow-up
/// message. Every change goes through [`AgentInstance::transition`].
pub struct AgentInstance {
    id: String,
    session_id: SessionId,
    agent_name: String,
    task: String,
    skills: Vec<String>,
    created_at: DateTime<Utc>,
    executor: GraphExecutor,
    relay: Arc<ProgressRelay>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    stop_grace: Duration,
    initial_state: Mutex<Option<ExecutionState>>,
    inner: Mutex<InstanceInner>,
    lifecycle_tx: watch::Sender<Lifecycle>,
}

impl AgentInstance {
    pub fn new(
        graph: Arc<GraphDefinition>,
        checkpointer: Arc<dyn Checkpointer>,
        events: Arc<EventBus>,
        task: impl Into<String>,
        config: InstanceConfig,
    ) -> Arc<Self> {
        let session_id = SessionId::new();
        let id = session_id.to_string();
        let task = task.into();
        let cancel = CancellationToken::new();

        let relay = Arc::new(ProgressRelay {
            instance_id: id.clone(),
            callbacks: RwLock::new(vec![]),
            outputs: Mutex::new(vec![]),
            failures: Mutex::new(vec![]),
            cancel: cancel.clone(),
        });
        let executor = GraphExecutor::new(graph, checkpointer)
            .with_step_limit(config.step_limit)
            .with_cancel(cancel.clone())
            .with_events(events.clone())
            .with_observer(relay.clone());

        let initial = config
            .initial_state
            .unwrap_or_else(|| ExecutionState::for_task(task.clone()));
        let (lifecycle_tx, _) = watch::channel(Lifecycle::Initializing);

        Arc::new(Self {
            id,
            session_id,
            agent_name: config.agent_name,
            task,
            skills: config.skills,
            created_at: Utc::now(),
            executor,
            relay,
            events,
            cancel,
            stop_grace: config.stop_grace,
            initial_state: Mutex::new(Some(initial)),
            inner: Mutex::new(InstanceInner {
                lifecycle: Lifecycle::Initializing,
                started_at: None,
                completed_at: None,
                pending_node: None,
                error: None,
                handle: None,
            }),
            lifecycle_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn skills(&self) -> &[String] {
        &self.skills
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner().lifecycle
    }

    pub fn error(&self) -> Option<String> {
        self.inner().error.clone()
    }

    /// The interrupt point a paused instance waits at.
    pub fn pending_node(&self) -> Option<String> {
        self.inner().pending_node.clone()
    }

    /// Register a progress subscriber. Applies to steps committed from now on.
    pub fn on_progress(&self, callback: Arc<dyn ProgressCallback>) {
        if let Ok(mut cbs) = self.relay.callbacks.write() {
            cbs.push(callback);
        }
    }

    /// Callback failures recorded so far.
    pub fn callback_failures(&self) -> Vec<CallbackFailure> {
        self.relay
            .failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Deliver one progress event to every subscriber, isolating failures.
    pub async fn emit_progress(&self, node: &str, message: ChatMessage) -> Vec<CallbackFailure> {
        let event = ProgressEvent {
            instance_id: self.id.clone(),
            session_id: self.session_id.clone(),
            node: node.to_string(),
            message,
            timestamp: Utc::now(),
        };
        self.relay.emit(&event).await
    }

    /// Last output, cut to 200 characters.
    pub fn latest_progress(&self) -> String {
        let outputs = match self.relay.outputs.lock() {
            Ok(o) => o,
            Err(_) => return "Starting...".to_string(),
        };
        match outputs.last() {
            None => "Starting...".to_string(),
            Some(last) => match last.char_indices().nth(PROGRESS_PREVIEW_CHARS) {
                Some((idx, _)) => format!("{}...", &last[..idx]),
                None => last.clone(),
            },
        }
    }

    /// Full last output.
    pub fn final_output(&self) -> String {
        self.relay
            .outputs
            .lock()
            .ok()
            .and_then(|o| o.last().cloned())
            .unwrap_or_else(|| "No output produced".to_string())
    }

    /// Every assistant output captured so far, oldest first.
    pub fn outputs(&self) -> Vec<String> {
        self.relay
            .outputs
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    /// The committed transcript of the session.
    pub async fn history(&self) -> Result<Vec<ChatMessage>> {
        let cp = self.executor.checkpointer().load(&self.session_id).await?;
        Ok(cp.map(|c| c.state.messages).unwrap_or_default())
    }

    /// The committed state of the session, if any step has been flushed.
    pub async fn state(&self) -> Result<Option<ExecutionState>> {
        let cp = self.executor.checkpointer().load(&self.session_id).await?;
        Ok(cp.map(|c| c.state))
    }

    pub fn summary(&self) -> InstanceSummary {
        let inner = self.inner();
        InstanceSummary {
            id: self.id.clone(),
            agent_name: self.agent_name.clone(),
            task: self.task.clone(),
            skills: self.skills.clone(),
            lifecycle: inner.lifecycle,
            created_at: self.created_at,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            pending_node: inner.pending_node.clone(),
            latest_progress: self.latest_progress(),
            error: inner.error.clone(),
        }
    }

    /// Launch the session in a background task. Returns immediately.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let initial = self
            .initial_state
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .ok_or_else(|| self.invalid(Lifecycle::Running))?;
        self.transition_with(Lifecycle::Running, |inner| inner.started_at = Some(Utc::now()))?;
        info!(instance = %self.id, agent = %self.agent_name, "Agent instance started");
        self.launch(Work::Run(initial));
        Ok(())
    }

    /// Resume a paused instance with an external value.
    pub fn resume(self: &Arc<Self>, value: serde_json::Value) -> Result<()> {
        if self.lifecycle() != Lifecycle::Paused {
            return Err(ReactorError::NotInterrupted(self.id.clone()));
        }
        self.transition_with(Lifecycle::Running, |inner| inner.pending_node = None)?;
        self.launch(Work::Resume(value));
        Ok(())
    }

    /// Deliver a user message.
    ///
    /// A completed session is re-entered with the message as new input, a
    /// paused one is resumed with it. Running, errored and stopped instances
    /// take no messages; that is reported, not swallowed.
    pub fn send_message(self: &Arc<Self>, text: &str) -> Result<Delivery> {
        match self.lifecycle() {
            Lifecycle::Completed => {
                self.transition_with(Lifecycle::Running, |inner| {
                    inner.completed_at = None;
                    inner.error = None;
                })?;
                let update = StateUpdate::new()
                    .message(ChatMessage::user(text))
                    .user_input(text)
                    .clear_error();
                self.launch(Work::Continue(update));
                Ok(Delivery::Continued)
            }
            Lifecycle::Paused => {
                self.resume(serde_json::Value::String(text.to_string()))?;
                Ok(Delivery::Resumed)
            }
            lifecycle => {
                warn!(instance = %self.id, %lifecycle, "Message ignored");
                Ok(Delivery::Ignored { lifecycle })
            }
        }
    }

    /// Stop the instance: signal cancellation, wait up to the grace period for
    /// the task to notice, then abort it. Returns whether the instance was
    /// stopped by this call.
    pub async fn stop(&self) -> Result<bool> {
        let lifecycle = self.lifecycle();
        match lifecycle {
            Lifecycle::Initializing | Lifecycle::Paused => {
                self.cancel.cancel();
                self.transition_with(Lifecycle::Stopped, finish)?;
                return Ok(true);
            }
            Lifecycle::Running => {}
            _ => return Ok(false),
        }

        info!(instance = %self.id, "Stopping agent instance");
        self.cancel.cancel();

        let handle = self.inner().handle.take();
        match handle {
            Some(mut handle) => {
                if tokio::time::timeout(self.stop_grace, &mut handle).await.is_err() {
                    warn!(instance = %self.id, "Task ignored cancellation, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
            // Another stop owns the handle; wait for it to settle the instance.
            None => {
                let _ = tokio::time::timeout(self.stop_grace * 2, self.wait()).await;
            }
        }

        // The task normally settles itself; an aborted one cannot.
        if self.lifecycle() == Lifecycle::Running {
            self.transition_with(Lifecycle::Stopped, finish)?;
        }
        Ok(self.lifecycle() == Lifecycle::Stopped)
    }

    /// Wait until the instance is not running anymore and return its lifecycle.
    pub async fn wait(&self) -> Lifecycle {
        let mut rx = self.lifecycle_tx.subscribe();
        let settled = rx
            .wait_for(|l| !matches!(l, Lifecycle::Initializing | Lifecycle::Running))
            .await
            .map(|l| *l);
        settled.unwrap_or_else(|_| self.lifecycle())
    }

    fn launch(self: &Arc<Self>, work: Work) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.drive(work).await });
        self.inner().handle = Some(handle);
    }

    async fn drive(self: Arc<Self>, work: Work) {
        let sid = &self.session_id;
        let result = match work {
            Work::Run(state) => self.executor.run(sid, state).await,
            Work::Resume(value) => self.executor.resume(sid, value).await,
            Work::Continue(update) => self.executor.continue_with(sid, update).await,
        };
        self.settle(result);
    }

    /// Map the executor's result onto the lifecycle.
    fn settle(&self, result: Result<Outcome>) {
        if self.lifecycle() != Lifecycle::Running {
            return;
        }
        if self.cancel.is_cancelled() {
            self.settle_to(Lifecycle::Stopped, None, None);
            return;
        }
        match result {
            Ok(Outcome::Completed(state)) => match state.error {
                Some(err) => {
                    error!(instance = %self.id, node = %err.node, error = %err.message, "Session ended with error");
                    self.settle_to(Lifecycle::Error, Some(err.message), None);
                }
                None => {
                    info!(instance = %self.id, "Agent instance completed");
                    self.settle_to(Lifecycle::Completed, None, None);
                }
            },
            Ok(Outcome::Interrupted { pending_node, .. }) => {
                info!(instance = %self.id, node = %pending_node, "Agent instance paused");
                self.settle_to(Lifecycle::Paused, None, Some(pending_node));
            }
            Err(ReactorError::Cancelled) => self.settle_to(Lifecycle::Stopped, None, None),
            Err(e) => {
                error!(instance = %self.id, error = %e, "Agent instance failed");
                self.settle_to(Lifecycle::Error, Some(e.to_string()), None);
            }
        }
    }

    fn settle_to(&self, to: Lifecycle, error: Option<String>, pending: Option<String>) {
        let settled = self.transition_with(to, |inner| {
            inner.error = error;
            inner.pending_node = pending;
            if to.is_finished() {
                finish(inner);
            }
        });
        if let Err(e) = settled {
            warn!(instance = %self.id, error = %e, "Could not settle instance");
        }
    }

    /// The single place lifecycle changes happen. `edit` runs under the same
    /// lock as the state change, before waiters are woken.
    fn transition_with(&self, to: Lifecycle, edit: impl FnOnce(&mut InstanceInner)) -> Result<()> {
        let from = {
            let mut inner = self.inner();
            let from = inner.lifecycle;
            if !from.can_transition_to(to) {
                return Err(self.invalid_from(from, to));
            }
            inner.lifecycle = to;
            edit(&mut *inner);
            from
        };
        self.lifecycle_tx.send_replace(to);
        self.events.publish(AgentEvent::LifecycleChanged {
            instance_id: self.id.clone(),
            from,
            to,
        });
        Ok(())
    }

    fn invalid(&self, to: Lifecycle) -> ReactorError {
        self.invalid_from(self.lifecycle(), to)
    }

    fn invalid_from(&self, from: Lifecycle, to: Lifecycle) -> ReactorError {
        ReactorError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::graph::{from_fn, GraphBuilder};
    use reactor_core::NodeError;
    use reactor_test_utils::eventually;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn echo_graph() -> Arc<GraphDefinition> {
        Arc::new(
            GraphBuilder::new("echo")
                .node(
                    "reply",
                    from_fn(|s| {
                        Ok(StateUpdate::new()
                            .message(ChatMessage::assistant(format!("echo: {}", s.user_input))))
                    }),
                )
                .entry("reply")
                .build()
                .unwrap(),
        )
    }

    fn instance(graph: Arc<GraphDefinition>) -> Arc<AgentInstance> {
        AgentInstance::new(
            graph,
            Arc::new(MemoryCheckpointer::new()),
            Arc::new(EventBus::default()),
            "hello",
            InstanceConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_to_completion() {
        let inst = instance(echo_graph());
        assert_eq!(inst.lifecycle(), Lifecycle::Initializing);
        assert_eq!(inst.latest_progress(), "Starting...");
        assert_eq!(inst.final_output(), "No output produced");

        inst.start().unwrap();
        assert_eq!(inst.wait().await, Lifecycle::Completed);
        assert_eq!(inst.final_output(), "echo: hello");
        assert!(inst.summary().completed_at.is_some());

        let history = inst.history().await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let inst = instance(echo_graph());
        inst.start().unwrap();
        let err = inst.start().unwrap_err();
        assert!(matches!(err, ReactorError::InvalidTransition { .. }));
        inst.wait().await;
    }

    #[tokio::test]
    async fn test_follow_up_message_reenters_session() {
        let inst = instance(echo_graph());
        inst.start().unwrap();
        inst.wait().await;

        assert_eq!(inst.send_message("again").unwrap(), Delivery::Continued);
        assert_eq!(inst.wait().await, Lifecycle::Completed);
        assert_eq!(inst.final_output(), "echo: again");
        assert_eq!(inst.history().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_node_error_at_end_settles_as_error() {
        let graph = Arc::new(
            GraphBuilder::new("fail")
                .node("boom", from_fn(|_| Err(NodeError::new("disk on fire"))))
                .entry("boom")
                .build()
                .unwrap(),
        );
        let inst = instance(graph);
        inst.start().unwrap();
        assert_eq!(inst.wait().await, Lifecycle::Error);
        assert_eq!(inst.error().as_deref(), Some("disk on fire"));

        let delivery = inst.send_message("retry?").unwrap();
        assert_eq!(
            delivery,
            Delivery::Ignored {
                lifecycle: Lifecycle::Error
            }
        );
    }

    #[tokio::test]
    async fn test_callback_failures_are_isolated() {
        let inst = instance(echo_graph());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        inst.on_progress(Arc::new(|_: &ProgressEvent| -> std::result::Result<(), String> {
            Err("subscriber offline".to_string())
        }));
        inst.on_progress(Arc::new(|_: &ProgressEvent| -> std::result::Result<(), String> {
            panic!("bad subscriber")
        }));
        inst.on_progress(Arc::new(move |e: &ProgressEvent| -> std::result::Result<(), String> {
            sink.lock().unwrap().push(e.message.content.clone());
            Ok(())
        }));

        let failures = inst
            .emit_progress("reply", ChatMessage::assistant("direct"))
            .await;
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].index, 0);
        assert_eq!(failures[1].index, 1);
        assert!(failures[1].error.contains("bad subscriber"));
        assert_eq!(*seen.lock().unwrap(), vec!["direct".to_string()]);

        inst.start().unwrap();
        assert_eq!(inst.wait().await, Lifecycle::Completed);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(inst.callback_failures().len(), 2);
    }

    #[tokio::test]
    async fn test_latest_progress_truncates() {
        let long = "x".repeat(250);
        let graph = Arc::new(
            GraphBuilder::new("long")
                .node(
                    "say",
                    from_fn(move |_| Ok(StateUpdate::new().message(ChatMessage::assistant(long.clone())))),
                )
                .entry("say")
                .build()
                .unwrap(),
        );
        let inst = instance(graph);
        inst.start().unwrap();
        inst.wait().await;

        let preview = inst.latest_progress();
        assert_eq!(preview.len(), 203);
        assert!(preview.ends_with("..."));
        assert_eq!(inst.final_output().len(), 250);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let inst = instance(echo_graph());
        assert!(inst.stop().await.unwrap());
        assert_eq!(inst.lifecycle(), Lifecycle::Stopped);
        assert!(inst.start().is_err());
    }

    /// Sleeps through cancellation; only an abort gets past it.
    struct StubbornCallback {
        entered: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl ProgressCallback for StubbornCallback {
        fn on_progress<'a>(
            &'a self,
            _event: &'a ProgressEvent,
        ) -> BoxFuture<'a, std::result::Result<(), String>> {
            Box::pin(async move {
                let _guard = SetOnDrop(self.dropped.clone());
                self.entered.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }
    }

    fn stubborn_instance() -> (Arc<AgentInstance>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let inst = AgentInstance::new(
            echo_graph(),
            Arc::new(MemoryCheckpointer::new()),
            Arc::new(EventBus::default()),
            "hello",
            InstanceConfig {
                stop_grace: Duration::from_millis(200),
                ..InstanceConfig::default()
            },
        );
        let entered = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        inst.on_progress(Arc::new(StubbornCallback {
            entered: entered.clone(),
            dropped: dropped.clone(),
        }));
        (inst, entered, dropped)
    }

    #[tokio::test]
    async fn test_stop_aborts_task_after_grace() {
        let (inst, entered, dropped) = stubborn_instance();
        inst.start().unwrap();
        let flag = entered.clone();
        assert!(eventually(Duration::from_secs(2), move || flag.load(Ordering::SeqCst)).await);

        let began = Instant::now();
        assert!(inst.stop().await.unwrap());
        let elapsed = began.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "returned after {:?}", elapsed);
        assert_eq!(inst.lifecycle(), Lifecycle::Stopped);
        assert!(inst.summary().completed_at.is_some());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_overlapping_stops_wait_for_the_task() {
        let (inst, entered, dropped) = stubborn_instance();
        inst.start().unwrap();
        let flag = entered.clone();
        assert!(eventually(Duration::from_secs(2), move || flag.load(Ordering::SeqCst)).await);

        let first = inst.stop();
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stopped = inst.stop().await;
            (stopped, dropped.load(Ordering::SeqCst))
        };
        let (first, (second, unwound)) = tokio::join!(first, second);

        assert!(first.unwrap());
        assert!(second.unwrap());
        assert!(unwound, "second stop returned while the task was still running");
        assert_eq!(inst.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_settled_fields_visible_when_wait_returns() {
        for _ in 0..50 {
            let inst = instance(echo_graph());
            inst.start().unwrap();
            assert_eq!(inst.wait().await, Lifecycle::Completed);
            let summary = inst.summary();
            assert!(summary.started_at.is_some());
            assert!(summary.completed_at.is_some());
        }

        let gated = Arc::new(
            GraphBuilder::new("gated")
                .node("ask", from_fn(|_| Ok(StateUpdate::new())))
                .node("act", from_fn(|_| Ok(StateUpdate::new())))
                .entry("ask")
                .edge("ask", "act")
                .interrupt_before("act")
                .build()
                .unwrap(),
        );
        for _ in 0..50 {
            let inst = instance(gated.clone());
            inst.start().unwrap();
            assert_eq!(inst.wait().await, Lifecycle::Paused);
            assert_eq!(inst.summary().pending_node.as_deref(), Some("act"));
        }
    }
}
