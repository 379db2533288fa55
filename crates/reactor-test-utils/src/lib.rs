//! Shared fixtures for Reactor tests: scripted nodes, a recording progress
//! callback and a checkpointer that fails on demand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use reactor_core::error::{ReactorError, Result};
use reactor_core::{
    ChatMessage, Checkpoint, Checkpointer, ExecutionState, Node, NodeError, ProgressCallback,
    ProgressEvent, SessionId, StateUpdate,
};

type Script =
    dyn Fn(&ExecutionState, usize) -> std::result::Result<StateUpdate, NodeError> + Send + Sync;

/// Node driven by a closure that also receives its zero-based call index.
pub struct ScriptedNode {
    script: Box<Script>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedNode {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ExecutionState, usize) -> std::result::Result<StateUpdate, NodeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A node that changes nothing.
    pub fn noop() -> Self {
        Self::new(|_, _| Ok(StateUpdate::new()))
    }

    /// Shared call counter. Survives the node being moved into a graph.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Node for ScriptedNode {
    fn run<'a>(
        &'a self,
        state: &'a ExecutionState,
    ) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.script)(state, index);
        Box::pin(async move { result })
    }
}

/// Shared, ordered log of visited node names.
#[derive(Clone, Default)]
pub struct VisitLog(Arc<Mutex<Vec<String>>>);

impl VisitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str) {
        if let Ok(mut v) = self.0.lock() {
            v.push(name.to_string());
        }
    }

    pub fn visits(&self) -> Vec<String> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

/// Records its name in a [`VisitLog`] and appends an assistant message with it.
pub struct RecordingNode {
    name: String,
    log: VisitLog,
}

impl RecordingNode {
    pub fn new(name: impl Into<String>, log: VisitLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

impl Node for RecordingNode {
    fn run<'a>(
        &'a self,
        _state: &'a ExecutionState,
    ) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        self.log.push(&self.name);
        let update = StateUpdate::new().message(ChatMessage::assistant(self.name.clone()));
        Box::pin(async move { Ok(update) })
    }
}

/// Sleeps before returning an empty update.
pub struct SlowNode {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl SlowNode {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Node for SlowNode {
    fn run<'a>(
        &'a self,
        _state: &'a ExecutionState,
    ) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(StateUpdate::new().message(ChatMessage::assistant("slow step done")))
        })
    }
}

/// Progress callback that keeps every event it sees.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.node).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressCallback for RecordingCallback {
    fn on_progress<'a>(
        &'a self,
        event: &'a ProgressEvent,
    ) -> BoxFuture<'a, std::result::Result<(), String>> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Box::pin(async { Ok(()) })
    }
}

/// In-memory checkpointer whose saves start failing after a number of
/// successful ones.
pub struct FailingCheckpointer {
    store: Mutex<HashMap<SessionId, Checkpoint>>,
    saves_left: AtomicUsize,
}

impl FailingCheckpointer {
    /// Every save fails.
    pub fn always() -> Self {
        Self::after(0)
    }

    /// The first `successful` saves go through.
    pub fn after(successful: usize) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            saves_left: AtomicUsize::new(successful),
        }
    }

    fn take_save(&self) -> bool {
        self.saves_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Checkpoint>> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Checkpointer for FailingCheckpointer {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        let result = if self.take_save() {
            self.store()
                .insert(checkpoint.session_id.clone(), checkpoint);
            Ok(())
        } else {
            Err(ReactorError::Checkpoint("disk full".into()))
        };
        Box::pin(async move { result })
    }

    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let cp = self.store().get(session_id).cloned();
        Box::pin(async move { Ok(cp) })
    }

    fn exists(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let found = self.store().contains_key(session_id);
        Box::pin(async move { Ok(found) })
    }

    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let removed = self.store().remove(session_id).is_some();
        Box::pin(async move { Ok(removed) })
    }
}

/// A fresh directory and a database path inside it. Keep the `TempDir`
/// alive for as long as the path is used.
pub fn temp_db_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("checkpoints.db");
    (dir, path)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
