use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

fn default_max_retries() -> u32 {
    3
}

/// Structured failure recorded by the executor when a node returns `NodeError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateError {
    pub node: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Typed decision a planning node leaves for the routers that follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextStep {
    /// Hand an instruction to the acting node.
    Execute { instruction: String },
    /// Something failed; try to recover.
    Recover { reason: String },
    /// The task is done.
    Stop,
}

/// The data threaded through every node of a session.
///
/// `messages` is append-only; everything else is overwritten field by field
/// when a node's [`StateUpdate`] is merged. Workload-specific data lives in
/// `extensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub error: Option<StateError>,
    #[serde(default)]
    pub next_step: Option<NextStep>,
    /// External value supplied by `resume`; consumed by the node that runs next.
    #[serde(default)]
    pub resume_value: Option<serde_json::Value>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            messages: vec![],
            user_input: String::new(),
            current_step: 0,
            retry_count: 0,
            max_retries: default_max_retries(),
            requires_approval: false,
            approved: false,
            error: None,
            next_step: None,
            resume_value: None,
            extensions: BTreeMap::new(),
        }
    }
}

impl ExecutionState {
    /// Fresh state for a task, seeded with the user's request as the first message.
    pub fn for_task(task: impl Into<String>) -> Self {
        let task = task.into();
        Self {
            messages: vec![ChatMessage::user(task.clone())],
            user_input: task,
            ..Default::default()
        }
    }

    /// Get an extension value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }

    /// Get an extension value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).and_then(|v| v.as_str())
    }

    /// Deserialize an extension value into a typed structure.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extensions
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The most recent transcript entry.
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// The resume value as trimmed text.
    pub fn resume_text(&self) -> Option<String> {
        self.resume_value.as_ref().map(|v| match v {
            serde_json::Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
    }

    /// Merge a partial update: messages are appended, every other field the
    /// update carries overwrites the current one, untouched fields stay as they are.
    pub fn apply(&mut self, update: StateUpdate) {
        self.messages.extend(update.messages);
        if let Some(v) = update.user_input {
            self.user_input = v;
        }
        if let Some(v) = update.current_step {
            self.current_step = v;
        }
        if let Some(v) = update.retry_count {
            self.retry_count = v;
        }
        if let Some(v) = update.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = update.requires_approval {
            self.requires_approval = v;
        }
        if let Some(v) = update.approved {
            self.approved = v;
        }
        if let Some(v) = update.error {
            self.error = v;
        }
        if let Some(v) = update.next_step {
            self.next_step = v;
        }
        for (k, v) in update.extensions {
            self.extensions.insert(k, v);
        }
    }
}

/// The fields a node changed. Built with the chained setters.
///
/// `None` means "not written". For the optional state fields the inner
/// `Option` is the new value, so `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<ChatMessage>,
    pub user_input: Option<String>,
    pub current_step: Option<usize>,
    pub retry_count: Option<u32>,
    pub max_retries: Option<u32>,
    pub requires_approval: Option<bool>,
    pub approved: Option<bool>,
    pub error: Option<Option<StateError>>,
    pub next_step: Option<Option<NextStep>>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn message(mut self, msg: ChatMessage) -> Self {
        self.messages.push(msg);
        self
    }

    pub fn user_input(mut self, input: impl Into<String>) -> Self {
        self.user_input = Some(input.into());
        self
    }

    pub fn current_step(mut self, step: usize) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn requires_approval(mut self, required: bool) -> Self {
        self.requires_approval = Some(required);
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = Some(approved);
        self
    }

    pub fn error(mut self, error: StateError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn next_step(mut self, next: NextStep) -> Self {
        self.next_step = Some(Some(next));
        self
    }

    pub fn clear_next_step(mut self) -> Self {
        self.next_step = Some(None);
        self
    }

    /// Set an extension value.
    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Messages this update appends that carry visible text.
    pub fn notable_messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| !m.content.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_for_task_seeds_transcript() {
        let state = ExecutionState::for_task("list files");
        assert_eq!(state.user_input, "list files");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.max_retries, 3);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_apply_preserves_untouched_fields() {
        let mut state = ExecutionState::for_task("task");
        state.retry_count = 2;
        state.extensions.insert("keep".into(), json!("me"));

        state.apply(StateUpdate::new().approved(true).set("added", json!(1)));

        assert!(state.approved);
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.user_input, "task");
        assert_eq!(state.get_str("keep"), Some("me"));
        assert_eq!(state.get("added"), Some(&json!(1)));
    }

    #[test]
    fn test_apply_appends_messages_in_order() {
        let mut state = ExecutionState::for_task("first");
        state.apply(
            StateUpdate::new()
                .message(ChatMessage::assistant("second"))
                .message(ChatMessage::assistant("third")),
        );
        state.apply(StateUpdate::new().message(ChatMessage::user("fourth")));

        let texts: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_apply_overrides_scalars_and_clears_options() {
        let mut state = ExecutionState::default();
        state.apply(StateUpdate::new().error(StateError {
            node: "execute".into(),
            message: "exit 1".into(),
            retryable: true,
        }));
        assert!(state.error.is_some());

        state.apply(StateUpdate::new().retry_count(1));
        assert!(state.error.is_some(), "unwritten field must survive");

        state.apply(StateUpdate::new().clear_error().next_step(NextStep::Stop));
        assert!(state.error.is_none());
        assert_eq!(state.next_step, Some(NextStep::Stop));
    }

    #[test]
    fn test_extension_overwrite_is_shallow() {
        let mut state = ExecutionState::default();
        state.apply(StateUpdate::new().set("plan", json!({"a": 1, "b": 2})));
        state.apply(StateUpdate::new().set("plan", json!({"c": 3})));
        assert_eq!(state.get("plan"), Some(&json!({"c": 3})));
    }

    #[test]
    fn test_get_as_typed() {
        let mut state = ExecutionState::default();
        state.extensions.insert("cmds".into(), json!(["ls", "pwd"]));
        let cmds: Vec<String> = state.get_as("cmds").unwrap();
        assert_eq!(cmds, vec!["ls", "pwd"]);
        assert!(state.get_as::<u32>("cmds").is_none());
    }

    #[test]
    fn test_resume_text() {
        let mut state = ExecutionState::default();
        assert_eq!(state.resume_text(), None);
        state.resume_value = Some(json!("  approve "));
        assert_eq!(state.resume_text().as_deref(), Some("approve"));
    }

    #[test]
    fn test_serialization_roundtrip_with_defaults() {
        let state: ExecutionState = serde_json::from_str(r#"{"user_input": "x"}"#).unwrap();
        assert_eq!(state.max_retries, 3);
        assert!(state.messages.is_empty());

        let mut full = ExecutionState::for_task("t");
        full.next_step = Some(NextStep::Execute {
            instruction: "run ls".into(),
        });
        let json = serde_json::to_string(&full).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, full);
    }

    #[test]
    fn test_notable_messages_skip_blank() {
        let update = StateUpdate::new()
            .message(ChatMessage::assistant("  "))
            .message(ChatMessage::assistant("done"));
        assert_eq!(update.notable_messages().count(), 1);
        assert!(StateUpdate::new().is_empty());
    }
}
