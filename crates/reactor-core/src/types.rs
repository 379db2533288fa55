use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier. Keys checkpoints.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A single transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    pub fn assistant_with_tools(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(Role::Assistant, text)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Lifecycle of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Initializing,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl Lifecycle {
    /// The transition table. Every lifecycle change goes through this check.
    pub fn can_transition_to(self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Initializing, Running)
                | (Initializing, Stopped)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Completed, Running)
        )
    }

    /// `Error` and `Stopped` never leave; `Completed` only via a follow-up message.
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Error | Lifecycle::Stopped)
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Error | Lifecycle::Stopped
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// An instance was registered and started.
    InstanceSpawned {
        instance_id: String,
        agent_name: String,
    },
    /// An instance moved between lifecycle states.
    LifecycleChanged {
        instance_id: String,
        from: Lifecycle,
        to: Lifecycle,
    },
    /// A node finished and its update was committed.
    StepCompleted {
        session_id: SessionId,
        node: String,
        step: u64,
    },
    /// A session paused before an interrupt point.
    Interrupted {
        session_id: SessionId,
        pending_node: String,
    },
    /// A paused session received its external value.
    Resumed {
        session_id: SessionId,
        node: String,
    },
}

/// Progress notification delivered to instance subscribers.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub instance_id: String,
    pub session_id: SessionId,
    pub node: String,
    pub message: ChatMessage,
    pub timestamp: DateTime<Utc>,
}
