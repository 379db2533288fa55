use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    // Graph errors
    #[error("Node '{node}' failed: {message}")]
    Node { node: String, message: String },

    #[error("Routing error at node '{node}': route '{route}' is not declared")]
    Routing { node: String, route: String },

    #[error("Step limit exceeded ({0} steps without reaching a terminal node)")]
    StepLimitExceeded(usize),

    #[error("Node not found in graph: {0}")]
    UnknownNode(String),

    #[error("Invalid graph definition: {0}")]
    InvalidGraph(String),

    // Checkpoint errors
    #[error("Checkpoint I/O error: {0}")]
    Checkpoint(String),

    #[error("No checkpoint for session: {0}")]
    NoCheckpoint(String),

    #[error("Session {0} is not paused at an interrupt point")]
    NotInterrupted(String),

    #[error("Session {0} has not reached a terminal node")]
    SessionNotTerminal(String),

    // Instance and registry errors
    #[error("Agent instance not found: {0}")]
    NotFound(String),

    #[error("Agent id prefix '{prefix}' is ambiguous ({matches} matches)")]
    AmbiguousId { prefix: String, matches: usize },

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReactorError {
    /// Whether this error ends the session for good (as opposed to lookup
    /// errors the caller can recover from).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Routing { .. }
                | Self::StepLimitExceeded(_)
                | Self::UnknownNode(_)
                | Self::InvalidGraph(_)
                | Self::Checkpoint(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReactorError>;

/// Failure raised by a node's own logic.
///
/// Never aborts the session by itself: the executor records it in
/// `ExecutionState::error` and lets the graph's routers decide what happens next.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
    pub retryable: bool,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}
