use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::ExecutionState;
use crate::types::SessionId;

/// A committed snapshot of one session.
///
/// `pending_node = Some(n)` means the session is paused before `n` waiting for
/// `resume`. `cursor` is the node that would run next (`None` once the graph
/// reached a terminal node), which is what crash recovery continues from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub state: ExecutionState,
    #[serde(default)]
    pub pending_node: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    /// Total node invocations committed for this session.
    #[serde(default)]
    pub step: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(session_id: SessionId, state: ExecutionState) -> Self {
        Self {
            session_id,
            state,
            pending_node: None,
            cursor: None,
            step: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pending_node.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.pending_node.is_none() && self.cursor.is_none()
    }
}

/// Checkpoint persistence backend.
///
/// The executor only ever talks to this trait. Implementations must accept
/// concurrent calls for different sessions; a single writer per session id
/// is guaranteed by the executor. A failed `save` must leave the previously
/// committed snapshot intact.
pub trait Checkpointer: Send + Sync + 'static {
    /// Persist the snapshot, replacing any previous one for the session.
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Load the latest snapshot for a session.
    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Whether a snapshot exists for the session.
    fn exists(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>>;

    /// Drop a session's snapshot. Returns whether one existed.
    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_flags() {
        let mut cp = Checkpoint::new(SessionId::from_string("s"), ExecutionState::default());
        assert!(cp.is_terminal());
        assert!(!cp.is_paused());

        cp.cursor = Some("approve".into());
        assert!(!cp.is_terminal());

        cp.pending_node = Some("approve".into());
        assert!(cp.is_paused());
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let mut cp = Checkpoint::new(
            SessionId::from_string("sess-1"),
            ExecutionState::for_task("echo hi"),
        );
        cp.pending_node = Some("approve".into());
        cp.step = 4;

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }
}
