use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use reactor_core::{ChatMessage, ExecutionState, Node, NodeError, StateUpdate};

use crate::prebuilt::command_plan::{CommandPlan, PlannedCommand};

/// A human decision on a gated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "command", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    /// Run this command instead.
    Modify(String),
}

impl ApprovalDecision {
    /// Parse `approve`, `reject` or `modify: <command>`, case-insensitively.
    /// The replacement command keeps its original case.
    pub fn parse(input: &str) -> Option<Self> {
        const MODIFY: &str = "modify:";
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("approve") {
            return Some(Self::Approve);
        }
        if trimmed.eq_ignore_ascii_case("reject") {
            return Some(Self::Reject);
        }
        let prefix = trimmed.get(..MODIFY.len())?;
        if !prefix.eq_ignore_ascii_case(MODIFY) {
            return None;
        }
        let command = trimmed[MODIFY.len()..].trim();
        if command.is_empty() {
            None
        } else {
            Some(Self::Modify(command.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Modify(_) => "modify",
        }
    }

    /// The reply text that `parse` maps back to this decision.
    pub fn reply_text(&self) -> String {
        match self {
            Self::Modify(command) => format!("modify: {}", command),
            other => other.as_str().to_string(),
        }
    }
}

/// Text shown to the human while a session waits on a command.
pub fn approval_prompt(command: &PlannedCommand) -> String {
    format!(
        "APPROVAL REQUIRED\n\n\
         Command: {}\n\
         Description: {}\n\
         Risk Level: {}\n\n\
         Reasoning: {}\n\n\
         Reply with:\n\
         - 'approve' to execute\n\
         - 'reject' to skip\n\
         - 'modify: <new_command>' to change command",
        command.cmd, command.description, command.risk, command.reasoning
    )
}

/// Applies a human decision to the current command of the plan.
///
/// Meant to sit behind an interrupt point: the decision arrives as the resume
/// value. Without one, a command that was already approved goes ahead and
/// anything else is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestApprovalNode;

impl RequestApprovalNode {
    fn decide(state: &ExecutionState) -> Result<StateUpdate, NodeError> {
        let mut plan = CommandPlan::from_state(state)
            .ok_or_else(|| NodeError::new("no execution plan to approve"))?;
        let idx = state.current_step;
        let command = plan
            .commands
            .get(idx)
            .cloned()
            .ok_or_else(|| NodeError::new(format!("no command at step {}", idx)))?;

        let reply = state.resume_text();
        let decision = match reply.as_deref() {
            Some(text) => ApprovalDecision::parse(text),
            None if state.approved => Some(ApprovalDecision::Approve),
            None => Some(ApprovalDecision::Reject),
        };

        let mut update = StateUpdate::new().message(ChatMessage::assistant(approval_prompt(&command)));
        if let Some(text) = &reply {
            update = update.message(ChatMessage::user(text.clone()));
        }

        let update = match decision {
            Some(ApprovalDecision::Approve) => update
                .approved(true)
                .requires_approval(false)
                .message(ChatMessage::assistant("Approved. Proceeding with execution...")),
            Some(ApprovalDecision::Modify(new_cmd)) => {
                if let Some(cmd) = plan.commands.get_mut(idx) {
                    cmd.cmd = new_cmd.clone();
                }
                update
                    .set(crate::prebuilt::command_plan::PLAN_KEY, plan.to_value())
                    .approved(true)
                    .requires_approval(false)
                    .message(ChatMessage::assistant(format!(
                        "Modified command to: {}",
                        new_cmd
                    )))
            }
            Some(ApprovalDecision::Reject) => update
                .approved(false)
                .current_step(idx + 1)
                .message(ChatMessage::assistant("Rejected. Skipping command...")),
            None => update
                .approved(false)
                .current_step(idx + 1)
                .message(ChatMessage::assistant(
                    "Unrecognized response. Treating it as a rejection and skipping command...",
                )),
        };
        Ok(update)
    }
}

impl Node for RequestApprovalNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, Result<StateUpdate, NodeError>> {
        let result = Self::decide(state);
        Box::pin(async move { result })
    }
}
