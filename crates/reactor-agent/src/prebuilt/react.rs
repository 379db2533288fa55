//! Thinking -> agent -> tools loop.
//!
//! The thinking node asks a [`Brain`] what to do next; `NextStep::Stop` ends
//! the session. The agent node asks a [`ChatModel`] for a reply, and any tool
//! calls in that reply are run by the tools node before thinking again.

use std::sync::Arc;

use futures::future::BoxFuture;

use reactor_core::error::Result;
use reactor_core::{ChatMessage, ExecutionState, NextStep, Node, NodeError, StateUpdate, ToolCall};

use crate::graph::{GraphBuilder, GraphDefinition, END};

pub const THINKING: &str = "thinking";
pub const AGENT: &str = "agent";
pub const TOOLS: &str = "tools";

/// What the brain concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct Thought {
    /// Shown in the transcript when not blank.
    pub reasoning: String,
    pub next: NextStep,
}

/// Plans the next move from the transcript.
pub trait Brain: Send + Sync + 'static {
    fn think<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<Thought, NodeError>>;
}

/// Produces the next assistant message, possibly with tool calls.
pub trait ChatModel: Send + Sync + 'static {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        instruction: Option<&'a str>,
    ) -> BoxFuture<'a, std::result::Result<ChatMessage, NodeError>>;
}

/// Executes a single tool call and returns its textual output.
pub trait ToolRunner: Send + Sync + 'static {
    fn call<'a>(&'a self, call: &'a ToolCall) -> BoxFuture<'a, std::result::Result<String, NodeError>>;
}

struct ThinkingNode {
    brain: Arc<dyn Brain>,
}

impl Node for ThinkingNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let thought = self.brain.think(state).await?;
            let mut update = StateUpdate::new()
                .next_step(thought.next)
                .current_step(state.current_step + 1);
            if !thought.reasoning.trim().is_empty() {
                update = update.message(ChatMessage::assistant(thought.reasoning));
            }
            Ok(update)
        })
    }
}

struct AgentNode {
    model: Arc<dyn ChatModel>,
}

impl Node for AgentNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let instruction = match &state.next_step {
                Some(NextStep::Execute { instruction }) => Some(instruction.clone()),
                Some(NextStep::Recover { reason }) => Some(format!("Recover from: {}", reason)),
                Some(NextStep::Stop) | None => None,
            };
            let reply = self
                .model
                .complete(&state.messages, instruction.as_deref())
                .await?;
            Ok(StateUpdate::new().clear_error().message(reply))
        })
    }
}

struct ToolsNode {
    runner: Arc<dyn ToolRunner>,
}

impl Node for ToolsNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let calls = state
                .last_message()
                .map(|m| m.tool_calls.clone())
                .unwrap_or_default();

            let mut update = StateUpdate::new();
            for call in &calls {
                let output = match self.runner.call(call).await {
                    Ok(output) => output,
                    Err(e) => format!("Error: {}", e),
                };
                update = update.message(ChatMessage::tool_result(call.id.clone(), output));
            }
            Ok(update)
        })
    }
}

fn route_after_thinking(state: &ExecutionState) -> &'static str {
    match state.next_step {
        Some(NextStep::Stop) => "end",
        _ => "act",
    }
}

fn route_after_agent(state: &ExecutionState) -> &'static str {
    match state.last_message() {
        Some(m) if m.has_tool_calls() => "tools",
        _ => "end",
    }
}

/// Build the thinking/agent/tools loop around the given collaborators.
pub fn react_graph(
    brain: Arc<dyn Brain>,
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolRunner>,
) -> Result<GraphDefinition> {
    GraphBuilder::new("react")
        .node(THINKING, ThinkingNode { brain })
        .node(AGENT, AgentNode { model })
        .node(TOOLS, ToolsNode { runner: tools })
        .entry(THINKING)
        .conditional(THINKING, route_after_thinking, [("act", AGENT), ("end", END)])
        .conditional(AGENT, route_after_agent, [("tools", TOOLS), ("end", END)])
        .edge(TOOLS, THINKING)
        .build()
}
