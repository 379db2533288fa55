//! Approval-gated shell automation.
//!
//! ```text
//! plan -> validate -+-> request_approval* -+-> execute -+-> next_command -+-> validate
//!                   |                      '-> validate |                 '-> summarize
//!                   +-> execute                         '-> analyze_error -+-> execute (retry)
//!                   '-> summarize                                          +-> next_command (skip)
//!                                                                          '-> summarize (abort)
//! ```
//! `*` interrupt point: the session pauses for a human decision.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use reactor_core::error::Result;
use reactor_core::safety::{RiskLevel, RiskMatcher};
use reactor_core::{ChatMessage, ExecutionState, NextStep, Node, NodeError, StateError, StateUpdate};

use crate::approval::RequestApprovalNode;
use crate::graph::{GraphBuilder, GraphDefinition, END};

pub const PLAN: &str = "plan";
pub const VALIDATE: &str = "validate";
pub const REQUEST_APPROVAL: &str = "request_approval";
pub const EXECUTE: &str = "execute";
pub const ANALYZE_ERROR: &str = "analyze_error";
pub const NEXT_COMMAND: &str = "next_command";
pub const SUMMARIZE: &str = "summarize";

/// Extension key holding the [`CommandPlan`].
pub const PLAN_KEY: &str = "plan";
/// Extension key holding the `Vec<CommandResult>` of executed commands.
pub const RESULTS_KEY: &str = "results";
/// Extension key holding the latest [`RetryDecision`].
pub const RETRY_DECISION_KEY: &str = "retry_decision";

fn default_risk() -> RiskLevel {
    RiskLevel::Safe
}

/// One shell command of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub cmd: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "default_risk")]
    pub risk: RiskLevel,
}

/// Ordered commands produced by a [`Planner`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPlan {
    pub commands: Vec<PlannedCommand>,
    #[serde(default)]
    pub strategy: String,
}

impl CommandPlan {
    pub fn from_commands(commands: impl IntoIterator<Item = PlannedCommand>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
            strategy: String::new(),
        }
    }

    pub fn from_state(state: &ExecutionState) -> Option<Self> {
        state.get_as(PLAN_KEY)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Numbered listing, one command per line.
    pub fn summary(&self) -> String {
        self.commands
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. [{}] {}: `{}`", i + 1, c.risk, c.description, c.cmd))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The command the session is currently working on.
pub fn current_command(state: &ExecutionState) -> Option<PlannedCommand> {
    CommandPlan::from_state(state).and_then(|p| p.commands.get(state.current_step).cloned())
}

/// Outcome of running one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// A command that could not be started at all.
    pub fn failure(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("`{}` exited with code {}", self.command, self.exit_code)
        } else {
            format!("`{}` exited with code {}: {}", self.command, self.exit_code, stderr)
        }
    }

    fn describe(&self) -> String {
        let (mark, body) = if self.success() {
            ("✓", self.stdout.trim())
        } else {
            ("✗", self.stderr.trim())
        };
        let body = truncate(body, 500);
        if body.is_empty() {
            format!("{} {}", mark, self.command)
        } else {
            format!("{} {}\n{}", mark, self.command, body)
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// What to do about a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Run `command` (possibly rewritten) again.
    Retry { command: String },
    /// Move on to the next command.
    Skip,
    /// Stop working through the plan.
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnalysis {
    pub root_cause: String,
    pub decision: RetryDecision,
}

/// Turns a task description into a plan.
pub trait Planner: Send + Sync + 'static {
    fn plan<'a>(&'a self, task: &'a str) -> BoxFuture<'a, std::result::Result<CommandPlan, NodeError>>;
}

/// Runs one shell command. Enforces its own timeout.
pub trait CommandRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, command: &'a str)
        -> BoxFuture<'a, std::result::Result<CommandResult, NodeError>>;
}

/// Decides whether a failed command is worth another attempt.
pub trait ErrorAnalyzer: Send + Sync + 'static {
    fn analyze<'a>(
        &'a self,
        command: &'a PlannedCommand,
        result: &'a CommandResult,
    ) -> BoxFuture<'a, std::result::Result<ErrorAnalysis, NodeError>>;
}

/// Planner that runs a fixed list of commands in order.
pub struct StaticPlanner {
    commands: Vec<String>,
    matcher: RiskMatcher,
}

impl StaticPlanner {
    pub fn new(commands: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            matcher: RiskMatcher::default(),
        }
    }
}

impl Planner for StaticPlanner {
    fn plan<'a>(&'a self, _task: &'a str) -> BoxFuture<'a, std::result::Result<CommandPlan, NodeError>> {
        let commands = self
            .commands
            .iter()
            .map(|cmd| {
                let assessment = self.matcher.assess(cmd);
                PlannedCommand {
                    cmd: cmd.clone(),
                    description: format!("Run `{}`", cmd),
                    reasoning: assessment.warnings.join("; "),
                    risk: assessment.level,
                }
            })
            .collect::<Vec<_>>();
        let plan = CommandPlan {
            strategy: format!("Run {} command(s) in order", commands.len()),
            commands,
        };
        Box::pin(async move { Ok(plan) })
    }
}

/// Retries a failed command unchanged, except when the shell could not find
/// the program (exit 127), which no retry will fix.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetrySameAnalyzer;

impl ErrorAnalyzer for RetrySameAnalyzer {
    fn analyze<'a>(
        &'a self,
        command: &'a PlannedCommand,
        result: &'a CommandResult,
    ) -> BoxFuture<'a, std::result::Result<ErrorAnalysis, NodeError>> {
        let analysis = if result.exit_code == 127 {
            ErrorAnalysis {
                root_cause: "command not found".into(),
                decision: RetryDecision::Skip,
            }
        } else {
            ErrorAnalysis {
                root_cause: result.error_message(),
                decision: RetryDecision::Retry {
                    command: command.cmd.clone(),
                },
            }
        };
        Box::pin(async move { Ok(analysis) })
    }
}

/// Approval policy for the validate step.
#[derive(Debug, Clone, Copy)]
pub struct CommandPlanOptions {
    /// Commands assessed as safe skip the approval gate.
    pub auto_approve_safe: bool,
    /// Never pause for approval.
    pub autonomous: bool,
}

impl Default for CommandPlanOptions {
    fn default() -> Self {
        Self {
            auto_approve_safe: true,
            autonomous: false,
        }
    }
}

struct PlanNode {
    planner: Arc<dyn Planner>,
}

impl Node for PlanNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let plan = self.planner.plan(&state.user_input).await?;
            let mut text = format!("Execution plan:\n{}", plan.summary());
            if !plan.strategy.is_empty() {
                text.push_str(&format!("\n\nStrategy: {}", plan.strategy));
            }
            Ok(StateUpdate::new()
                .set(PLAN_KEY, plan.to_value())
                .set(RESULTS_KEY, serde_json::json!([]))
                .current_step(0)
                .retry_count(0)
                .clear_error()
                .message(ChatMessage::assistant(text)))
        })
    }
}

struct ValidateNode {
    options: CommandPlanOptions,
    matcher: RiskMatcher,
}

impl ValidateNode {
    fn validate(&self, state: &ExecutionState) -> StateUpdate {
        let Some(plan) = CommandPlan::from_state(state) else {
            return StateUpdate::new().requires_approval(false);
        };
        let Some(command) = plan.commands.get(state.current_step) else {
            return StateUpdate::new().requires_approval(false);
        };

        let assessment = self.matcher.assess(&command.cmd);
        let level = assessment.level.max(command.risk);
        let requires = !self.options.autonomous
            && !(level == RiskLevel::Safe && self.options.auto_approve_safe);
        debug!(command = %command.cmd, %level, requires_approval = requires, "Validated command");

        let mut text = format!(
            "Step {}/{}: `{}` [{}]",
            state.current_step + 1,
            plan.commands.len(),
            command.cmd,
            level
        );
        for warning in &assessment.warnings {
            text.push_str(&format!("\n- {}", warning));
        }

        StateUpdate::new()
            .requires_approval(requires)
            .approved(!requires)
            .message(ChatMessage::assistant(text))
    }
}

impl Node for ValidateNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        let update = self.validate(state);
        Box::pin(async move { Ok(update) })
    }
}

struct ExecuteNode {
    runner: Arc<dyn CommandRunner>,
}

impl Node for ExecuteNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let command = current_command(state)
                .ok_or_else(|| NodeError::new(format!("no command at step {}", state.current_step)))?;

            let result = match self.runner.run(&command.cmd).await {
                Ok(result) => result,
                Err(e) => CommandResult::failure(&command.cmd, e.message),
            };

            let mut results: Vec<CommandResult> = state.get_as(RESULTS_KEY).unwrap_or_default();
            results.push(result.clone());

            let update = StateUpdate::new()
                .set(RESULTS_KEY, serde_json::to_value(&results).unwrap_or_default())
                .message(ChatMessage::assistant(result.describe()));
            Ok(if result.success() {
                update.clear_error()
            } else {
                update.error(StateError {
                    node: EXECUTE.to_string(),
                    message: result.error_message(),
                    retryable: true,
                })
            })
        })
    }
}

struct AnalyzeErrorNode {
    analyzer: Arc<dyn ErrorAnalyzer>,
}

impl AnalyzeErrorNode {
    fn abort(reason: String) -> StateUpdate {
        StateUpdate::new()
            .set(
                RETRY_DECISION_KEY,
                serde_json::to_value(RetryDecision::Abort).unwrap_or_default(),
            )
            .message(ChatMessage::assistant(reason))
    }
}

impl Node for AnalyzeErrorNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        Box::pin(async move {
            let last: Option<CommandResult> = state
                .get_as::<Vec<CommandResult>>(RESULTS_KEY)
                .and_then(|mut r| r.pop());
            let (Some(mut plan), Some(last)) = (CommandPlan::from_state(state), last) else {
                return Ok(Self::abort("Nothing to analyze; stopping.".into()));
            };
            let idx = state.current_step;
            let Some(command) = plan.commands.get(idx).cloned() else {
                return Ok(Self::abort("Nothing to analyze; stopping.".into()));
            };

            if state.retry_count >= state.max_retries {
                return Ok(Self::abort(format!(
                    "Giving up on `{}` after {} retries.",
                    command.cmd, state.retry_count
                )));
            }

            let analysis = match self.analyzer.analyze(&command, &last).await {
                Ok(analysis) => analysis,
                Err(e) => return Ok(Self::abort(format!("Error analysis failed: {}", e))),
            };

            let mut update = StateUpdate::new()
                .set(
                    RETRY_DECISION_KEY,
                    serde_json::to_value(&analysis.decision).unwrap_or_default(),
                )
                .message(ChatMessage::assistant(format!(
                    "Error analysis:\nRoot cause: {}\nDecision: {}",
                    analysis.root_cause,
                    match &analysis.decision {
                        RetryDecision::Retry { command } => format!("retry `{}`", command),
                        RetryDecision::Skip => "skip".to_string(),
                        RetryDecision::Abort => "abort".to_string(),
                    }
                )));
            if let RetryDecision::Retry { command: new_cmd } = &analysis.decision {
                if let Some(cmd) = plan.commands.get_mut(idx) {
                    cmd.cmd = new_cmd.clone();
                }
                update = update
                    .set(PLAN_KEY, plan.to_value())
                    .retry_count(state.retry_count + 1);
            }
            Ok(update)
        })
    }
}

struct NextCommandNode;

impl Node for NextCommandNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        let update = StateUpdate::new()
            .current_step(state.current_step + 1)
            .retry_count(0)
            .approved(false)
            .requires_approval(false)
            .clear_error();
        Box::pin(async move { Ok(update) })
    }
}

struct SummarizeNode;

impl Node for SummarizeNode {
    fn run<'a>(&'a self, state: &'a ExecutionState) -> BoxFuture<'a, std::result::Result<StateUpdate, NodeError>> {
        let results: Vec<CommandResult> = state.get_as(RESULTS_KEY).unwrap_or_default();
        let planned = CommandPlan::from_state(state).map_or(0, |p| p.commands.len());
        let succeeded = results.iter().filter(|r| r.success()).count();

        let mut text = format!(
            "Summary: {} of {} planned command(s) succeeded ({} attempt(s)).",
            succeeded,
            planned,
            results.len()
        );
        for r in &results {
            let mark = if r.success() { "✓" } else { "✗" };
            text.push_str(&format!("\n{} {} (exit {})", mark, r.command, r.exit_code));
        }
        if let Some(err) = &state.error {
            text.push_str(&format!("\nStopped early: {}", err.message));
        }

        let update = StateUpdate::new()
            .next_step(NextStep::Stop)
            .message(ChatMessage::assistant(text));
        Box::pin(async move { Ok(update) })
    }
}

fn route_after_validate(state: &ExecutionState) -> &'static str {
    if current_command(state).is_none() {
        "done"
    } else if state.requires_approval {
        "approval"
    } else {
        "execute"
    }
}

fn route_after_approval(state: &ExecutionState) -> &'static str {
    if state.approved {
        "approved"
    } else {
        "rejected"
    }
}

fn route_after_execute(state: &ExecutionState) -> &'static str {
    if state.error.is_some() {
        "failed"
    } else {
        "ok"
    }
}

fn route_after_analysis(state: &ExecutionState) -> &'static str {
    match state.get_as::<RetryDecision>(RETRY_DECISION_KEY) {
        Some(RetryDecision::Retry { .. }) => "retry",
        Some(RetryDecision::Skip) => "skip",
        _ => "abort",
    }
}

fn route_after_next(state: &ExecutionState) -> &'static str {
    if current_command(state).is_some() {
        "more"
    } else {
        "done"
    }
}

/// Build the approval-gated command graph around the given collaborators.
pub fn command_plan_graph(
    planner: Arc<dyn Planner>,
    runner: Arc<dyn CommandRunner>,
    analyzer: Arc<dyn ErrorAnalyzer>,
    options: CommandPlanOptions,
) -> Result<GraphDefinition> {
    GraphBuilder::new("command_plan")
        .node(PLAN, PlanNode { planner })
        .node(
            VALIDATE,
            ValidateNode {
                options,
                matcher: RiskMatcher::default(),
            },
        )
        .node(REQUEST_APPROVAL, RequestApprovalNode)
        .node(EXECUTE, ExecuteNode { runner })
        .node(ANALYZE_ERROR, AnalyzeErrorNode { analyzer })
        .node(NEXT_COMMAND, NextCommandNode)
        .node(SUMMARIZE, SummarizeNode)
        .entry(PLAN)
        .edge(PLAN, VALIDATE)
        .conditional(
            VALIDATE,
            route_after_validate,
            [
                ("approval", REQUEST_APPROVAL),
                ("execute", EXECUTE),
                ("done", SUMMARIZE),
            ],
        )
        .conditional(
            REQUEST_APPROVAL,
            route_after_approval,
            [("approved", EXECUTE), ("rejected", VALIDATE)],
        )
        .conditional(
            EXECUTE,
            route_after_execute,
            [("ok", NEXT_COMMAND), ("failed", ANALYZE_ERROR)],
        )
        .conditional(
            ANALYZE_ERROR,
            route_after_analysis,
            [("retry", EXECUTE), ("skip", NEXT_COMMAND), ("abort", SUMMARIZE)],
        )
        .conditional(
            NEXT_COMMAND,
            route_after_next,
            [("more", VALIDATE), ("done", SUMMARIZE)],
        )
        .edge(SUMMARIZE, END)
        .interrupt_before(REQUEST_APPROVAL)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_planner_assesses_risk() {
        let planner = StaticPlanner::new(["ls -la", "rm -rf build"]);
        let plan = futures::executor::block_on(planner.plan("cleanup")).unwrap();
        assert_eq!(plan.commands.len(), 2);
        assert_eq!(plan.commands[0].risk, RiskLevel::Safe);
        assert_eq!(plan.commands[1].risk, RiskLevel::Dangerous);
        assert!(plan.summary().contains("2. [dangerous]"));
    }

    #[test]
    fn test_retry_decision_serialization() {
        let value = serde_json::to_value(RetryDecision::Retry {
            command: "make".into(),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"action": "retry", "command": "make"}));

        let mut state = ExecutionState::default();
        state.extensions.insert(RETRY_DECISION_KEY.into(), value);
        assert_eq!(route_after_analysis(&state), "retry");

        state.extensions.insert(
            RETRY_DECISION_KEY.into(),
            serde_json::json!({"action": "skip"}),
        );
        assert_eq!(route_after_analysis(&state), "skip");

        state.extensions.remove(RETRY_DECISION_KEY);
        assert_eq!(route_after_analysis(&state), "abort");
    }

    #[test]
    fn test_validate_policy() {
        let mut state = ExecutionState::default();
        let plan = CommandPlan::from_commands(
            ["echo hi", "sudo reboot"]
                .into_iter()
                .map(|c| PlannedCommand {
                    cmd: c.into(),
                    description: String::new(),
                    reasoning: String::new(),
                    risk: RiskLevel::Safe,
                }),
        );
        state.extensions.insert(PLAN_KEY.into(), plan.to_value());

        let node = ValidateNode {
            options: CommandPlanOptions::default(),
            matcher: RiskMatcher::default(),
        };
        let update = node.validate(&state);
        assert_eq!(update.requires_approval, Some(false));
        assert_eq!(update.approved, Some(true));

        state.current_step = 1;
        let update = node.validate(&state);
        assert_eq!(update.requires_approval, Some(true));
        assert_eq!(update.approved, Some(false));

        let autonomous = ValidateNode {
            options: CommandPlanOptions {
                autonomous: true,
                ..Default::default()
            },
            matcher: RiskMatcher::default(),
        };
        assert_eq!(autonomous.validate(&state).requires_approval, Some(false));

        state.current_step = 2;
        assert_eq!(route_after_validate(&state), "done");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 5), "hi");
    }

    #[tokio::test]
    async fn test_retry_same_analyzer() {
        let cmd = PlannedCommand {
            cmd: "make".into(),
            description: String::new(),
            reasoning: String::new(),
            risk: RiskLevel::Safe,
        };
        let missing = CommandResult {
            command: "make".into(),
            exit_code: 127,
            stdout: String::new(),
            stderr: "make: not found".into(),
        };
        let analysis = RetrySameAnalyzer.analyze(&cmd, &missing).await.unwrap();
        assert_eq!(analysis.decision, RetryDecision::Skip);

        let flaky = CommandResult { exit_code: 2, ..missing };
        let analysis = RetrySameAnalyzer.analyze(&cmd, &flaky).await.unwrap();
        assert_eq!(
            analysis.decision,
            RetryDecision::Retry {
                command: "make".into()
            }
        );
    }
}
