//! Ready-made workflow graphs.

pub mod command_plan;
pub mod react;

pub use command_plan::{
    command_plan_graph, CommandPlan, CommandPlanOptions, CommandResult, CommandRunner,
    ErrorAnalysis, ErrorAnalyzer, PlannedCommand, Planner, RetryDecision, RetrySameAnalyzer,
    StaticPlanner,
};
pub use react::{react_graph, Brain, ChatModel, Thought, ToolRunner};
