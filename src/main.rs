mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reactor_agent::approval::approval_prompt;
use reactor_agent::prebuilt::command_plan::current_command;
use reactor_agent::prebuilt::{
    command_plan_graph, CommandPlanOptions, RetrySameAnalyzer, StaticPlanner,
};
use reactor_agent::{
    AgentManager, ApprovalDecision, GraphDefinition, GraphExecutor, Outcome, SpawnOptions,
    SqliteCheckpointer,
};
use reactor_core::config::AppConfig;
use reactor_core::{ExecutionState, Lifecycle, ProgressEvent, Role, SessionId};

use runner::ProcessRunner;

const DEFAULT_CONFIG: &str = "reactor.toml";

#[derive(Parser)]
#[command(name = "reactor", version, about = "Checkpointed workflow graphs for agent sessions")]
struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run shell commands through the approval-gated command graph
    Exec {
        /// Command to run; repeat for a multi-step plan
        #[arg(short = 'c', long = "cmd", required = true)]
        commands: Vec<String>,
        /// Never pause for approval
        #[arg(long)]
        auto_approve: bool,
        /// Number of concurrent sessions running the same plan
        #[arg(long, default_value = "1")]
        agents: usize,
        /// Per-command timeout in seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },
    /// Resume a paused session from the sqlite checkpoint store
    Resume {
        /// Session id or unique prefix
        session: String,
        /// approve | reject | modify: <command>
        #[arg(trailing_var_arg = true, required = true)]
        decision: Vec<String>,
    },
    /// Print the stored transcript of a session
    History {
        /// Session id or unique prefix
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.filter.as_str())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Exec {
            commands,
            auto_approve,
            agents,
            timeout,
        } => run_exec(&config, commands, auto_approve, agents, timeout).await,
        Commands::Resume { session, decision } => {
            run_resume(&config, &session, &decision.join(" ")).await
        }
        Commands::History { session } => run_history(&config, &session).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok(AppConfig::load(&default)?)
            } else {
                Ok(AppConfig::default())
            }
        }
    }
}

fn command_graph(
    commands: Vec<String>,
    options: CommandPlanOptions,
    timeout: Duration,
) -> anyhow::Result<Arc<GraphDefinition>> {
    let graph = command_plan_graph(
        Arc::new(StaticPlanner::new(commands)),
        Arc::new(ProcessRunner::new(timeout)),
        Arc::new(RetrySameAnalyzer),
        options,
    )?;
    Ok(Arc::new(graph))
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

async fn run_exec(
    config: &AppConfig,
    commands: Vec<String>,
    auto_approve: bool,
    agents: usize,
    timeout: u64,
) -> anyhow::Result<()> {
    let checkpointer = reactor_agent::open_checkpointer(config)?;
    let manager = AgentManager::new(checkpointer, config);
    manager.on_progress(Arc::new(
        |event: &ProgressEvent| -> std::result::Result<(), String> {
            println!(
                "[{}] {}: {}",
                short(&event.instance_id),
                event.node,
                event.message.content
            );
            Ok(())
        },
    ));

    let options = CommandPlanOptions {
        auto_approve_safe: config.approval.auto_approve_safe,
        autonomous: auto_approve,
    };
    let task = commands.join(" && ");
    let graph = command_graph(commands, options, Duration::from_secs(timeout))?;

    let mut ids = Vec::new();
    for i in 0..agents.max(1) {
        let id = manager.spawn(
            graph.clone(),
            task.clone(),
            SpawnOptions::named(format!("exec-{}", i + 1)),
        )?;
        ids.push(id);
    }
    info!(sessions = ids.len(), "Sessions started");

    let supervise_all = async {
        for id in &ids {
            supervise(&manager, id).await?;
        }
        anyhow::Ok(())
    };
    tokio::select! {
        result = supervise_all => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping sessions");
            manager.shutdown().await;
        }
    }

    print_report(&manager);
    Ok(())
}

/// Wait on one instance, answering approval requests until it settles.
async fn supervise(manager: &AgentManager, id: &str) -> anyhow::Result<()> {
    let instance = manager.get(id)?;
    loop {
        if instance.wait().await != Lifecycle::Paused {
            return Ok(());
        }
        let state = instance.state().await?.unwrap_or_default();
        let decision = prompt_decision(id.to_string(), &state).await?;
        manager.resume(id, serde_json::Value::String(decision.reply_text()))?;
    }
}

async fn prompt_decision(id: String, state: &ExecutionState) -> anyhow::Result<ApprovalDecision> {
    if let Some(command) = current_command(state) {
        println!("\n[{}] {}", short(&id), approval_prompt(&command));
    }

    let decision = tokio::task::spawn_blocking(move || -> anyhow::Result<ApprovalDecision> {
        let options = &["Approve", "Reject", "Modify"];
        let choice = dialoguer::Select::new()
            .with_prompt(format!("[{}] Decision", short(&id)))
            .items(options)
            .default(0)
            .interact()?;
        Ok(match choice {
            0 => ApprovalDecision::Approve,
            1 => ApprovalDecision::Reject,
            _ => {
                let command: String = dialoguer::Input::new()
                    .with_prompt("Replacement command")
                    .interact_text()?;
                ApprovalDecision::Modify(command)
            }
        })
    })
    .await??;
    Ok(decision)
}

fn print_report(manager: &AgentManager) {
    println!();
    for summary in manager.list() {
        println!(
            "{}  {:<10} {:<8} {}",
            short(&summary.id),
            summary.lifecycle,
            summary.agent_name,
            summary.latest_progress.lines().next().unwrap_or_default()
        );
        if let Some(err) = &summary.error {
            println!("          error: {}", err);
        }
        if let Some(node) = &summary.pending_node {
            println!("          paused before {}; resume with `reactor resume {}`", node, summary.id);
        }
    }

    let stats = manager.stats();
    let counts: Vec<String> = stats
        .by_lifecycle
        .iter()
        .map(|(lifecycle, n)| format!("{} {}", n, lifecycle))
        .collect();
    println!("\n{} session(s): {}", stats.total, counts.join(", "));
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteCheckpointer>> {
    let path = config.checkpoint.sqlite_path();
    let store = SqliteCheckpointer::open(&path)
        .with_context(|| format!("opening checkpoint store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn resolve_session(store: &SqliteCheckpointer, prefix: &str) -> anyhow::Result<SessionId> {
    let matches: Vec<SessionId> = store
        .sessions()?
        .into_iter()
        .filter(|s| s.as_str().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [one] => Ok(one.clone()),
        [] => bail!("no stored session matches '{}'", prefix),
        many => bail!("session prefix '{}' is ambiguous ({} matches)", prefix, many.len()),
    }
}

async fn run_resume(config: &AppConfig, session: &str, decision: &str) -> anyhow::Result<()> {
    if ApprovalDecision::parse(decision).is_none() {
        bail!("unrecognized decision '{}': use approve, reject or modify: <command>", decision);
    }
    let store = open_store(config)?;
    let sid = resolve_session(&store, session)?;

    // The plan lives in the checkpoint; the planner is never consulted again.
    let options = CommandPlanOptions {
        auto_approve_safe: config.approval.auto_approve_safe,
        autonomous: false,
    };
    let graph = command_graph(vec![], options, Duration::from_secs(120))?;
    let executor = GraphExecutor::new(graph, store).with_step_limit(config.executor.step_limit);

    match executor
        .resume(&sid, serde_json::Value::String(decision.to_string()))
        .await?
    {
        Outcome::Completed(state) => {
            print_transcript_tail(&state);
            println!("\nSession {} completed", sid);
        }
        Outcome::Interrupted { pending_node, state } => {
            if let Some(command) = current_command(&state) {
                println!("{}", approval_prompt(&command));
            }
            println!("\nSession {} paused before {}", sid, pending_node);
        }
    }
    Ok(())
}

fn print_transcript_tail(state: &ExecutionState) {
    if let Some(last) = state.messages.iter().rev().find(|m| m.role == Role::Assistant) {
        println!("{}", last.content);
    }
}

async fn run_history(config: &AppConfig, session: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let sid = resolve_session(&store, session)?;
    let Some(cp) = reactor_core::Checkpointer::load(store.as_ref(), &sid).await? else {
        bail!("no checkpoint for session {}", sid);
    };

    for msg in &cp.state.messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        println!("--- {} ---\n{}\n", role, msg.content);
    }
    let status = match (&cp.pending_node, &cp.cursor) {
        (Some(node), _) => format!("paused before {}", node),
        (None, Some(node)) => format!("interrupted mid-run, next node {}", node),
        (None, None) => "finished".to_string(),
    };
    println!("Session {} ({} steps): {}", sid, cp.step, status);
    Ok(())
}
