//! `foreman` command-line runner.

use clap::{Parser, Subcommand};
use foreman_orchestrator::{
    fn_handler, GoalInput, Orchestrator, OrchestratorConfig, TaskContext, PLAN_STEP_TASK,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman multi-agent orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with the configured schedule until Ctrl-C
    Run,
    /// Print the heuristic plan for a goal as JSON
    Plan {
        /// Goal description
        goal: String,
        /// Constraint the plan must respect (repeatable)
        #[arg(short = 'C', long = "constraint")]
        constraints: Vec<String>,
        /// Success criterion (repeatable)
        #[arg(short, long = "criterion")]
        criteria: Vec<String>,
    },
    /// Validate the config file
    Check,
}

/// A missing config file means defaults; a broken one is an error.
async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if tokio::fs::try_exists(path).await? {
        Ok(OrchestratorConfig::load(path).await?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(OrchestratorConfig::default())
    }
}

async fn run(config: OrchestratorConfig) -> anyhow::Result<()> {
    let jobs = config.schedule.len();
    let engine = Arc::new(Orchestrator::builder(config).build()?);

    let echo = fn_handler(|ctx: TaskContext| async move {
        info!(task_id = %ctx.task_id(), payload = %ctx.payload(), "echo");
        Ok(ctx.payload().clone())
    });
    engine.register_handler("echo", Arc::clone(&echo));
    engine.register_handler(PLAN_STEP_TASK, echo);

    engine.start();
    info!(scheduled_jobs = jobs, "Foreman running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    engine.shutdown().await;

    let stats = engine.queue().stats().await?;
    info!(
        queued = stats.queued,
        completed = stats.completed,
        failed = stats.failed,
        "Final queue state"
    );
    Ok(())
}

async fn plan(
    mut config: OrchestratorConfig,
    goal: String,
    constraints: Vec<String>,
    criteria: Vec<String>,
) -> anyhow::Result<()> {
    config.planner.use_llm = false;
    let engine = Orchestrator::builder(config).build()?;
    let planner = engine.planner();

    let goal = planner.create_goal(GoalInput {
        description: goal,
        constraints,
        success_criteria: criteria,
        ..Default::default()
    });
    let plan = planner.generate_plan(goal.id).await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(load_config(&cli.config).await?).await,
        Commands::Plan {
            goal,
            constraints,
            criteria,
        } => plan(load_config(&cli.config).await?, goal, constraints, criteria).await,
        Commands::Check => {
            let config = OrchestratorConfig::load(&cli.config).await?;
            println!(
                "{}: ok (max_queue_size={}, idle_timeout_ms={}, max_sub_agents_per_parent={}, scheduled_jobs={})",
                cli.config.display(),
                config.queue.max_queue_size,
                config.lifecycle.idle_timeout_ms,
                config.factory.max_sub_agents_per_parent,
                config.schedule.len()
            );
            Ok(())
        }
    }
}
