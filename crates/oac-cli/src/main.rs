mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use oac_core::harness::{ClaudeCodeAdapter, CodexAdapter, GenericAdapter};
use oac_core::model::WorkItem;
use oac_core::{AgentRegistry, Engine, EngineConfig, EventBus, OacError, Topic};

use config::RunConfig;

/// Run a budget-constrained multi-agent execution over a pre-planned set
/// of work items. The plan (discovery + token estimation) is produced by
/// a collaborator and handed to this binary as a JSON file; this binary
/// only wires it into the engine and reports the outcome.
#[derive(Parser)]
#[command(name = "oac", about = "Budget-constrained multi-agent code contribution runner")]
struct Cli {
    /// Path to a JSON file containing an array of work items.
    #[arg(long)]
    input: PathBuf,

    /// Local clone of the target repository.
    #[arg(long)]
    repo_path: PathBuf,

    /// Default branch to fork sandboxes from and diff against.
    #[arg(long)]
    base_branch: Option<String>,

    /// Branch name prefix (`<prefix>/<yyyymmdd>/...`).
    #[arg(long)]
    branch_prefix: Option<String>,

    /// Agent provider ids to round-robin across, e.g. `claude-code,codex`.
    #[arg(long, value_delimiter = ',')]
    providers: Option<Vec<String>>,

    /// Maximum number of jobs running concurrently.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Maximum attempts per job before it is marked failed.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Per-job wall-clock timeout, in milliseconds.
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Total token budget for this run.
    #[arg(long)]
    token_budget: Option<u64>,

    /// Compute and print the execution plan without running any agents.
    #[arg(long)]
    dry_run: bool,
}

/// Builds the agent registry the engine round-robins across. Providers
/// not named on `--providers` are simply never resolved.
fn build_registry() -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    registry.register("claude-code", || Box::new(ClaudeCodeAdapter::new()));
    registry.register("codex", || Box::new(CodexAdapter::new()));
    registry.register("generic", || Box::new(GenericAdapter::new("generic", "oac-agent")));
    Arc::new(registry)
}

fn read_work_items(path: &PathBuf) -> anyhow::Result<Vec<WorkItem>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read input file at {}", path.display()))?;
    let items: Vec<WorkItem> = serde_json::from_str(&contents).context("input file is not a valid array of work items")?;
    Ok(items)
}

/// Estimates tokens for every item against the first configured
/// provider, pairs it with the item, and hands the result to the
/// planner. A single provider's estimate is representative enough for
/// planning purposes; per-provider re-estimation happens at dispatch
/// time inside the engine's worker.
fn estimate_all(registry: &AgentRegistry, provider: &str, repo_path: &std::path::Path, items: Vec<WorkItem>) -> anyhow::Result<Vec<(WorkItem, oac_core::model::TokenEstimate)>> {
    let adapter = match registry.resolve(provider) {
        oac_core::registry::Resolution::Factory(factory) => factory(),
        oac_core::registry::Resolution::Missing => anyhow::bail!("unknown provider: {provider}"),
    };

    let mut pairs: Vec<(WorkItem, oac_core::model::TokenEstimate)> = items
        .into_iter()
        .map(|item| {
            let prompt = oac_core::worker::build_prompt(&item);
            let estimate = adapter.estimate_tokens(repo_path, &prompt, &item.target_files, item.complexity);
            (item, estimate)
        })
        .collect();

    // Planner requires priority desc, title asc (§4.6).
    pairs.sort_by(|(a, _), (b, _)| b.priority.cmp(&a.priority).then_with(|| a.title.cmp(&b.title)));
    Ok(pairs)
}

fn print_plan_summary(plan: &oac_core::model::ExecutionPlan) {
    println!(
        "plan: {} selected, {} deferred, {} tokens reserved, {} tokens remaining",
        plan.selected.len(),
        plan.deferred.len(),
        plan.reserve_tokens,
        plan.remaining_tokens
    );
    for entry in &plan.deferred {
        println!("  deferred {} ({:?}): {}", entry.item.id, entry.reason, entry.item.title);
    }
}

fn print_run_summary(result: &oac_core::model::RunResult) {
    println!("completed: {}, failed: {}, aborted: {}", result.completed.len(), result.failed.len(), result.aborted.len());
    for job in &result.failed {
        println!("  failed {} ({}): {}", job.item.id, job.agent_id.as_deref().unwrap_or("?"), job.error_message.as_deref().unwrap_or("unknown error"));
    }
}

/// Exit code per §6: 0 = all succeeded or dry-run; 1 = unhandled error;
/// 2 = config/validation; 3 = every job failed; 4 = partial success.
fn exit_code_for(result: &oac_core::model::RunResult) -> i32 {
    if result.completed.is_empty() && (!result.failed.is_empty() || !result.aborted.is_empty()) {
        3
    } else if !result.failed.is_empty() || !result.aborted.is_empty() {
        4
    } else {
        0
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let run_config = RunConfig::resolve(cli.providers, cli.branch_prefix, cli.concurrency, cli.max_attempts, cli.task_timeout_ms, cli.token_budget, cli.base_branch)?;

    let items = read_work_items(&cli.input)?;
    if items.is_empty() {
        tracing::warn!("input file contained no work items");
    }

    let registry = build_registry();
    let primary_provider = run_config.providers[0].clone();
    let pairs = estimate_all(&registry, &primary_provider, &cli.repo_path, items)?;
    let plan = oac_core::plan_budget(&pairs, run_config.token_budget);
    print_plan_summary(&plan);

    if cli.dry_run {
        return Ok(0);
    }

    if plan.selected.is_empty() {
        println!("nothing to run");
        return Ok(0);
    }

    let bus = EventBus::new();
    bus.on(Topic::ExecutionProgress, |payload| {
        tracing::info!(%payload, "execution progress");
    });
    bus.on(Topic::ExecutionFailed, |payload| {
        tracing::warn!(%payload, "execution failed");
    });

    let mut engine_config = EngineConfig::new(cli.repo_path.clone(), run_config.base_branch.clone(), run_config.branch_prefix.clone());
    engine_config.concurrency = run_config.concurrency;
    engine_config.max_attempts = run_config.max_attempts;
    engine_config.task_timeout_ms = run_config.task_timeout_ms;
    engine_config.default_token_budget = run_config.token_budget;

    let engine = Engine::new(engine_config, run_config.providers.clone(), registry, bus).map_err(anyhow::Error::from)?;
    engine.enqueue(&plan);
    let result = engine.run().await.map_err(anyhow::Error::from)?;

    print_run_summary(&result);
    Ok(exit_code_for(&result))
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(error) => {
            eprintln!("{error:#}");
            let code = if error.downcast_ref::<OacError>().map(|e| matches!(e.severity, oac_core::Severity::Fatal)).unwrap_or(false) { 2 } else { 1 };
            std::process::ExitCode::from(code as u8)
        }
    }
}
