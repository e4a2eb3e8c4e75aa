//! Worker (§4.4): builds the agent prompt from a work item, drives one
//! adapter execution, and merges its result with observed progress.
//! Grounded on the teacher's lifecycle step functions (`lifecycle/mod.rs`)
//! for the shape of a single "do the work, emit progress, normalize
//! failure" unit, adapted from a DB-backed step to a pure async function.

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::error::{normalize, NormalizeContext, OacError};
use crate::events::{EventBus, Topic};
use crate::harness::{Adapter, AgentEvent, ExecuteParams, FileAction, OutputStream};
use crate::model::{ExecutionMode, JobResult, WorkItem};
use crate::worktree::Sandbox;

const DEFAULT_TOKEN_BUDGET: u64 = 50_000;
const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Caller-supplied overrides layered over the task's own metadata and the
/// engine's defaults (§4.4 point 2: `opts ∪ task.metadata ∪ default`).
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub execution_id: Option<Uuid>,
    pub token_budget: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub allow_commits: bool,
}

fn effective_token_budget(opts: &WorkerOptions, item: &WorkItem) -> u64 {
    opts.token_budget
        .or_else(|| item.metadata.get("tokenBudget").and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_TOKEN_BUDGET)
}

fn effective_timeout_ms(opts: &WorkerOptions, item: &WorkItem) -> u64 {
    opts.timeout_ms
        .or_else(|| item.metadata.get("timeoutMs").and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

/// Builds the prompt described in §4.4 point 1.
pub fn build_prompt(item: &WorkItem) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Task: {}\n", item.id));
    prompt.push_str(&format!("Title: {}\n", item.title));
    prompt.push_str(&format!("Source: {:?}\n", item.source));
    prompt.push_str(&format!("Priority: {}\n", item.priority));
    prompt.push_str(&format!("Complexity: {:?}\n", item.complexity));
    prompt.push_str(&format!("Execution mode: {}\n", execution_mode_label(item.execution_mode)));

    if let Some(issue) = &item.linked_issue {
        prompt.push_str(&format!(
            "Linked issue: #{} ({}) [{}] -- resolve this issue completely.\n",
            issue.number,
            issue.url,
            issue.labels.join(", ")
        ));
    }

    prompt.push_str(&format!("\nDescription:\n{}\n", item.description));

    if !item.target_files.is_empty() {
        prompt.push_str("\nTarget files:\n");
        for file in &item.target_files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }

    prompt.push_str("\nApply minimal, safe changes; repository must remain buildable.\n");
    prompt
}

fn execution_mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::NewBranchPr => "new-branch-pr",
        ExecutionMode::UpdatePr => "update-pr",
        ExecutionMode::DirectCommit => "direct-commit",
    }
}

fn stage_label(event: &AgentEvent) -> String {
    match event {
        AgentEvent::Output { stream: OutputStream::Stdout, .. } => "stdout".to_string(),
        AgentEvent::Output { stream: OutputStream::Stderr, .. } => "stderr".to_string(),
        AgentEvent::Tokens { .. } => "tokens".to_string(),
        AgentEvent::FileEdit { action, .. } => format!("file:{}", action.as_str()),
        AgentEvent::ToolUse { tool, .. } => format!("tool:{tool}"),
        AgentEvent::Error { recoverable: true, .. } => "agent-warning".to_string(),
        AgentEvent::Error { recoverable: false, .. } => "agent-error".to_string(),
    }
}

fn event_payload(event: &AgentEvent, job_id: Uuid) -> serde_json::Value {
    let stage = stage_label(event);
    match event {
        AgentEvent::Output { content, .. } => json!({ "jobId": job_id, "stage": stage, "content": content }),
        AgentEvent::Tokens { input, output, cumulative } => {
            json!({ "jobId": job_id, "stage": stage, "input": input, "output": output, "cumulative": cumulative })
        }
        AgentEvent::FileEdit { path, .. } => json!({ "jobId": job_id, "stage": stage, "path": path }),
        AgentEvent::ToolUse { tool, input } => json!({ "jobId": job_id, "stage": stage, "tool": tool, "input": input }),
        AgentEvent::Error { message, .. } => json!({ "jobId": job_id, "stage": stage, "message": message }),
    }
}

/// `execute(agent, task, sandbox, bus, opts) → Result<JobResult, OacError>`
/// (§4.4).
pub async fn execute(
    agent: &dyn Adapter,
    item: &WorkItem,
    sandbox: &Sandbox,
    bus: &EventBus,
    base_branch: &str,
    job_id: Uuid,
    attempt: u32,
    opts: WorkerOptions,
) -> Result<JobResult, OacError> {
    let execution_id = opts.execution_id.unwrap_or(job_id);
    let started = Instant::now();

    let ctx = || NormalizeContext {
        task_id: Some(item.id.clone()),
        job_id: Some(job_id.to_string()),
        execution_id: Some(execution_id.to_string()),
        attempt: Some(attempt),
        is_abort: false,
    };

    let params = ExecuteParams {
        execution_id,
        working_directory: sandbox.path.clone(),
        prompt: build_prompt(item),
        target_files: item.target_files.clone(),
        token_budget: effective_token_budget(&opts, item),
        allow_commits: opts.allow_commits,
        timeout_ms: effective_timeout_ms(&opts, item),
        env: std::collections::HashMap::new(),
    };

    let execution = agent.execute(params).await.map_err(|e| normalize(&e.to_string(), ctx()))?;

    let observed_tokens = AtomicU64::new(0);
    let observed_files: StdMutex<std::collections::HashSet<String>> = StdMutex::new(std::collections::HashSet::new());

    loop {
        match execution.events.next().await {
            Ok(Some(event)) => {
                match &event {
                    AgentEvent::Tokens { cumulative, .. } => {
                        observed_tokens.fetch_max(*cumulative, Ordering::Relaxed);
                    }
                    AgentEvent::FileEdit { path, .. } => {
                        observed_files.lock().unwrap().insert(path.clone());
                    }
                    _ => {}
                }
                bus.emit(Topic::ExecutionProgress, event_payload(&event, job_id));
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    let agent_result = match execution.result.await {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => return Err(normalize(&error.to_string(), ctx())),
        Err(_) => return Err(normalize("agent result channel dropped before completion", ctx())),
    };

    let mut files_changed: std::collections::HashSet<String> = observed_files.into_inner().unwrap();
    files_changed.extend(agent_result.files_changed.iter().cloned());
    let total_tokens_used = agent_result.total_tokens_used.max(observed_tokens.load(Ordering::Relaxed));

    let tag = item.source_tag();
    commit_sandbox_changes(&sandbox.path, &tag, &item.title).map_err(|e| normalize(&e, ctx()))?;
    let diffed = diff_against_base(&sandbox.path, base_branch).unwrap_or_default();
    for path in diffed {
        files_changed.insert(path);
    }

    let success = agent_result.success || !files_changed.is_empty();
    if !success {
        return Err(normalize(
            &format!("agent exited with code {} and produced no changes", agent_result.exit_code),
            ctx(),
        )
        .with_context("exitCode", agent_result.exit_code.to_string()));
    }

    Ok(JobResult {
        success,
        total_tokens_used,
        files_changed: files_changed.into_iter().collect(),
        duration_ms: started.elapsed().as_millis() as u64,
        branch_name: sandbox.branch.clone(),
    })
}

fn commit_sandbox_changes(dir: &std::path::Path, tag: &str, title: &str) -> Result<(), String> {
    run_git(dir, &["add", "-A"])?;
    let message = format!("[{tag}] {title}");
    // A commit with nothing staged exits non-zero; that's expected when the
    // agent already committed on its own, so it's not an error here.
    let _ = Command::new("git").args(["commit", "-m", &message]).current_dir(dir).output();
    Ok(())
}

fn diff_against_base(dir: &std::path::Path, base_branch: &str) -> Result<Vec<String>, String> {
    let output = run_git_output(dir, &["diff", "--name-only", &format!("origin/{base_branch}"), "HEAD"])?;
    Ok(output.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

fn run_git(dir: &std::path::Path, args: &[&str]) -> Result<(), String> {
    let status = Command::new("git").args(args).current_dir(dir).status().map_err(|e| e.to_string())?;
    if !status.success() {
        return Err(format!("git {args:?} failed with {status}"));
    }
    Ok(())
}

fn run_git_output(dir: &std::path::Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git").args(args).current_dir(dir).output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!("git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl WorkItem {
    /// Short tag used in the commit message subject; mirrors the
    /// provider-agnostic style of `[lint] Fix unused import`.
    fn source_tag(&self) -> String {
        format!("{:?}", self.source).to_lowercase()
    }
}
