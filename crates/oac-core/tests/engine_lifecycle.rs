//! End-to-end exercises of the engine against a scripted adapter: each
//! attempt plays back a fixed event sequence and terminal outcome, so the
//! engine's retry/abort/budget wiring can be driven without a real agent
//! CLI. Scripts and assertions mirror the literal scenarios used to
//! design the per-job lifecycle (§4.5).

use std::collections::{HashMap, VecDeque};
use std::process::Command;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use oac_core::error::{ErrorKind, Severity};
use oac_core::harness::{AgentEvent, AgentResult, Availability, Execution, FileAction};
use oac_core::model::{
    Complexity, ExecutionMode, ExecutionPlan, SelectedEntry, SourceKind, TokenEstimate, WorkItem,
};
use oac_core::{AgentRegistry, Engine, EngineConfig, EventBus, JobStatus, Topic};
use uuid::Uuid;

/// One attempt's scripted behavior: a sequence of progress events,
/// followed by either success, an error message to classify, or a hang
/// that only resolves once `abort()` is called on that execution.
#[derive(Clone)]
enum Outcome {
    Success(AgentResult),
    Failure(String),
    HoldForAbort,
}

#[derive(Clone)]
struct Script {
    events: Vec<AgentEvent>,
    outcome: Outcome,
}

/// Adapter whose behavior across attempts is driven by a shared,
/// FIFO-consumed script queue. Shared (not per-instance) because the
/// engine's round-robin selection asks the registry for a fresh adapter
/// instance on every attempt -- state that should persist across retries
/// has to live outside the adapter itself.
struct ScriptedAdapter {
    id: String,
    scripts: Arc<StdMutex<VecDeque<Script>>>,
    pending_aborts: Arc<StdMutex<HashMap<Uuid, tokio::sync::oneshot::Sender<()>>>>,
}

#[async_trait]
impl oac_core::harness::Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.id
    }

    async fn check_availability(&self) -> Availability {
        Availability { available: true, version: Some("test".to_string()), error: None }
    }

    fn estimate_tokens(
        &self,
        _repo_root: &std::path::Path,
        _prompt: &str,
        _target_files: &[String],
        _complexity: Complexity,
    ) -> TokenEstimate {
        TokenEstimate { context_tokens: 0, prompt_tokens: 0, expected_output: 0, total: 0, confidence: 0.9, feasible: true }
    }

    async fn execute(&self, params: oac_core::harness::ExecuteParams) -> Result<Execution> {
        let script = self.scripts.lock().unwrap().pop_front().expect("scripted adapter ran out of scripts");
        let queue = Arc::new(oac_core::harness::event_queue::EventQueue::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let execution_id = params.execution_id;
        let queue2 = Arc::clone(&queue);

        match script.outcome {
            Outcome::Success(result) => {
                tokio::spawn(async move {
                    for event in script.events {
                        queue2.push(event);
                    }
                    queue2.close();
                    let _ = tx.send(Ok(result));
                });
            }
            Outcome::Failure(message) => {
                tokio::spawn(async move {
                    for event in script.events {
                        queue2.push(event);
                    }
                    queue2.close();
                    let _ = tx.send(Err(anyhow::anyhow!(message)));
                });
            }
            Outcome::HoldForAbort => {
                let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
                self.pending_aborts.lock().unwrap().insert(execution_id, abort_tx);
                tokio::spawn(async move {
                    for event in script.events {
                        queue2.push(event);
                    }
                    let _ = abort_rx.await;
                    queue2.fail(oac_core::error::OacError::new(ErrorKind::AgentExecutionFailed, Severity::Recoverable, "aborted"));
                    let _ = tx.send(Err(anyhow::anyhow!("aborted")));
                });
            }
        }

        Ok(Execution { execution_id, events: queue, result: rx, pid: None })
    }

    async fn abort(&self, execution_id: Uuid) -> Result<()> {
        if let Some(sender) = self.pending_aborts.lock().unwrap().remove(&execution_id) {
            let _ = sender.send(());
        }
        Ok(())
    }
}

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        let status = Command::new("git").args(args).current_dir(dir.path()).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-q", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "hi").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-q", "-m", "init"]);
    run(&["remote", "add", "origin", "."]);
    run(&["fetch", "-q", "origin"]);
    dir
}

fn work_item(id: &str, priority: u8) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        source: SourceKind::Lint,
        title: format!("task {id}"),
        description: "do the thing".to_string(),
        target_files: vec![],
        priority,
        complexity: Complexity::Simple,
        execution_mode: ExecutionMode::NewBranchPr,
        linked_issue: None,
        metadata: HashMap::new(),
        discovered_at: Utc::now(),
    }
}

fn estimate() -> TokenEstimate {
    TokenEstimate { context_tokens: 0, prompt_tokens: 0, expected_output: 0, total: 0, confidence: 0.9, feasible: true }
}

fn plan_of(items: Vec<WorkItem>) -> ExecutionPlan {
    let selected: Vec<SelectedEntry> = items.into_iter().map(|item| SelectedEntry { item, estimate: estimate(), cumulative_budget_used: 0 }).collect();
    ExecutionPlan { total_budget: 10_000, reserve_tokens: 0, selected, deferred: vec![], remaining_tokens: 10_000 }
}

fn registry_with(scripts: Arc<StdMutex<VecDeque<Script>>>) -> (Arc<AgentRegistry>, Arc<StdMutex<HashMap<Uuid, tokio::sync::oneshot::Sender<()>>>>) {
    let pending_aborts = Arc::new(StdMutex::new(HashMap::new()));
    let mut registry = AgentRegistry::new();
    let scripts_clone = Arc::clone(&scripts);
    let aborts_clone = Arc::clone(&pending_aborts);
    registry.register("stub", move || {
        Box::new(ScriptedAdapter { id: "stub".to_string(), scripts: Arc::clone(&scripts_clone), pending_aborts: Arc::clone(&aborts_clone) })
    });
    (Arc::new(registry), pending_aborts)
}

#[tokio::test]
async fn happy_path_single_job_completes_with_observed_tokens_and_files() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![Script {
        events: vec![
            AgentEvent::Tokens { input: 500, output: 300, cumulative: 800 },
            AgentEvent::FileEdit { action: FileAction::Modify, path: "src/x.ts".to_string() },
            AgentEvent::Tokens { input: 500, output: 400, cumulative: 900 },
        ],
        outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 900, files_changed: vec![], duration_ms: 10, error: None }),
    }])));
    let (registry, _aborts) = registry_with(scripts);

    let bus = EventBus::new();
    let started = Arc::new(StdMutex::new(0usize));
    let completed = Arc::new(StdMutex::new(0usize));
    let s = Arc::clone(&started);
    bus.on(Topic::ExecutionStarted, move |_| *s.lock().unwrap() += 1);
    let c = Arc::clone(&completed);
    bus.on(Topic::ExecutionCompleted, move |_| *c.lock().unwrap() += 1);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, bus).unwrap();
    engine.enqueue(&plan_of(vec![work_item("a", 50)]));
    let result = engine.run().await.unwrap();

    assert_eq!(result.completed.len(), 1);
    assert!(result.failed.is_empty());
    assert!(result.aborted.is_empty());
    let job = &result.completed[0];
    let job_result = job.result.as_ref().unwrap();
    assert_eq!(job_result.total_tokens_used, 900);
    assert!(job_result.files_changed.contains(&"src/x.ts".to_string()));
    assert_eq!(*started.lock().unwrap(), 1);
    assert_eq!(*completed.lock().unwrap(), 1);
}

#[tokio::test]
async fn transient_failure_retries_and_succeeds_on_second_attempt() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::Failure("request timed out after 30s".to_string()) },
        Script {
            events: vec![AgentEvent::FileEdit { action: FileAction::Modify, path: "src/y.ts".to_string() }],
            outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 100, files_changed: vec![], duration_ms: 5, error: None }),
        },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let bus = EventBus::new();
    let started = Arc::new(StdMutex::new(0usize));
    let failed = Arc::new(StdMutex::new(0usize));
    let s = Arc::clone(&started);
    bus.on(Topic::ExecutionStarted, move |_| *s.lock().unwrap() += 1);
    let f = Arc::clone(&failed);
    bus.on(Topic::ExecutionFailed, move |_| *f.lock().unwrap() += 1);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    config.max_attempts = 2;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, bus).unwrap();
    engine.enqueue(&plan_of(vec![work_item("b", 50)]));
    let result = engine.run().await.unwrap();

    assert_eq!(result.completed.len(), 1);
    assert!(result.failed.is_empty());
    assert_eq!(result.completed[0].attempt, 2);
    assert_eq!(*started.lock().unwrap(), 2);
    assert_eq!(*failed.lock().unwrap(), 0, "a retried-then-succeeded job must never emit execution:failed");

    let log = engine.audit_log();
    assert!(log.iter().any(|e| e.status == JobStatus::Retrying));
    assert!(log.iter().any(|e| e.status == JobStatus::Completed));
}

#[tokio::test]
async fn permanent_failure_exhausts_attempts_and_reports_the_classified_kind() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::Failure("process ran out of memory".to_string()) },
        Script { events: vec![], outcome: Outcome::Failure("process ran out of memory".to_string()) },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let bus = EventBus::new();
    let failed = Arc::new(StdMutex::new(0usize));
    let f = Arc::clone(&failed);
    bus.on(Topic::ExecutionFailed, move |_| *f.lock().unwrap() += 1);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    config.max_attempts = 2;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, bus).unwrap();
    engine.enqueue(&plan_of(vec![work_item("c", 50)]));
    let result = engine.run().await.unwrap();

    assert!(result.completed.is_empty());
    assert_eq!(result.failed.len(), 1);
    let job = &result.failed[0];
    assert_eq!(job.attempt, 2);
    assert_eq!(job.error, Some(ErrorKind::AgentOom));
    assert_eq!(*failed.lock().unwrap(), 1, "execution:failed must fire exactly once");
}

#[tokio::test]
async fn max_attempts_of_one_disables_retry() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![Script {
        events: vec![],
        outcome: Outcome::Failure("request timed out".to_string()),
    }])));
    let (registry, _aborts) = registry_with(scripts);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    config.max_attempts = 1;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, EventBus::new()).unwrap();
    engine.enqueue(&plan_of(vec![work_item("d", 50)]));
    let result = engine.run().await.unwrap();

    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].attempt, 1);
}

#[tokio::test]
async fn abort_mid_run_ends_queued_and_running_jobs_as_aborted_with_no_completions() {
    let repo = init_repo();
    // 5 jobs, concurrency 2: the first 2 dispatch and hang until aborted;
    // scripts 3-5 are never consumed.
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::HoldForAbort },
        Script { events: vec![], outcome: Outcome::HoldForAbort },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let bus = EventBus::new();
    let completed = Arc::new(StdMutex::new(0usize));
    let c = Arc::clone(&completed);
    bus.on(Topic::ExecutionCompleted, move |_| *c.lock().unwrap() += 1);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 2;
    let engine = Arc::new(Engine::new(config, vec!["stub".to_string()], registry, bus).unwrap());
    let items: Vec<WorkItem> = (0..5).map(|i| work_item(&format!("job{i}"), 50)).collect();
    engine.enqueue(&plan_of(items));

    let run_engine = Arc::clone(&engine);
    let run_handle = tokio::spawn(async move { run_engine.run().await.unwrap() });

    // Give the first two jobs a moment to reach "running" before aborting.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.abort().await;

    let result = run_handle.await.unwrap();

    assert!(result.completed.is_empty(), "no job may reach execution:completed once aborted");
    assert_eq!(result.aborted.len(), 5);
    assert_eq!(*completed.lock().unwrap(), 0);
}

#[tokio::test]
async fn empty_plan_returns_immediately_with_empty_partitions() {
    let repo = init_repo();
    let (registry, _aborts) = registry_with(Arc::new(StdMutex::new(VecDeque::new())));
    let engine = Engine::new(EngineConfig::new(repo.path(), "main", "oac"), vec!["stub".to_string()], registry, EventBus::new()).unwrap();
    engine.enqueue(&plan_of(vec![]));
    let result = engine.run().await.unwrap();
    assert!(result.completed.is_empty());
    assert!(result.failed.is_empty());
    assert!(result.aborted.is_empty());
}

#[tokio::test]
async fn concurrency_of_one_serializes_jobs() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, EventBus::new()).unwrap();
    let items: Vec<WorkItem> = (0..3).map(|i| work_item(&format!("s{i}"), 50)).collect();
    engine.enqueue(&plan_of(items));
    let result = engine.run().await.unwrap();

    assert_eq!(result.completed.len(), 3);

    let log = engine.audit_log();
    let mut intervals: HashMap<Uuid, (chrono::DateTime<Utc>, chrono::DateTime<Utc>)> = HashMap::new();
    for event in &log {
        let entry = intervals.entry(event.job_id).or_insert((event.at, event.at));
        match event.status {
            JobStatus::Running => entry.0 = event.at,
            JobStatus::Completed => entry.1 = event.at,
            _ => {}
        }
    }
    let mut ordered: Vec<_> = intervals.into_values().collect();
    ordered.sort_by_key(|(start, _)| *start);
    for pair in ordered.windows(2) {
        let (_, prev_end) = pair[0];
        let (next_start, _) = pair[1];
        assert!(next_start >= prev_end, "concurrency=1 must never overlap two jobs' running windows");
    }
}

#[tokio::test]
async fn abort_during_retry_backoff_still_accounts_for_the_job() {
    let repo = init_repo();
    // Attempt 1 times out (transient, max_attempts=2) and goes Retrying,
    // sleeping in its backoff delay; the second script is never reached
    // because abort() fires while the job is still asleep.
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::Failure("request timed out".to_string()) },
        Script { events: vec![], outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }) },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    config.max_attempts = 2;
    let engine = Arc::new(Engine::new(config, vec!["stub".to_string()], registry, EventBus::new()).unwrap());
    engine.enqueue(&plan_of(vec![work_item("e", 50)]));

    let run_engine = Arc::clone(&engine);
    let run_handle = tokio::spawn(async move { run_engine.run().await.unwrap() });

    // Let the first attempt fail and the job settle into its backoff sleep.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(engine.audit_log().iter().filter(|e| e.status == JobStatus::Retrying).count(), 1);
    engine.abort().await;

    let result = run_handle.await.unwrap();

    assert!(result.completed.is_empty());
    assert!(result.failed.is_empty());
    assert_eq!(result.aborted.len(), 1, "a job asleep in its retry backoff must still be accounted for as aborted");
}

#[tokio::test]
async fn no_available_agent_fails_the_job_as_agent_not_available() {
    let repo = init_repo();
    // Three consecutive non-transient failures on the sole provider trip
    // its circuit breaker; the fourth job finds no selectable agent.
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![
        Script { events: vec![], outcome: Outcome::Failure("validation failed".to_string()) },
        Script { events: vec![], outcome: Outcome::Failure("validation failed".to_string()) },
        Script { events: vec![], outcome: Outcome::Failure("validation failed".to_string()) },
    ])));
    let (registry, _aborts) = registry_with(scripts);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, EventBus::new()).unwrap();
    let items = vec![work_item("a", 40), work_item("b", 30), work_item("c", 20), work_item("d", 10)];
    engine.enqueue(&plan_of(items));
    let result = engine.run().await.unwrap();

    assert_eq!(result.failed.len(), 4);
    let last = result.failed.iter().find(|j| j.item.id == "d").unwrap();
    assert_eq!(last.error, Some(ErrorKind::AgentNotAvailable));
    assert_eq!(last.attempt, 1, "no-agent-available is fatal, not retried");
}

#[tokio::test]
async fn branch_names_match_the_documented_shape() {
    let repo = init_repo();
    let scripts = Arc::new(StdMutex::new(VecDeque::from(vec![Script {
        events: vec![],
        outcome: Outcome::Success(AgentResult { success: true, exit_code: 0, total_tokens_used: 1, files_changed: vec![], duration_ms: 1, error: None }),
    }])));
    let (registry, _aborts) = registry_with(scripts);

    let mut config = EngineConfig::new(repo.path(), "main", "oac");
    config.concurrency = 1;
    let engine = Engine::new(config, vec!["stub".to_string()], registry, EventBus::new()).unwrap();
    engine.enqueue(&plan_of(vec![work_item("Weird Task!!", 50)]));
    let result = engine.run().await.unwrap();

    let branch = &result.completed[0].result.as_ref().unwrap().branch_name;
    let re = regex::Regex::new(r"^oac/[0-9]{8}/[a-z0-9/_-]+-[0-9a-f]{8}-a[0-9]+$").unwrap();
    assert!(re.is_match(branch), "branch name {branch} does not match the documented shape");
}
