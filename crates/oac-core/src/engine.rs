//! Execution Engine (§4.5): a bounded-concurrency priority queue driving
//! jobs through queued → running → (retrying | completed | failed |
//! aborted), with round-robin agent selection behind a per-provider
//! circuit breaker.
//!
//! Grounded on the teacher's `orchestrator/mod.rs` (semaphore + notify
//! loop, non-reentrant `run`) and `lifecycle/mod.rs` (the numbered
//! per-job step sequence), stripped of the DB-backed plan/task tables --
//! job state here lives entirely in memory for the duration of one run.

use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::error::{normalize, ErrorKind, NormalizeContext, OacError};
use crate::events::{EventBus, Topic};
use crate::harness::Adapter;
use crate::model::{ExecutionPlan, Job, JobStatus, RunResult};
use crate::registry::{AgentRegistry, Resolution};
use crate::worker::{self, WorkerOptions};
use crate::worktree::WorktreeFactory;

/// One append-only record of a job crossing a status boundary. Kept
/// alongside the event bus (which is fire-and-forget and has no
/// observers by default) so a run can be reconstructed after the fact
/// even if nothing was listening on the bus while it happened.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LifecycleEvent {
    pub job_id: Uuid,
    pub task_id: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub agent_id: Option<String>,
    pub at: chrono::DateTime<Utc>,
}

/// Construction invariants (§4.5): concurrency and max_attempts clamp to
/// at least 1; the rest are plain knobs with the stated defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    pub task_timeout_ms: u64,
    pub default_token_budget: u64,
}

impl EngineConfig {
    pub fn new(repo_path: impl Into<PathBuf>, base_branch: impl Into<String>, branch_prefix: impl Into<String>) -> Self {
        Self {
            concurrency: 2,
            max_attempts: 2,
            repo_path: repo_path.into(),
            base_branch: base_branch.into(),
            branch_prefix: branch_prefix.into(),
            task_timeout_ms: 300_000,
            default_token_budget: 50_000,
        }
    }
}

struct QueueEntry {
    priority: u8,
    seq: u64,
    job_id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; higher priority pops first, and among
        // equal priorities the earliest-enqueued (lowest seq) pops first.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RunningHandle {
    adapter: Arc<dyn Adapter>,
    execution_id: Uuid,
}

struct EngineState {
    config: EngineConfig,
    providers: Vec<String>,
    registry: Arc<AgentRegistry>,
    bus: EventBus,
    worktree_factory: WorktreeFactory,
    jobs: StdMutex<HashMap<Uuid, Job>>,
    queue: StdMutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    next_seq: AtomicU64,
    round_robin: AtomicUsize,
    circuit: CircuitBreaker,
    aborted: AtomicBool,
    started: AtomicBool,
    in_flight: AtomicUsize,
    pending_retries: AtomicUsize,
    running: StdMutex<HashMap<Uuid, RunningHandle>>,
    audit_log: StdMutex<Vec<LifecycleEvent>>,
}

fn record_transition(state: &EngineState, job_id: Uuid, task_id: &str, status: JobStatus, attempt: u32, agent_id: Option<String>) {
    state.audit_log.lock().unwrap().push(LifecycleEvent { job_id, task_id: task_id.to_string(), status, attempt, agent_id, at: Utc::now() });
}

/// Bounded-concurrency priority queue of jobs, driven to completion by
/// `run()`. Not re-entrant: a second `run()` call while one is in flight
/// returns an error.
pub struct Engine {
    state: Arc<EngineState>,
}

impl Engine {
    /// Requires at least one agent provider id resolvable in `registry`.
    pub fn new(config: EngineConfig, providers: Vec<String>, registry: Arc<AgentRegistry>, bus: EventBus) -> Result<Self, OacError> {
        if providers.is_empty() {
            return Err(OacError::new(ErrorKind::Invalid, crate::error::Severity::Fatal, "engine requires at least one agent provider"));
        }
        let mut config = config;
        config.concurrency = config.concurrency.max(1);
        config.max_attempts = config.max_attempts.max(1);
        config.task_timeout_ms = config.task_timeout_ms.max(1);
        config.default_token_budget = config.default_token_budget.max(1);

        let worktree_factory = WorktreeFactory::new(config.repo_path.clone());
        let circuit = CircuitBreaker::new(providers.iter().cloned());

        Ok(Self {
            state: Arc::new(EngineState {
                config,
                providers,
                registry,
                bus,
                worktree_factory,
                jobs: StdMutex::new(HashMap::new()),
                queue: StdMutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                next_seq: AtomicU64::new(0),
                round_robin: AtomicUsize::new(0),
                circuit,
                aborted: AtomicBool::new(false),
                started: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                pending_retries: AtomicUsize::new(0),
                running: StdMutex::new(HashMap::new()),
                audit_log: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Snapshot of every status transition recorded so far, in the order
    /// jobs crossed them. Safe to call mid-run.
    pub fn audit_log(&self) -> Vec<LifecycleEvent> {
        self.state.audit_log.lock().unwrap().clone()
    }

    /// Snapshot of per-provider circuit state, for the run summary (§6
    /// "Outbound from the core"). Safe to call mid-run.
    pub fn provider_health(&self) -> HashMap<String, crate::model::ProviderHealth> {
        self.state.circuit.snapshot()
    }

    /// `enqueue(plan) → [Job...]` (§4.5).
    pub fn enqueue(&self, plan: &ExecutionPlan) -> Vec<Job> {
        let mut created = Vec::with_capacity(plan.selected.len());
        for entry in &plan.selected {
            let job = Job::new(entry.item.clone(), entry.estimate, self.state.config.max_attempts);
            let job_id = job.id;
            let priority = entry.item.priority;
            self.state.jobs.lock().unwrap().insert(job_id, job.clone());
            let seq = self.state.next_seq.fetch_add(1, Ordering::Relaxed);
            self.state.queue.lock().unwrap().push(QueueEntry { priority, seq, job_id });
            record_transition(&self.state, job_id, &job.item.id, JobStatus::Queued, job.attempt, None);
            created.push(job);
        }
        self.state.notify.notify_one();
        created
    }

    /// `run() → RunResult`. Not re-entrant.
    pub async fn run(&self) -> Result<RunResult, OacError> {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Err(OacError::new(ErrorKind::Invalid, crate::error::Severity::Fatal, "engine run() is not re-entrant"));
        }

        let semaphore = Arc::new(Semaphore::new(self.state.config.concurrency));

        loop {
            loop {
                if self.state.aborted.load(Ordering::SeqCst) {
                    break;
                }
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let next = self.state.queue.lock().unwrap().pop();
                let Some(entry) = next else {
                    drop(permit);
                    break;
                };
                self.state.in_flight.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    run_job(Arc::clone(&state), entry.job_id).await;
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    state.notify.notify_one();
                });
            }

            let idle = self.state.in_flight.load(Ordering::SeqCst) == 0
                && self.state.queue.lock().unwrap().is_empty()
                && self.state.pending_retries.load(Ordering::SeqCst) == 0;
            if idle || self.state.aborted.load(Ordering::SeqCst) {
                if self.state.aborted.load(Ordering::SeqCst) && self.state.in_flight.load(Ordering::SeqCst) > 0 {
                    // Drain in-flight jobs before returning; they observe
                    // the abort flag at their next checkpoint.
                    while self.state.in_flight.load(Ordering::SeqCst) > 0 {
                        self.state.notify.notified().await;
                    }
                }
                break;
            }

            self.state.notify.notified().await;
        }

        let jobs = self.state.jobs.lock().unwrap();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut aborted = Vec::new();
        for job in jobs.values() {
            match job.status {
                JobStatus::Completed => completed.push(job.clone()),
                JobStatus::Failed => failed.push(job.clone()),
                JobStatus::Aborted => aborted.push(job.clone()),
                _ => {}
            }
        }
        Ok(RunResult { completed, failed, aborted })
    }

    /// Sets the aborted flag, stamps every queued job as aborted, and
    /// asks every currently running job's adapter to abort its
    /// execution. Agent abort errors are swallowed (§4.5).
    pub async fn abort(&self) {
        self.state.aborted.store(true, Ordering::SeqCst);

        let queued_ids: Vec<Uuid> = {
            let mut queue = self.state.queue.lock().unwrap();
            let drained: Vec<QueueEntry> = std::mem::take(&mut *queue).into_sorted_vec();
            drained.into_iter().map(|e| e.job_id).collect()
        };
        {
            let mut jobs = self.state.jobs.lock().unwrap();
            for job_id in queued_ids {
                if let Some(job) = jobs.get_mut(&job_id) {
                    mark_aborted(&self.state, job);
                }
            }
        }

        let running: Vec<(Uuid, Arc<dyn Adapter>, Uuid)> = {
            let running = self.state.running.lock().unwrap();
            running.iter().map(|(job_id, handle)| (*job_id, Arc::clone(&handle.adapter), handle.execution_id)).collect()
        };
        for (job_id, adapter, execution_id) in running {
            let _ = adapter.abort(execution_id).await;
            let mut jobs = self.state.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&job_id) {
                mark_aborted(&self.state, job);
            }
            self.state.bus.emit(Topic::ExecutionFailed, json!({ "jobId": job_id, "error": "ABORTED" }));
        }

        // A job can be neither queued nor running: it may be sleeping in
        // its backoff delay (`Retrying`) and only rejoins the queue once
        // that sleep elapses. Stamp every remaining non-terminal job here
        // so completed/failed/aborted still partitions all enqueued jobs
        // even if `run()` returns before that backoff task wakes.
        {
            let mut jobs = self.state.jobs.lock().unwrap();
            for job in jobs.values_mut() {
                mark_aborted(&self.state, job);
            }
        }

        self.state.notify.notify_waiters();
    }
}

fn mark_aborted(state: &EngineState, job: &mut Job) {
    if !job.status.is_terminal() {
        job.status = JobStatus::Aborted;
        job.completed_at = Some(Utc::now());
        job.error = Some(ErrorKind::AgentExecutionFailed);
        job.error_message = Some("run aborted".to_string());
        record_transition(state, job.id, &job.item.id, JobStatus::Aborted, job.attempt, job.agent_id.clone());
    }
}

/// One full pass through the per-job lifecycle (§4.5 "Per-job
/// lifecycle"), steps 1-10.
async fn run_job(state: Arc<EngineState>, job_id: Uuid) {
    // 1. Abort check.
    if state.aborted.load(Ordering::SeqCst) {
        let mut jobs = state.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            mark_aborted(&state, job);
        }
        return;
    }
    {
        let jobs = state.jobs.lock().unwrap();
        if jobs.get(&job_id).map(|j| j.status == JobStatus::Aborted).unwrap_or(true) {
            return;
        }
    }

    // 2. Increment attempts; running; startedAt.
    let (item, estimate, attempt) = {
        let mut jobs = state.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).expect("job must exist in table");
        job.attempt += 1;
        job.status = JobStatus::Running;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        record_transition(&state, job_id, &job.item.id, JobStatus::Running, job.attempt, job.agent_id.clone());
        (job.item.clone(), job.estimate, job.attempt)
    };

    // 3. Select an agent. Every provider's breaker open is not a generic
    // execution failure (§9 "Circuit breaker placement"): it gets its own
    // kind rather than falling through the string classifier.
    let Some((agent_id, adapter)) = select_agent(&state) else {
        let error = OacError::new(ErrorKind::AgentNotAvailable, crate::error::Severity::Fatal, "no agent provider is currently available")
            .with_context("taskId", item.id.clone())
            .with_context("jobId", job_id.to_string())
            .with_context("attempt", attempt.to_string());
        fail_job(&state, job_id, error);
        return;
    };
    {
        let mut jobs = state.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.agent_id = Some(agent_id.clone());
        }
    }
    state.bus.emit(Topic::ExecutionStarted, json!({ "jobId": job_id, "taskId": item.id, "agentId": agent_id }));

    // 4. Derive branch name.
    let branch = crate::worktree::derive_branch_name(&state.config.branch_prefix, Utc::now().date_naive(), &item.id, job_id, attempt);

    // 5. Create sandbox.
    let mut sandbox = match state.worktree_factory.create(&branch, &state.config.base_branch) {
        Ok(sandbox) => sandbox,
        Err(error) => {
            state.circuit.record_failure(&agent_id);
            fail_job(&state, job_id, normalize(&error.to_string(), ctx(&item.id, job_id, job_id, attempt)));
            return;
        }
    };

    let token_budget = estimate.total.max(state.config.default_token_budget);
    let opts = WorkerOptions {
        execution_id: Some(job_id),
        token_budget: Some(token_budget),
        timeout_ms: Some(state.config.task_timeout_ms),
        allow_commits: true,
    };

    state.running.lock().unwrap().insert(job_id, RunningHandle { adapter: Arc::clone(&adapter), execution_id: job_id });

    // 6. Invoke worker.execute.
    let outcome = worker::execute(adapter.as_ref(), &item, &sandbox, &state.bus, &state.config.base_branch, job_id, attempt, opts).await;

    // 10 (finally, but run before returning on any path): release the sandbox.
    let release_error = sandbox.release().err();
    state.running.lock().unwrap().remove(&job_id);

    match outcome {
        Ok(result) => {
            // 7. Success.
            state.circuit.record_success(&agent_id);
            let mut jobs = state.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.result = Some(result.clone());
                if job.error.is_none() {
                    if let Some(release_error) = &release_error {
                        job.error_message = Some(format!("sandbox cleanup failed: {release_error}"));
                    }
                }
                record_transition(&state, job_id, &job.item.id, JobStatus::Completed, job.attempt, job.agent_id.clone());
            }
            drop(jobs);
            state.bus.emit(Topic::ExecutionCompleted, json!({ "jobId": job_id, "result": { "filesChanged": result.files_changed, "totalTokensUsed": result.total_tokens_used } }));
        }
        Err(error) => {
            // 8/9. Failure, normalized already by worker::execute.
            state.circuit.record_failure(&agent_id);
            fail_job(&state, job_id, error);
        }
    }
}

fn ctx(task_id: &str, job_id: Uuid, execution_id: Uuid, attempt: u32) -> NormalizeContext {
    NormalizeContext {
        task_id: Some(task_id.to_string()),
        job_id: Some(job_id.to_string()),
        execution_id: Some(execution_id.to_string()),
        attempt: Some(attempt),
        is_abort: false,
    }
}

/// Failure path (§4.5): retry with backoff if transient and attempts
/// remain, else mark failed.
fn fail_job(state: &Arc<EngineState>, job_id: Uuid, error: OacError) {
    if state.aborted.load(Ordering::SeqCst) {
        let mut jobs = state.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            mark_aborted(&state, job);
        }
        return;
    }

    let (attempt, max_attempts, priority) = {
        let jobs = state.jobs.lock().unwrap();
        let job = jobs.get(&job_id).expect("job must exist");
        (job.attempt, job.max_attempts, job.item.priority)
    };

    if attempt < max_attempts && error.is_transient() {
        {
            let mut jobs = state.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::Retrying;
                job.error = Some(error.kind);
                job.error_message = Some(error.message.clone());
                record_transition(state, job_id, &job.item.id, JobStatus::Retrying, job.attempt, job.agent_id.clone());
            }
        }
        let delay = backoff_delay(error.kind, attempt);
        state.pending_retries.fetch_add(1, Ordering::SeqCst);
        let state_clone = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !state_clone.aborted.load(Ordering::SeqCst) {
                let mut jobs = state_clone.jobs.lock().unwrap();
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Queued;
                    record_transition(&state_clone, job_id, &job.item.id, JobStatus::Queued, job.attempt, job.agent_id.clone());
                }
                drop(jobs);
                let seq = state_clone.next_seq.fetch_add(1, Ordering::Relaxed);
                state_clone.queue.lock().unwrap().push(QueueEntry { priority, seq, job_id });
            } else {
                let mut jobs = state_clone.jobs.lock().unwrap();
                if let Some(job) = jobs.get_mut(&job_id) {
                    mark_aborted(&state_clone, job);
                }
            }
            state_clone.pending_retries.fetch_sub(1, Ordering::SeqCst);
            state_clone.notify.notify_one();
        });
        return;
    }

    let mut jobs = state.jobs.lock().unwrap();
    if let Some(job) = jobs.get_mut(&job_id) {
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(error.kind);
        job.error_message = Some(error.message.clone());
        record_transition(state, job_id, &job.item.id, JobStatus::Failed, job.attempt, job.agent_id.clone());
    }
    drop(jobs);
    state.bus.emit(Topic::ExecutionFailed, json!({ "jobId": job_id, "error": error.kind.to_string() }));
}

/// `AGENT_RATE_LIMITED`: `min(60s, 10s × 2^(attempt-1))`. Otherwise:
/// exponential-with-jitter `min(30s, 1s × 2^attempt) + uniform(0, 500ms)`.
fn backoff_delay(kind: ErrorKind, attempt: u32) -> Duration {
    if kind == ErrorKind::AgentRateLimited {
        let exp = 10_000u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(32));
        Duration::from_millis(exp.min(60_000))
    } else {
        let exp = 1_000u64.saturating_mul(1u64 << attempt.min(32));
        let base = exp.min(30_000);
        let jitter = rand::rng().random_range(0..=500u64);
        Duration::from_millis(base + jitter)
    }
}

/// Round-robin agent selection (§4.5 step 3) wrapped by the per-provider
/// circuit breaker (§4.5 "Circuit breaker").
fn select_agent(state: &Arc<EngineState>) -> Option<(String, Arc<dyn Adapter>)> {
    let count = state.providers.len();
    for _ in 0..count {
        let idx = state.round_robin.fetch_add(1, Ordering::Relaxed) % count;
        let provider_id = state.providers[idx].clone();
        if !state.circuit.allows(&provider_id) {
            continue;
        }
        let Resolution::Factory(factory) = state.registry.resolve(&provider_id) else { continue };
        let adapter: Arc<dyn Adapter> = Arc::from(factory());
        return Some((provider_id, adapter));
    }
    None
}
