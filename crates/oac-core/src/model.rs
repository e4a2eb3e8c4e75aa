//! Core data model: work items, token estimates, execution plans, and jobs.
//!
//! These types are produced and consumed by the planner, engine, and
//! worker; see each module's doc comment for how it participates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a work item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Lint,
    Todo,
    TestGap,
    DeadCode,
    Issue,
    Custom,
}

/// How hard a work item is expected to be, used to scale the expected
/// output size in token estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Multiplier applied to `contextTokens` to derive `expectedOutput`.
    pub fn output_multiplier(self) -> f64 {
        match self {
            Complexity::Trivial => 0.5,
            Complexity::Simple => 1.0,
            Complexity::Moderate => 2.0,
            Complexity::Complex => 3.5,
        }
    }
}

/// How a job's result should land in the target repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    NewBranchPr,
    UpdatePr,
    DirectCommit,
}

/// A reference to an external issue a work item resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedIssue {
    pub number: u64,
    pub url: String,
    pub labels: Vec<String>,
}

/// Immutable record of a candidate unit of work. Produced by discovery
/// (a collaborator); never mutated by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier: a hash of source + files + title.
    pub id: String,
    pub source: SourceKind,
    pub title: String,
    pub description: String,
    pub target_files: Vec<String>,
    /// 0-100, higher runs first.
    pub priority: u8,
    pub complexity: Complexity,
    pub execution_mode: ExecutionMode,
    pub linked_issue: Option<LinkedIssue>,
    pub metadata: HashMap<String, String>,
    pub discovered_at: DateTime<Utc>,
}

/// Distinguished sentinel representing an unlimited token budget.
pub const UNLIMITED_BUDGET: u64 = u64::MAX / 4;

/// Per (work item, provider) token cost estimate. Produced once; immutable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub context_tokens: u64,
    pub prompt_tokens: u64,
    pub expected_output: u64,
    /// `ceil(1.2 * (context + prompt + expected_output))`.
    pub total: u64,
    /// 0.1-0.95.
    pub confidence: f64,
    /// `total <= provider_context_limit`.
    pub feasible: bool,
}

/// Why a work item was deferred by the planner instead of selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeferReason {
    BudgetExceeded,
    LowConfidence,
    TooComplex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedEntry {
    pub item: WorkItem,
    pub estimate: TokenEstimate,
    /// Running total of `total` across all selected entries up to and
    /// including this one.
    pub cumulative_budget_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub item: WorkItem,
    pub estimate: TokenEstimate,
    pub reason: DeferReason,
}

/// Snapshot produced by the budget planner. See `budget.rs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub total_budget: u64,
    pub reserve_tokens: u64,
    pub selected: Vec<SelectedEntry>,
    pub deferred: Vec<DeferredEntry>,
    pub remaining_tokens: u64,
}

/// The engine's mutable per-job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted)
    }
}

/// Terminal outcome of a successful job, folding in the worker's merge
/// of the adapter result with observed progress (see `worker.rs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub total_tokens_used: u64,
    pub files_changed: Vec<String>,
    pub duration_ms: u64,
    pub branch_name: String,
}

/// The engine's mutable representation of a work item through its
/// lifecycle. Owned exclusively by the engine from enqueue to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub item: WorkItem,
    pub estimate: TokenEstimate,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    /// Present once the job has reached a failed/aborted terminal state,
    /// or was marked as such mid-retry.
    pub error: Option<crate::error::ErrorKind>,
    pub error_message: Option<String>,
    /// The provider id that handled the most recent attempt.
    pub agent_id: Option<String>,
}

impl Job {
    pub fn new(item: WorkItem, estimate: TokenEstimate, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            estimate,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_message: None,
            agent_id: None,
        }
    }
}

/// Circuit breaker state for one provider (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// In-memory per-provider health counters. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub state: CircuitState,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self { consecutive_failures: 0, last_failure_time: None, state: CircuitState::Closed }
    }
}

/// The outcome of one run: jobs partitioned by terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub completed: Vec<Job>,
    pub failed: Vec<Job>,
    pub aborted: Vec<Job>,
}
