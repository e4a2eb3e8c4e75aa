//! Structured error taxonomy and the single error normalizer.
//!
//! Every failure that crosses the engine/worker boundary is funneled
//! through [`normalize`] so that downstream code can make retry decisions
//! on a closed set of [`ErrorKind`]s instead of matching on error strings.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use std::sync::LazyLock;

/// Closed set of structured error kinds, grouped by the subsystem that
/// raises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Repo
    NotFound,
    Archived,
    NoPermission,
    CloneFailed,
    // Discovery
    ScannerFailed,
    ScannerTimeout,
    NoTasksFound,
    // Budget
    BudgetInsufficient,
    TokenizerUnavailable,
    // Execution
    AgentNotAvailable,
    AgentExecutionFailed,
    AgentTimeout,
    AgentOom,
    AgentTokenLimit,
    AgentRateLimited,
    ValidationFailed,
    // Completion
    PrCreationFailed,
    PrPushRejected,
    WebhookDeliveryFailed,
    // Config
    Invalid,
    SecretMissing,
    // System
    NetworkError,
    DiskSpaceLow,
    GitLockFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Archived => "ARCHIVED",
            ErrorKind::NoPermission => "NO_PERMISSION",
            ErrorKind::CloneFailed => "CLONE_FAILED",
            ErrorKind::ScannerFailed => "SCANNER_FAILED",
            ErrorKind::ScannerTimeout => "SCANNER_TIMEOUT",
            ErrorKind::NoTasksFound => "NO_TASKS_FOUND",
            ErrorKind::BudgetInsufficient => "BUDGET_INSUFFICIENT",
            ErrorKind::TokenizerUnavailable => "TOKENIZER_UNAVAILABLE",
            ErrorKind::AgentNotAvailable => "AGENT_NOT_AVAILABLE",
            ErrorKind::AgentExecutionFailed => "AGENT_EXECUTION_FAILED",
            ErrorKind::AgentTimeout => "AGENT_TIMEOUT",
            ErrorKind::AgentOom => "AGENT_OOM",
            ErrorKind::AgentTokenLimit => "AGENT_TOKEN_LIMIT",
            ErrorKind::AgentRateLimited => "AGENT_RATE_LIMITED",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::PrCreationFailed => "PR_CREATION_FAILED",
            ErrorKind::PrPushRejected => "PR_PUSH_REJECTED",
            ErrorKind::WebhookDeliveryFailed => "WEBHOOK_DELIVERY_FAILED",
            ErrorKind::Invalid => "INVALID",
            ErrorKind::SecretMissing => "SECRET_MISSING",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::DiskSpaceLow => "DISK_SPACE_LOW",
            ErrorKind::GitLockFailed => "GIT_LOCK_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Severity of a structured error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
    Warning,
}

/// A structured error: the only error type that crosses the engine/worker
/// boundary. Carries enough context to appear in a run summary and to
/// drive retry decisions.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OacError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub context: HashMap<String, String>,
    /// The original message, preserved verbatim even after classification.
    pub cause: Option<String>,
}

impl OacError {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// True iff this error's kind is one the engine will retry.
    pub fn is_transient(&self) -> bool {
        is_transient_kind(self.kind)
    }
}

pub fn is_transient_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::AgentTimeout
            | ErrorKind::AgentOom
            | ErrorKind::AgentRateLimited
            | ErrorKind::NetworkError
            | ErrorKind::GitLockFailed
    )
}

struct Pattern {
    regex: &'static Regex,
    kind: ErrorKind,
}

// Compiled once; order is significant and matches the fixed classification
// table: the first pattern that matches wins.
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed out|timeout").unwrap());
static OOM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)out of memory|enomem|heap").unwrap());
static NETWORK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)network|econn|enotfound|eai_again").unwrap());
static GIT_LOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)index\.lock|cannot lock ref|\.git/index\.lock").unwrap());
static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate.limit|429|too many requests|throttl").unwrap());

fn patterns() -> Vec<Pattern> {
    vec![
        Pattern { regex: &TIMEOUT_RE, kind: ErrorKind::AgentTimeout },
        Pattern { regex: &OOM_RE, kind: ErrorKind::AgentOom },
        Pattern { regex: &NETWORK_RE, kind: ErrorKind::NetworkError },
        Pattern { regex: &GIT_LOCK_RE, kind: ErrorKind::GitLockFailed },
        Pattern { regex: &RATE_LIMIT_RE, kind: ErrorKind::AgentRateLimited },
    ]
}

/// Context accompanying a raw failure, attached to the normalized error
/// when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeContext {
    pub task_id: Option<String>,
    pub job_id: Option<String>,
    pub execution_id: Option<String>,
    pub attempt: Option<u32>,
    /// Set when the raw error is a cancellation (e.g. an aborted future),
    /// equivalent to the source's `name == "AbortError"` check.
    pub is_abort: bool,
}

/// The single normalizer. Turns an arbitrary failure message into a
/// [`OacError`] by matching it against a fixed, ordered table of regexes.
/// Deterministic: identical `(message, context)` inputs yield the same kind.
pub fn normalize(message: &str, ctx: NormalizeContext) -> OacError {
    let kind = if ctx.is_abort {
        ErrorKind::AgentExecutionFailed
    } else {
        patterns()
            .into_iter()
            .find(|p| p.regex.is_match(message))
            .map(|p| p.kind)
            .unwrap_or(ErrorKind::AgentExecutionFailed)
    };

    let mut err = OacError::new(kind, Severity::Recoverable, message).with_context_opt(
        "taskId",
        ctx.task_id,
    );
    if let Some(job_id) = ctx.job_id {
        err = err.with_context("jobId", job_id);
    }
    if let Some(execution_id) = ctx.execution_id {
        err = err.with_context("executionId", execution_id);
    }
    if let Some(attempt) = ctx.attempt {
        err = err.with_context("attempt", attempt.to_string());
    }
    err.cause = Some(message.to_string());
    err
}

impl OacError {
    fn with_context_opt(self, key: &str, value: Option<String>) -> Self {
        match value {
            Some(v) => self.with_context(key, v),
            None => self,
        }
    }
}
