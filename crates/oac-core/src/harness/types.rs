//! Shared types for the agent adapter contract (§4.2).

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use uuid::Uuid;

use crate::model::{Complexity, TokenEstimate};

/// Parameters for one subprocess invocation.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub execution_id: Uuid,
    pub working_directory: PathBuf,
    pub prompt: String,
    pub target_files: Vec<String>,
    pub token_budget: u64,
    pub allow_commits: bool,
    pub timeout_ms: u64,
    pub env: HashMap<String, String>,
}

/// The closed, five-variant tagged union of events an adapter can emit.
/// Consumers dispatch on the tag; this is intentionally not an open map
/// of fields (§9 Design Notes).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Output { stream: OutputStream, content: String },
    Tokens { input: u64, output: u64, cumulative: u64 },
    FileEdit { action: FileAction, path: String },
    ToolUse { tool: String, input: Value },
    Error { message: String, recoverable: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
        }
    }
}

/// Terminal record from one subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: i32,
    pub total_tokens_used: u64,
    pub files_changed: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of a non-blocking availability probe (§4.1). Never throws --
/// every adapter must bound its own probe to <=5s and fall back to a
/// PATH-existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Per work-item-per-provider token estimation inputs, re-exported here
/// so adapter call sites don't need to reach into `crate::model` directly.
#[derive(Debug, Clone, Copy)]
pub struct EstimateInputs {
    pub complexity: Complexity,
    pub provider_context_limit: u64,
    /// Provider-specific flat overhead added to `promptTokens`.
    pub prompt_overhead: u64,
}

pub type Estimate = TokenEstimate;

/// Shared token-estimation arithmetic (§4.2), parameterized per-adapter
/// by `prompt_overhead` and `context_limit`. `contextTokens` sums
/// `ceil(fileSize / 4)` over target files that exist on disk; missing
/// files contribute 0.
pub fn estimate_tokens(
    repo_root: &std::path::Path,
    prompt: &str,
    target_files: &[String],
    complexity: crate::model::Complexity,
    prompt_overhead: u64,
    context_limit: u64,
) -> TokenEstimate {
    let context_tokens: u64 = target_files
        .iter()
        .map(|rel| {
            std::fs::metadata(repo_root.join(rel))
                .map(|m| m.len().div_ceil(4))
                .unwrap_or(0)
        })
        .sum();

    let prompt_tokens = (prompt.len() as u64).div_ceil(4) + prompt_overhead;
    let expected_output = ((context_tokens as f64) * complexity.output_multiplier()).ceil() as u64;
    let raw_total = context_tokens + prompt_tokens + expected_output;
    let total = ((raw_total as f64) * 1.2).ceil() as u64;

    // Confidence tracks how many target files we could actually read:
    // an estimate built from files that don't exist yet is less trustworthy.
    let existing = target_files
        .iter()
        .filter(|rel| repo_root.join(rel).exists())
        .count();
    let ratio = if target_files.is_empty() {
        1.0
    } else {
        existing as f64 / target_files.len() as f64
    };
    let confidence = (0.95 * ratio).clamp(0.1, 0.95);

    TokenEstimate {
        context_tokens,
        prompt_tokens,
        expected_output,
        total,
        confidence,
        feasible: total <= context_limit,
    }
}
