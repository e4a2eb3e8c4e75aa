//! Generic provider adapter (§6 "Subprocess contracts"): invoked as
//! `<binary> run --format json "<prompt>"` with cwd=sandbox. Used for any
//! provider CLI that emits one JSON object per line and has no
//! provider-specific envelope shape worth a dedicated adapter.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::subprocess::{self, LineParser, ProcessTable, TokenState};
use super::trait_def::{Adapter, Execution};
use super::types::{estimate_tokens, AgentEvent, Availability, ExecuteParams, FileAction, OutputStream, TokenEstimate};
use crate::model::Complexity;

const GRACE_WINDOW: Duration = Duration::from_secs(5);

static FILE_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(created|modified|deleted)\s+(\S+)").unwrap());
static TOKEN_COUNTER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)tokens?\D*(\d+)\D+(\d+)").unwrap());
static ERROR_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(error|failed|exception)\b").unwrap());

/// Shared non-throwing `--version` probe with PATH-existence fallback,
/// bounded to 5s, used by every adapter (§4.1).
pub async fn probe_version(binary_path: &str) -> Availability {
    let probe = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::process::Command::new(binary_path).arg("--version").output().await
    })
    .await;

    match probe {
        Ok(Ok(output)) if output.status.success() => Availability {
            available: true,
            version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            error: None,
        },
        _ => {
            let on_path = which(binary_path);
            Availability { available: on_path, version: None, error: if on_path { None } else { Some("binary not found on PATH".to_string()) } }
        }
    }
}

fn which(binary: &str) -> bool {
    if binary.contains('/') {
        return std::path::Path::new(binary).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).exists()))
        .unwrap_or(false)
}

fn parse_line(line: &str, stream: OutputStream, tokens: &TokenState) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if value.is_object() {
            if let Some(usage) = value.get("usage") {
                let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                if input > 0 || output > 0 {
                    let (input, output, cumulative) = tokens.observe(input, output);
                    events.push(AgentEvent::Tokens { input, output, cumulative });
                }
            }
            if let Some(text) = value.get("output").and_then(|v| v.as_str()) {
                events.push(AgentEvent::Output { stream: OutputStream::Stdout, content: text.to_string() });
            }
            if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
                events.push(AgentEvent::Error { message: err.to_string(), recoverable: true });
            }
            if !events.is_empty() {
                return events;
            }
        }
    }

    if let Some(caps) = FILE_ACTION_RE.captures(line) {
        let action = match caps[1].to_ascii_lowercase().as_str() {
            "created" => FileAction::Create,
            "deleted" => FileAction::Delete,
            _ => FileAction::Modify,
        };
        events.push(AgentEvent::FileEdit { action, path: caps[2].to_string() });
    }
    if let Some(caps) = TOKEN_COUNTER_RE.captures(line) {
        let a: u64 = caps[1].parse().unwrap_or(0);
        let b: u64 = caps[2].parse().unwrap_or(0);
        let (input, output, cumulative) = tokens.observe(a, b);
        events.push(AgentEvent::Tokens { input, output, cumulative });
    }
    if stream == OutputStream::Stderr && ERROR_MARKER_RE.is_match(line) {
        events.push(AgentEvent::Error { message: line.to_string(), recoverable: true });
    }
    if events.is_empty() {
        events.push(AgentEvent::Output { stream, content: line.to_string() });
    }
    events
}

const PARSE_LINE: LineParser = parse_line;

#[derive(Clone)]
pub struct GenericAdapter {
    id: String,
    binary_path: String,
    context_limit: u64,
    processes: ProcessTable,
}

impl GenericAdapter {
    pub fn new(id: impl Into<String>, binary_path: impl Into<String>) -> Self {
        Self { id: id.into(), binary_path: binary_path.into(), context_limit: 128_000, processes: subprocess::new_process_table() }
    }

    pub fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = limit;
        self
    }
}

#[async_trait]
impl Adapter for GenericAdapter {
    fn name(&self) -> &str {
        &self.id
    }

    async fn check_availability(&self) -> Availability {
        probe_version(&self.binary_path).await
    }

    fn estimate_tokens(
        &self,
        repo_root: &std::path::Path,
        prompt: &str,
        target_files: &[String],
        complexity: Complexity,
    ) -> TokenEstimate {
        estimate_tokens(repo_root, prompt, target_files, complexity, 100, self.context_limit)
    }

    async fn execute(&self, params: ExecuteParams) -> Result<Execution> {
        let args = vec!["run".to_string(), "--format".to_string(), "json".to_string(), params.prompt.clone()];
        subprocess::drive(&self.binary_path, &args, &[], params, GRACE_WINDOW, PARSE_LINE, self.processes.clone()).await
    }

    async fn abort(&self, execution_id: Uuid) -> Result<()> {
        subprocess::abort_execution(&self.processes, execution_id).await;
        Ok(())
    }
}
