//! Claude-style provider adapter (§6 "Subprocess contracts").
//!
//! Invoked as `claude -p "<prompt>"`; ingests stdin=closed; emits human
//! text interleaved with optional JSON envelopes on stdout. Session
//! markers from the parent env are stripped so a nested invocation
//! cannot mistake itself for the parent session.

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

/// Environment variables stripped from the child's inherited environment
/// so a nested agent invocation cannot mistake itself for the parent
/// session (§6).
const STRIPPED_ENV_KEYS: &[&str] = &["CLAUDECODE", "CLAUDE_CODE_SESSION"];

/// Grace window between SIGTERM and SIGKILL. Claude-style providers are
/// "fast" per §4.2 point 2.
const GRACE_WINDOW: Duration = Duration::from_secs(2);

static FILE_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(created|modified|deleted)\s+(\S+)").unwrap());
static TOKEN_COUNTER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)tokens?\D*(\d+)\D+(\d+)").unwrap());
static ERROR_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(error|failed|exception)\b").unwrap());

#[derive(Clone)]
pub struct ClaudeCodeAdapter {
    binary_path: String,
    context_limit: u64,
    processes: ProcessTable,
}

impl ClaudeCodeAdapter {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self { binary_path: path.into(), context_limit: 200_000, processes: subprocess::new_process_table() }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &str, stream: OutputStream, tokens: &TokenState) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if value.is_object() {
            extract_structured(&value, &mut events, tokens);
            return events;
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

fn extract_structured(value: &serde_json::Value, events: &mut Vec<AgentEvent>, tokens: &TokenState) {
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "assistant" => {
            if let Some(message) = value.get("message") {
                if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
                    for block in blocks {
                        match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                    events.push(AgentEvent::Output { stream: OutputStream::Stdout, content: text.to_string() });
                                }
                            }
                            "tool_use" => {
                                let tool = block.get("name").and_then(|n| n.as_str()).unwrap_or("unknown").to_string();
                                let input = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                                events.push(AgentEvent::ToolUse { tool, input });
                            }
                            _ => {}
                        }
                    }
                }
                if let Some(usage) = message.get("usage") {
                    push_usage(usage, events, tokens);
                }
            }
        }
        "result" => {
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                events.push(AgentEvent::Output { stream: OutputStream::Stdout, content: text.to_string() });
            }
            if let Some(usage) = value.get("usage") {
                push_usage(usage, events, tokens);
            }
        }
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(AgentEvent::Error { message, recoverable: true });
        }
        other => {
            tracing::debug!(event_type = other, "ignoring unrecognised stream-json event type");
        }
    }
}

fn push_usage(usage: &serde_json::Value, events: &mut Vec<AgentEvent>, tokens: &TokenState) {
    let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    if input > 0 || output > 0 {
        let (input, output, cumulative) = tokens.observe(input, output);
        events.push(AgentEvent::Tokens { input, output, cumulative });
    }
}

const PARSE_LINE: LineParser = parse_line;

#[async_trait]
impl Adapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn check_availability(&self) -> Availability {
        super::generic::probe_version(&self.binary_path).await
    }

    fn estimate_tokens(
        &self,
        repo_root: &std::path::Path,
        prompt: &str,
        target_files: &[String],
        complexity: Complexity,
    ) -> TokenEstimate {
        estimate_tokens(repo_root, prompt, target_files, complexity, 200, self.context_limit)
    }

    async fn execute(&self, params: ExecuteParams) -> Result<Execution> {
        let args = vec!["-p".to_string(), params.prompt.clone()];
        subprocess::drive(&self.binary_path, &args, STRIPPED_ENV_KEYS, params, GRACE_WINDOW, PARSE_LINE, self.processes.clone()).await
    }

    async fn abort(&self, execution_id: Uuid) -> Result<()> {
        subprocess::abort_execution(&self.processes, execution_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    fn script(tmp: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = tmp.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn params(working_directory: PathBuf) -> ExecuteParams {
        ExecuteParams {
            execution_id: Uuid::new_v4(),
            working_directory,
            prompt: "do the thing".to_string(),
            target_files: vec![],
            token_budget: 1000,
            allow_commits: true,
            timeout_ms: 5_000,
            env: Map::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_emits_tokens_and_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(
            tmp.path(),
            "fake.sh",
            "#!/bin/sh\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}],\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}}'\n\
             echo '{\"type\":\"result\",\"result\":\"done\",\"usage\":{\"input_tokens\":20,\"output_tokens\":10}}'\n",
        );
        let adapter = ClaudeCodeAdapter::with_binary(bin.to_str().unwrap());
        let execution = adapter.execute(params(tmp.path().to_path_buf())).await.unwrap();

        let mut saw_tokens = false;
        while let Ok(Some(event)) = execution.events.next().await {
            if matches!(event, AgentEvent::Tokens { .. }) {
                saw_tokens = true;
            }
        }
        assert!(saw_tokens);

        let result = execution.result.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.total_tokens_used, 30);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(tmp.path(), "fail.sh", "#!/bin/sh\nexit 1\n");
        let adapter = ClaudeCodeAdapter::with_binary(bin.to_str().unwrap());
        let execution = adapter.execute(params(tmp.path().to_path_buf())).await.unwrap();
        while execution.events.next().await.unwrap().is_some() {}
        let result = execution.result.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn timeout_produces_agent_timeout_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(tmp.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");
        let adapter = ClaudeCodeAdapter::with_binary(bin.to_str().unwrap());
        let mut p = params(tmp.path().to_path_buf());
        p.timeout_ms = 100;
        let execution = adapter.execute(p).await.unwrap();
        let err = execution.result.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("AGENT_TIMEOUT"));
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_stops_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = script(tmp.path(), "sleepy.sh", "#!/bin/sh\nsleep 30\n");
        let adapter = ClaudeCodeAdapter::with_binary(bin.to_str().unwrap());
        let p = params(tmp.path().to_path_buf());
        let id = p.execution_id;
        let execution = adapter.execute(p).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter.abort(id).await.unwrap();
        adapter.abort(id).await.unwrap();

        let result = execution.result.await.unwrap().unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn abort_on_unknown_execution_id_is_a_no_op() {
        let adapter = ClaudeCodeAdapter::new();
        adapter.abort(Uuid::new_v4()).await.unwrap();
    }

    #[test]
    fn regex_fallback_extracts_file_action_and_tokens() {
        let tokens = TokenState::default();
        let events = parse_line("modified src/x.ts", OutputStream::Stdout, &tokens);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::FileEdit { action: FileAction::Modify, path } if path == "src/x.ts")));
    }

    #[test]
    fn regex_fallback_flags_stderr_error_markers() {
        let tokens = TokenState::default();
        let events = parse_line("panic: something failed badly", OutputStream::Stderr, &tokens);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Error { .. })));
    }

    #[test]
    fn adapter_name_is_claude_code() {
        assert_eq!(ClaudeCodeAdapter::new().name(), "claude-code");
    }
}
