//! Codex-style provider adapter (§6 "Subprocess contracts"): invoked as
//! `codex exec --full-auto -C <dir> "<prompt>"`; emits structured JSON
//! event envelopes shaped `{type:"item.completed", item:{type:"file_change"
//! | "command_execution", ...}}` on stdout.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::generic::probe_version;
use super::subprocess::{self, LineParser, ProcessTable, TokenState};
use super::trait_def::{Adapter, Execution};
use super::types::{estimate_tokens, AgentEvent, Availability, ExecuteParams, FileAction, OutputStream, TokenEstimate};
use crate::model::Complexity;

const GRACE_WINDOW: Duration = Duration::from_secs(5);

fn parse_line(line: &str, stream: OutputStream, tokens: &TokenState) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        if stream == OutputStream::Stderr
            && (line.to_ascii_lowercase().contains("error") || line.to_ascii_lowercase().contains("failed"))
        {
            events.push(AgentEvent::Error { message: line.to_string(), recoverable: true });
        } else {
            events.push(AgentEvent::Output { stream, content: line.to_string() });
        }
        return events;
    };

    if value.get("type").and_then(|t| t.as_str()) != Some("item.completed") {
        return events;
    }

    let Some(item) = value.get("item") else { return events };
    match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "file_change" => {
            let path = item.get("path").and_then(|p| p.as_str()).unwrap_or("").to_string();
            let action = match item.get("action").and_then(|a| a.as_str()).unwrap_or("modify") {
                "create" => FileAction::Create,
                "delete" => FileAction::Delete,
                _ => FileAction::Modify,
            };
            if !path.is_empty() {
                events.push(AgentEvent::FileEdit { action, path });
            }
        }
        "command_execution" => {
            let command = item.get("command").and_then(|c| c.as_str()).unwrap_or("").to_string();
            events.push(AgentEvent::ToolUse { tool: "shell".to_string(), input: serde_json::json!({ "command": command }) });
        }
        _ => {}
    }

    if let Some(usage) = item.get("usage").or_else(|| value.get("usage")) {
        let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        if input > 0 || output > 0 {
            let (input, output, cumulative) = tokens.observe(input, output);
            events.push(AgentEvent::Tokens { input, output, cumulative });
        }
    }

    events
}

const PARSE_LINE: LineParser = parse_line;

#[derive(Clone)]
pub struct CodexAdapter {
    binary_path: String,
    context_limit: u64,
    processes: ProcessTable,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self::with_binary("codex")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self { binary_path: path.into(), context_limit: 128_000, processes: subprocess::new_process_table() }
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
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
        estimate_tokens(repo_root, prompt, target_files, complexity, 150, self.context_limit)
    }

    async fn execute(&self, params: ExecuteParams) -> Result<Execution> {
        let args = vec![
            "exec".to_string(),
            "--full-auto".to_string(),
            "-C".to_string(),
            params.working_directory.to_string_lossy().to_string(),
            params.prompt.clone(),
        ];
        subprocess::drive(&self.binary_path, &args, &[], params, GRACE_WINDOW, PARSE_LINE, self.processes.clone()).await
    }

    async fn abort(&self, execution_id: Uuid) -> Result<()> {
        subprocess::abort_execution(&self.processes, execution_id).await;
        Ok(())
    }
}
