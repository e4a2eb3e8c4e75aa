//! Shared subprocess lifecycle machinery used by every provider adapter
//! (§4.2 "Subprocess lifecycle"). Each adapter supplies its own argv and
//! line-parsing function; this module owns process spawn/pipe/timeout/
//! abort/drain plumbing so that behavior --- in particular the rolling
//! timeout, the SIGTERM/SIGKILL escalation, and the monotonic token
//! watermark --- is identical across providers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::event_queue::EventQueue;
use super::trait_def::Execution;
use super::types::{AgentEvent, AgentResult, ExecuteParams, OutputStream};
use crate::error::{normalize, NormalizeContext};

/// Monotonic token watermark (§4.2 point 4): counters only increase, and
/// `total()` is `max(cumulative, input + output)`.
#[derive(Default)]
pub struct TokenState {
    input: AtomicU64,
    output: AtomicU64,
    cumulative: AtomicU64,
}

impl TokenState {
    pub fn observe(&self, input: u64, output: u64) -> (u64, u64, u64) {
        let input = self.input.fetch_max(input, Ordering::SeqCst).max(input);
        let output = self.output.fetch_max(output, Ordering::SeqCst).max(output);
        let sum = input + output;
        let cumulative = self.cumulative.fetch_max(sum, Ordering::SeqCst).max(sum);
        (input, output, cumulative)
    }

    pub fn total(&self) -> u64 {
        let cumulative = self.cumulative.load(Ordering::SeqCst);
        let sum = self.input.load(Ordering::SeqCst) + self.output.load(Ordering::SeqCst);
        cumulative.max(sum)
    }
}

pub struct RunningProcess {
    abort: Arc<Notify>,
    aborted: Arc<AtomicBool>,
}

/// Per-adapter process table, keyed by execution id so `abort()` can
/// reach a specific in-flight run.
pub type ProcessTable = Arc<Mutex<HashMap<Uuid, RunningProcess>>>;

pub fn new_process_table() -> ProcessTable {
    Arc::new(Mutex::new(HashMap::new()))
}

pub async fn abort_execution(table: &ProcessTable, execution_id: Uuid) {
    let processes = table.lock().await;
    if let Some(proc) = processes.get(&execution_id) {
        proc.aborted.store(true, Ordering::SeqCst);
        proc.abort.notify_one();
    }
    // Absence of the id is not an error: abort is idempotent and
    // tolerates ids it never saw.
}

pub type LineParser = fn(&str, OutputStream, &TokenState) -> Vec<AgentEvent>;

/// Spawn `binary(args)` in `params.working_directory`, stream stdout and
/// stderr concurrently through `parse_line`, and resolve the returned
/// `Execution`'s result once the process exits (or is timed out /
/// aborted).
pub async fn drive(
    binary: &str,
    args: &[String],
    env_strip: &[&str],
    params: ExecuteParams,
    grace_window: Duration,
    parse_line: LineParser,
    processes: ProcessTable,
) -> Result<Execution> {
    let queue = Arc::new(EventQueue::new());
    let abort = Arc::new(Notify::new());
    let aborted = Arc::new(AtomicBool::new(false));
    let (tx, rx) = oneshot::channel();

    let mut cmd = Command::new(binary);
    cmd.args(args);
    cmd.current_dir(&params.working_directory);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    for key in env_strip {
        cmd.env_remove(key);
    }
    cmd.env("TOKEN_BUDGET", params.token_budget.to_string());
    cmd.env("ALLOW_COMMITS", params.allow_commits.to_string());
    for (k, v) in &params.env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '{binary}' -- is it installed and on PATH?"))?;
    let pid = child.id();

    processes
        .lock()
        .await
        .insert(params.execution_id, RunningProcess { abort: abort.clone(), aborted: aborted.clone() });

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let tokens = Arc::new(TokenState::default());
    let files: Arc<StdMutex<HashSet<String>>> = Arc::new(StdMutex::new(HashSet::new()));

    let stdout_queue = queue.clone();
    let stdout_tokens = tokens.clone();
    let stdout_files = files.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            for event in parse_line(&line, OutputStream::Stdout, &stdout_tokens) {
                if let AgentEvent::FileEdit { ref path, .. } = event {
                    stdout_files.lock().unwrap().insert(path.clone());
                }
                stdout_queue.push(event);
            }
        }
    });

    let stderr_queue = queue.clone();
    let stderr_tokens = tokens.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            for event in parse_line(&line, OutputStream::Stderr, &stderr_tokens) {
                stderr_queue.push(event);
            }
        }
    });

    let timeout_ms = params.timeout_ms;
    let execution_id = params.execution_id;
    let queue_for_result = queue.clone();
    let started = std::time::Instant::now();

    tokio::spawn(async move {
        let mut timed_out = false;
        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                timed_out = true;
                None
            }
            _ = abort.notified() => None,
        };

        let status = if let Some(status) = wait_result {
            status
        } else {
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
            match tokio::time::timeout(grace_window, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    debug!(pid = ?pid, "process still alive after grace window, sending SIGKILL");
                    child.kill().await.ok();
                    child.wait().await
                }
            }
        };

        // Drain both streams to EOF before resolving (§4.2 point 5).
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        processes.lock().await.remove(&execution_id);

        let was_aborted = aborted.load(Ordering::SeqCst);
        let exit_code = status.as_ref().ok().and_then(|s| s.code()).unwrap_or(-1);

        if timed_out {
            let err = normalize(
                "execution timed out",
                NormalizeContext { execution_id: Some(execution_id.to_string()), ..Default::default() },
            );
            queue_for_result.fail(err);
            let _ = tx.send(Err(anyhow::anyhow!("AGENT_TIMEOUT: subprocess exceeded {timeout_ms}ms")));
            return;
        }

        queue_for_result.close();

        let success = !was_aborted && exit_code == 0;
        let files_changed: Vec<String> = files.lock().unwrap().iter().cloned().collect();
        let result = AgentResult {
            success,
            exit_code,
            total_tokens_used: tokens.total(),
            files_changed,
            duration_ms: started.elapsed().as_millis() as u64,
            error: if success { None } else { Some(format!("exit code {exit_code}")) },
        };
        let _ = tx.send(Ok(result));
    });

    Ok(Execution { execution_id: params.execution_id, events: queue, result: rx, pid })
}
