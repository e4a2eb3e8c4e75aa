//! Worktree Sandbox (§4.3): an isolated git worktree branched from a base
//! ref, with all mutating git operations serialized through a
//! process-wide mutex. Grounded on the teacher's `WorktreeManager`
//! (`worktree/mod.rs`), trimmed to the create/release pair the engine
//! actually drives (no merge/list/prune-as-public-API -- those were
//! collaborator-facing operations this system doesn't need).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock, Mutex};

use thiserror::Error;

/// Allow-list for branch names passed across a process boundary, guarding
/// against argument/path injection into `git` invocations (§4.3).
static BRANCH_NAME_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9/_.-]+$").unwrap());

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("branch name fails validation: {0:?}")]
    InvalidBranchName(String),

    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit { command: String, code: i32, stderr: String },
}

/// A worktree path + branch name + a single-shot release function
/// (§3 "Sandbox").
pub struct Sandbox {
    pub path: PathBuf,
    pub branch: String,
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
    released: bool,
}

impl Sandbox {
    /// Idempotent: the first call removes the worktree and prunes stale
    /// entries; subsequent calls are no-ops. Failure to prune is
    /// swallowed; failure to remove is surfaced.
    pub fn release(&mut self) -> Result<(), WorktreeError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree remove".into(), source: e })?;

        let remove_result = if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                Ok(())
            } else {
                Err(WorktreeError::GitExit { command: "worktree remove".into(), code: output.status.code().unwrap_or(-1), stderr })
            }
        };

        let prune = Command::new("git").args(["worktree", "prune"]).current_dir(&self.repo_path).output();
        if let Ok(prune_output) = prune {
            if !prune_output.status.success() {
                tracing::debug!("git worktree prune reported a non-zero exit, ignoring");
            }
        }

        remove_result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.released {
            if let Err(error) = self.release() {
                tracing::warn!(%error, path = %self.path.display(), "sandbox dropped without explicit release and cleanup failed");
            }
        }
    }
}

/// Validates a branch/ref name against the allow-list; used both for the
/// branch being created and for the base branch it forks from.
fn validate(name: &str) -> Result<(), WorktreeError> {
    if name.is_empty() || !BRANCH_NAME_RE.is_match(name) {
        return Err(WorktreeError::InvalidBranchName(name.to_string()));
    }
    Ok(())
}

/// Creates worktrees for a single repository, serializing mutations
/// through a shared mutex (the git index lock is a file on disk;
/// concurrent worktree mutations race on it and fail spuriously).
#[derive(Clone)]
pub struct WorktreeFactory {
    repo_path: PathBuf,
    worktree_root: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeFactory {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        let repo_path = repo_path.into();
        // `<repoParent>/.oac-worktrees/<branch>` (§6 "File-system surface").
        let worktree_root = repo_path.parent().map(|p| p.join(".oac-worktrees")).unwrap_or_else(|| PathBuf::from(".oac-worktrees"));
        Self { repo_path, worktree_root, git_lock: Arc::new(Mutex::new(())) }
    }

    pub fn with_worktree_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.worktree_root = root.into();
        self
    }

    /// `create(repoPath, branchName, baseBranch) → Sandbox` (§4.3).
    pub fn create(&self, branch_name: &str, base_branch: &str) -> Result<Sandbox, WorktreeError> {
        validate(branch_name)?;
        validate(base_branch)?;

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.repo_path.join(".git").exists() {
            return Err(WorktreeError::NotAGitRepo(self.repo_path.clone()));
        }

        if !self.worktree_root.exists() {
            std::fs::create_dir_all(&self.worktree_root)
                .map_err(|e| WorktreeError::GitCommand { message: "failed to create worktree root".into(), source: e })?;
        }

        let dir_name = branch_name.replace('/', "--");
        let path = self.worktree_root.join(dir_name);

        let output = Command::new("git")
            .args(["worktree", "add"])
            .arg(&path)
            .args(["-b", branch_name])
            .arg(format!("origin/{base_branch}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand { message: "failed to run git worktree add".into(), source: e })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let _ = std::fs::remove_dir_all(&path);
            return Err(WorktreeError::GitExit { command: "worktree add".into(), code: output.status.code().unwrap_or(-1), stderr });
        }

        tracing::info!(path = %path.display(), branch = branch_name, base = base_branch, "worktree created");

        Ok(Sandbox { path, branch: branch_name.to_string(), repo_path: self.repo_path.clone(), git_lock: Arc::clone(&self.git_lock), released: false })
    }
}

/// Derives the branch name per §4.5 step 4:
/// `<prefix>/<yyyymmdd>/<sanitized-task-id>-<jobId[:8]>-a<attempt>`.
/// Sanitization lower-cases, replaces non-`[a-z0-9/_-]` with `-`,
/// collapses runs of `-`, trims leading/trailing `-` or `/`.
pub fn derive_branch_name(prefix: &str, date: chrono::NaiveDate, task_id: &str, job_id: uuid::Uuid, attempt: u32) -> String {
    let sanitized = sanitize_segment(task_id);
    let job_prefix: String = job_id.simple().to_string().chars().take(8).collect();
    format!("{prefix}/{}/{sanitized}-{job_prefix}-a{attempt}", date.format("%Y%m%d"))
}

fn sanitize_segment(raw: &str) -> String {
    static NON_ALLOWED_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"[^a-z0-9/_-]").unwrap());
    static RUNS_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"-{2,}").unwrap());

    let lowered = raw.to_lowercase();
    let replaced = NON_ALLOWED_RE.replace_all(&lowered, "-").to_string();
    let collapsed = RUNS_RE.replace_all(&replaced, "-").to_string();
    let trimmed = collapsed.trim_matches(|c| c == '-' || c == '/').to_string();
    if trimmed.is_empty() { "task".to_string() } else { trimmed }
}
