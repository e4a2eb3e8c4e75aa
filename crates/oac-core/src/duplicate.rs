//! Duplicate Guard (§4.8): two fail-open checks against the external
//! host's open PR list, guarding against double-work under concurrent
//! peers running the same discovery set.
//!
//! The host integration itself (GitHub, GitLab, ...) is a collaborator
//! outside this system's scope, so the guard is written against a small
//! injectable trait rather than a concrete client -- the same shape as
//! the teacher's `Isolation` trait (`isolation/mod.rs`), which decouples
//! a capability the core needs from the backend that provides it.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::model::WorkItem;

/// Minimal shape of an open PR as the guard needs it.
#[derive(Debug, Clone)]
pub struct OpenPullRequest {
    pub title: String,
    pub body: String,
}

/// Capability the guard needs from the external host. A real
/// implementation wraps a GitHub/GitLab API client; tests use a fake.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Up to 100 most-recently-updated open PRs.
    async fn list_open_pull_requests(&self) -> anyhow::Result<Vec<OpenPullRequest>>;
}

static ISSUE_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:fixes|closes|resolves)\s+#(\d+)\b").unwrap());

/// Extracts issue numbers referenced via `Fixes|Closes|Resolves #N`.
fn referenced_issue_numbers(body: &str) -> HashSet<u64> {
    ISSUE_REF_RE.captures_iter(body).filter_map(|c| c[1].parse().ok()).collect()
}

async fn open_pr_issue_numbers(client: &dyn HostClient, tag: &str) -> HashSet<u64> {
    match client.list_open_pull_requests().await {
        Ok(prs) => prs
            .iter()
            .filter(|pr| pr.title.starts_with(tag))
            .flat_map(|pr| referenced_issue_numbers(&pr.body))
            .collect(),
        Err(error) => {
            // Fail-open: better to risk a spurious duplicate than to lose
            // a planning/push cycle because the host is unreachable.
            tracing::warn!(%error, "duplicate guard could not reach host, proceeding without filtering");
            HashSet::new()
        }
    }
}

/// Pre-plan check (§4.8): excludes any work item whose linked-issue
/// number already has an open, tagged PR referencing it.
pub async fn filter_already_covered(client: &dyn HostClient, tag: &str, items: Vec<WorkItem>) -> Vec<WorkItem> {
    let covered = open_pr_issue_numbers(client, tag).await;
    if covered.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| item.linked_issue.as_ref().map(|issue| !covered.contains(&issue.number)).unwrap_or(true))
        .collect()
}

/// Pre-push check (§4.8): re-queries immediately before pushing a job's
/// branch. Returns true if the push should be skipped.
pub async fn should_skip_push(client: &dyn HostClient, tag: &str, item: &WorkItem) -> bool {
    let Some(issue) = &item.linked_issue else { return false };
    let covered = open_pr_issue_numbers(client, tag).await;
    covered.contains(&issue.number)
}
