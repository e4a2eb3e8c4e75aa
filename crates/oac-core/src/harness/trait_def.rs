//! The `Adapter` trait -- the agent capability set (§4.1, §9 "Polymorphic
//! agent adapters"): `checkAvailability`, `execute`, `estimateTokens`,
//! `abort`. Each concrete provider (Claude-style, Codex-style, generic)
//! implements this trait. Object-safe so it can be stored as
//! `Box<dyn Adapter>` in the [`super::AgentRegistry`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::event_queue::EventQueue;
use super::types::{Availability, ExecuteParams, TokenEstimate};
use crate::model::Complexity;

/// A single subprocess invocation in flight.
pub struct Execution {
    pub execution_id: Uuid,
    pub events: Arc<EventQueue>,
    /// Resolves to the terminal result. Consumed by exactly one caller.
    pub result: tokio::sync::oneshot::Receiver<anyhow::Result<crate::harness::types::AgentResult>>,
    pub pid: Option<u32>,
}

/// Adapter interface for spawning and managing one provider's CLI.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `dyn Adapter` is a
/// legal trait object.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Canonical provider identifier (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Non-throwing availability probe. Must bound its own work to <=5s
    /// and fall back to a PATH-existence check (§4.1).
    async fn check_availability(&self) -> Availability;

    /// `estimateTokens(prompt, targetFiles) -> Estimate` (§4.2). Reads
    /// `targetFiles` from disk relative to `repo_root`; missing files
    /// contribute 0 context tokens.
    fn estimate_tokens(
        &self,
        repo_root: &std::path::Path,
        prompt: &str,
        target_files: &[String],
        complexity: Complexity,
    ) -> TokenEstimate;

    /// Launch the provider subprocess and return a handle to its event
    /// stream and terminal result (§4.2 "Subprocess lifecycle").
    async fn execute(&self, params: ExecuteParams) -> Result<Execution>;

    /// Idempotent. Sends graceful termination, escalates to a hard kill
    /// after the provider's grace window, awaits exit.
    async fn abort(&self, execution_id: Uuid) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Adapter) {}
};
