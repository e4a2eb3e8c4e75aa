//! Per-provider circuit breaker (§4.5 "Circuit breaker", §3 "Provider
//! Health"): a first-class type rather than a free-standing health map,
//! since §3 names Provider Health as its own tracked data model entity.
//!
//! Closed → Open after `FAILURE_THRESHOLD` consecutive failures; Open →
//! HalfOpen once `COOLDOWN` has elapsed since the last failure; HalfOpen
//! reverts to Open on the next failure or resets to Closed on success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::model::{CircuitState, ProviderHealth};

const FAILURE_THRESHOLD: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(60);

/// Owns one [`ProviderHealth`] record per provider id, behind a single
/// mutex. Cheap to share: callers hold it behind `Arc<EngineState>`
/// alongside the rest of the engine's run-scoped state.
#[derive(Default)]
pub struct CircuitBreaker {
    health: Mutex<HashMap<String, ProviderHealth>>,
}

impl CircuitBreaker {
    pub fn new(provider_ids: impl IntoIterator<Item = String>) -> Self {
        let health = provider_ids.into_iter().map(|id| (id, ProviderHealth::default())).collect();
        Self { health: Mutex::new(health) }
    }

    /// Whether a dispatch attempt to `provider_id` should proceed right
    /// now. Transitions Open -> HalfOpen in place when the cooldown has
    /// elapsed, so this is the single entry point that advances time-based
    /// state (callers never need to poll separately).
    pub fn allows(&self, provider_id: &str) -> bool {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(provider_id.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = entry
                    .last_failure_time
                    .map(|t| Utc::now().signed_duration_since(t).to_std().unwrap_or_default() >= COOLDOWN)
                    .unwrap_or(true);
                if cooled_down {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, provider_id: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(provider_id.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.state = CircuitState::Closed;
    }

    /// A failure observed while HalfOpen trips the breaker back open
    /// immediately (one probe failure is enough); a failure in Closed
    /// only trips it once `FAILURE_THRESHOLD` consecutive failures
    /// accumulate.
    pub fn record_failure(&self, provider_id: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(provider_id.to_string()).or_default();
        if entry.state == CircuitState::HalfOpen {
            entry.state = CircuitState::Open;
            entry.last_failure_time = Some(Utc::now());
            return;
        }
        entry.consecutive_failures += 1;
        entry.last_failure_time = Some(Utc::now());
        if entry.consecutive_failures >= FAILURE_THRESHOLD {
            entry.state = CircuitState::Open;
        }
    }

    /// Snapshot of every tracked provider's current health, for reporting.
    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.health.lock().unwrap().clone()
    }
}
