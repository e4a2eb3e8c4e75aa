//! Budget Planner (§4.6): greedy, reserve-aware selection over a
//! pre-sorted list of (work item, token estimate) pairs.
//!
//! Grounded on the teacher's greedy allocation style as seen in
//! `token/mod.rs` (running-total bookkeeping against a cap); the
//! selection predicate itself is this system's own, since the teacher
//! tracks spend rather than planning it ahead of time.

use crate::model::{DeferReason, DeferredEntry, ExecutionPlan, SelectedEntry, TokenEstimate, WorkItem};

/// `plan(pairs, total_budget) → ExecutionPlan` (§4.6). `pairs` must
/// already be sorted by priority desc, title asc -- the planner does not
/// re-sort; it only walks and classifies.
pub fn plan(pairs: &[(WorkItem, TokenEstimate)], total_budget: u64) -> ExecutionPlan {
    let reserve_tokens = (total_budget as f64 * 0.10).ceil() as u64;
    let effective = total_budget.saturating_sub(reserve_tokens);

    let mut selected = Vec::new();
    let mut deferred = Vec::new();
    let mut running: u64 = 0;

    for (item, estimate) in pairs {
        if !estimate.feasible {
            deferred.push(DeferredEntry { item: item.clone(), estimate: *estimate, reason: DeferReason::TooComplex });
            continue;
        }
        if estimate.confidence < 0.3 {
            deferred.push(DeferredEntry { item: item.clone(), estimate: *estimate, reason: DeferReason::LowConfidence });
            continue;
        }
        if running.saturating_add(estimate.total) > effective {
            deferred.push(DeferredEntry { item: item.clone(), estimate: *estimate, reason: DeferReason::BudgetExceeded });
            continue;
        }
        running += estimate.total;
        selected.push(SelectedEntry { item: item.clone(), estimate: *estimate, cumulative_budget_used: running });
    }

    ExecutionPlan {
        total_budget,
        reserve_tokens,
        selected,
        deferred,
        remaining_tokens: effective.saturating_sub(running),
    }
}
