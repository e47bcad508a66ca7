//! Per-provider request, token, and cost accounting.
//!
//! Tracks what each completed task actually spent, independent of the
//! health window (which only keeps recent outcomes). Surfaced through the
//! orchestrator's system status for external monitoring.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

/// Accumulated usage for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCost {
    /// Successful requests attributed to this provider.
    pub requests: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// Total estimated cost in USD.
    pub cost: f64,
}

/// Aggregate usage across all providers.
///
/// Per-provider entries are keyed by name in sorted order, so two summaries
/// taken with no intervening activity compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    /// Total successful requests.
    pub total_requests: u64,
    /// Total tokens consumed.
    pub total_tokens: u64,
    /// Total estimated cost in USD.
    pub total_cost: f64,
    /// Per-provider breakdown.
    pub per_provider: BTreeMap<String, ProviderCost>,
}

/// Thread-safe cost accumulator.
#[derive(Debug, Default)]
pub struct CostTracker {
    entries: RwLock<BTreeMap<String, ProviderCost>>,
}

impl CostTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the usage of one successful call.
    ///
    /// # Arguments
    /// * `provider` - The provider that served the call
    /// * `tokens` - Tokens consumed
    /// * `cost` - Estimated cost in USD
    pub fn record(&self, provider: &str, tokens: u32, cost: f64) {
        let mut entries = self.entries.write().expect("cost lock");
        let entry = entries.entry(provider.to_string()).or_default();
        entry.requests += 1;
        entry.tokens += u64::from(tokens);
        entry.cost += cost;
        debug!(provider = %provider, tokens, cost, "Recorded provider usage");
    }

    /// Current aggregate summary.
    #[must_use]
    pub fn summary(&self) -> CostSummary {
        let entries = self.entries.read().expect("cost lock");
        let mut summary = CostSummary::default();
        for (name, entry) in entries.iter() {
            summary.total_requests += entry.requests;
            summary.total_tokens += entry.tokens;
            summary.total_cost += entry.cost;
            summary.per_provider.insert(name.clone(), entry.clone());
        }
        summary
    }

    /// Clears all accumulated usage.
    pub fn reset(&self) {
        self.entries.write().expect("cost lock").clear();
    }
}
