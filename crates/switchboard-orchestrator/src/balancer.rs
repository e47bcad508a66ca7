//! Weighted provider selection.
//!
//! The balancer turns provider health and an agent's weight profile into an
//! ordered candidate list for one call attempt. The top pick uses smooth
//! weighted round-robin over the live scores, so selection frequency
//! converges to score proportions while each individual pick stays
//! deterministic. The remaining candidates are ordered by score descending.

use crate::health::{ProviderHealth, ProviderId, ProviderStats};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Latency normalization reference: one second maps to a 0.5x multiplier.
const LATENCY_NORM_MS: f64 = 1000.0;

/// Per-role provider preference multipliers.
///
/// Providers absent from the map get a neutral multiplier of 1.0.
#[derive(Debug, Clone, Default)]
pub struct ProviderProfile {
    multipliers: HashMap<String, f64>,
}

impl ProviderProfile {
    /// Creates a profile from explicit provider multipliers.
    #[must_use]
    pub fn new(multipliers: HashMap<String, f64>) -> Self {
        Self { multipliers }
    }

    /// Preference multiplier for a provider (1.0 when unspecified).
    #[must_use]
    pub fn multiplier(&self, provider: &str) -> f64 {
        self.multipliers.get(provider).copied().unwrap_or(1.0)
    }
}

/// Load balancer over the configured provider pool.
///
/// Stateless apart from the round-robin counters; all health data lives in
/// the shared [`ProviderHealth`] registry.
#[derive(Debug)]
pub struct LoadBalancer {
    health: Arc<ProviderHealth>,
    /// Smooth weighted round-robin current weights, one per provider slot.
    rr_weights: Mutex<Vec<f64>>,
}

impl LoadBalancer {
    /// Creates a balancer over the given health registry.
    #[must_use]
    pub fn new(health: Arc<ProviderHealth>) -> Self {
        let rr_weights = Mutex::new(vec![0.0; health.len()]);
        Self { health, rr_weights }
    }

    /// Selection score for one provider under a profile.
    ///
    /// `base_weight * profile_multiplier * 1/(1+error_rate) *
    /// 1/(1+latency/1s)`. Pure policy execution; the balancer never adjusts
    /// weights on its own.
    fn score(&self, id: ProviderId, profile: &ProviderProfile) -> f64 {
        let name = self.health.name(id);
        let error_rate = self.health.error_rate(id);
        let normalized_latency = self.health.avg_latency_ms(id) / LATENCY_NORM_MS;
        let performance = 1.0 / (1.0 + error_rate) * (1.0 / (1.0 + normalized_latency));
        self.health.base_weight(id) * profile.multiplier(name) * performance
    }

    /// Produces the ordered candidate list for one call attempt.
    ///
    /// Providers with open circuits are excluded; providers in recovery are
    /// admitted only when a half-open trial can be acquired (the trial
    /// budget is consumed here). The first candidate is the smooth weighted
    /// round-robin pick; the rest are sorted by score descending with name
    /// tie-breaks.
    ///
    /// A half-open provider keeps its trial only when it wins the top spot,
    /// where the caller is guaranteed to invoke it and report an outcome.
    /// Trials acquired for providers that do not win are returned and those
    /// providers are left off the list, so an unexercised trial never
    /// drains the budget.
    ///
    /// # Arguments
    /// * `profile` - The calling agent's provider preference profile
    ///
    /// # Returns
    /// Returns an empty list only when every provider is unavailable.
    #[must_use]
    pub fn candidates(&self, profile: &ProviderProfile) -> Vec<String> {
        let mut scored: Vec<(ProviderId, f64)> = Vec::with_capacity(self.health.len());
        let mut on_trial: Vec<ProviderId> = Vec::new();
        for id in self.health.ids() {
            if !self.health.is_available(id) {
                continue;
            }
            if self.health.needs_trial(id) {
                if !self.health.try_acquire_trial(id) {
                    continue;
                }
                on_trial.push(id);
            }
            scored.push((id, self.score(id, profile)));
        }

        if scored.is_empty() {
            debug!("No available providers for candidate selection");
            return Vec::new();
        }

        let top = self.round_robin_pick(&scored);
        for &id in &on_trial {
            if id != top {
                self.health.release_trial(id);
            }
        }

        let mut rest: Vec<(ProviderId, f64)> = scored
            .into_iter()
            .filter(|(id, _)| *id != top && !on_trial.contains(id))
            .collect();
        rest.sort_by(|(a_id, a_score), (b_id, b_score)| {
            b_score
                .partial_cmp(a_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.health.name(*a_id).cmp(self.health.name(*b_id)))
        });

        let mut ordered = Vec::with_capacity(rest.len() + 1);
        ordered.push(self.health.name(top).to_string());
        ordered.extend(rest.into_iter().map(|(id, _)| self.health.name(id).to_string()));
        debug!(candidates = ?ordered, "Selected provider candidates");
        ordered
    }

    /// Smooth weighted round-robin over the scored candidates.
    ///
    /// Each candidate's running weight is raised by its score, the highest
    /// running weight wins (name tie-break), and the winner is lowered by
    /// the score total. Over many picks each provider is chosen in
    /// proportion to its score.
    fn round_robin_pick(&self, scored: &[(ProviderId, f64)]) -> ProviderId {
        let mut weights = self.rr_weights.lock().expect("round-robin lock");
        let mut total = 0.0;
        for &(id, score) in scored {
            weights[id.0] += score;
            total += score;
        }

        let mut winner = scored[0].0;
        for &(id, _) in &scored[1..] {
            let current = weights[id.0];
            let best = weights[winner.0];
            if current > best
                || (current == best && self.health.name(id) < self.health.name(winner))
            {
                winner = id;
            }
        }
        weights[winner.0] -= total;
        winner
    }

    /// Updates a provider's base weight (operational tuning).
    ///
    /// # Returns
    /// Returns `false` if the provider is unknown.
    pub fn set_weight(&self, provider: &str, weight: f64) -> bool {
        self.health.set_weight(provider, weight)
    }

    /// Current statistics for all providers, in configuration order.
    #[must_use]
    pub fn stats(&self) -> Vec<ProviderStats> {
        self.health.snapshot()
    }
}
