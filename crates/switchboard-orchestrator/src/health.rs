//! Per-provider health tracking and circuit breaking.
//!
//! One [`ProviderHealth`] registry is created at orchestrator start with a
//! fixed slot per configured provider and lives for the process lifetime.
//! Slots are indexed by [`ProviderId`] and locked individually, so outcome
//! reports for different providers never contend.
//!
//! The failure window is count-based: the last `window_size` outcomes per
//! provider (default 50), with latency folded in as an exponentially
//! weighted moving average (alpha 0.2).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Index of a provider's slot in the health arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub(crate) usize);

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls permitted.
    Closed,
    /// Provider is isolated; calls skipped until the recovery timeout
    /// elapses from the recorded instant.
    Open(Instant),
    /// Recovery phase; a bounded number of trial calls allowed.
    HalfOpen,
}

/// Serializable view of a circuit state, used in stats snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    /// Circuit is closed.
    Closed,
    /// Circuit is open.
    Open,
    /// Circuit is half-open.
    HalfOpen,
}

impl From<CircuitState> for CircuitStateKind {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open(_) => Self::Open,
            CircuitState::HalfOpen => Self::HalfOpen,
        }
    }
}

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Failures within the tracking window that open the circuit.
    pub failure_threshold: usize,
    /// How long an open circuit waits before allowing trial calls.
    pub recovery_timeout: Duration,
    /// Trial calls permitted in the half-open state.
    pub half_open_trials: u32,
    /// Number of recent outcomes kept per provider.
    pub window_size: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_trials: 2,
            window_size: 50,
        }
    }
}

/// Latency EWMA smoothing factor.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Rolling outcome statistics for one provider.
#[derive(Debug, Default)]
struct RollingStats {
    /// Recent outcomes, oldest first (`true` = success).
    outcomes: VecDeque<bool>,
    successes: usize,
    failures: usize,
    avg_latency_ms: f64,
    latency_samples: u64,
    total_cost: f64,
}

impl RollingStats {
    fn record(&mut self, success: bool, latency_ms: u64, cost: f64, window_size: usize) {
        self.outcomes.push_back(success);
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        while self.outcomes.len() > window_size {
            match self.outcomes.pop_front() {
                Some(true) => self.successes -= 1,
                Some(false) => self.failures -= 1,
                None => break,
            }
        }

        let latency = latency_ms as f64;
        if self.latency_samples == 0 {
            self.avg_latency_ms = latency;
        } else {
            self.avg_latency_ms =
                LATENCY_EWMA_ALPHA * latency + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms;
        }
        self.latency_samples += 1;
        self.total_cost += cost;
    }

    fn error_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }

    /// Clears the window after a successful recovery so historical failures
    /// from the open period cannot immediately re-trip the breaker.
    fn reset_window(&mut self) {
        self.outcomes.clear();
        self.successes = 0;
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    /// Trial budget remaining while half-open.
    trials_remaining: u32,
    /// Successful trial calls observed in the current half-open phase.
    trial_successes: u32,
    last_failure_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            circuit: CircuitState::Closed,
            trials_remaining: 0,
            trial_successes: 0,
            last_failure_at: None,
        }
    }
}

/// One provider's slot in the arena.
#[derive(Debug)]
struct ProviderSlot {
    name: String,
    base_weight: RwLock<f64>,
    stats: RwLock<RollingStats>,
    breaker: RwLock<BreakerState>,
}

/// Point-in-time statistics for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider name.
    pub name: String,
    /// Operator-configured base weight.
    pub base_weight: f64,
    /// Successes within the tracking window.
    pub success_count: usize,
    /// Failures within the tracking window.
    pub failure_count: usize,
    /// Windowed failure rate (0.0-1.0).
    pub error_rate: f64,
    /// EWMA latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Total cost attributed to this provider in USD.
    pub total_cost: f64,
    /// Current circuit state.
    pub circuit_state: CircuitStateKind,
}

/// Health registry for the configured provider pool.
///
/// `record_outcome` is the only mutator of health data and may be called
/// concurrently from any number of task executions; reads never touch more
/// than one slot's lock.
#[derive(Debug)]
pub struct ProviderHealth {
    slots: Vec<ProviderSlot>,
    index: HashMap<String, ProviderId>,
    settings: BreakerSettings,
}

impl ProviderHealth {
    /// Creates the registry with one slot per configured provider.
    ///
    /// # Arguments
    /// * `providers` - Provider names with their base weights
    /// * `settings` - Circuit breaker tuning
    #[must_use]
    pub fn new(providers: Vec<(String, f64)>, settings: BreakerSettings) -> Self {
        let mut slots = Vec::with_capacity(providers.len());
        let mut index = HashMap::with_capacity(providers.len());
        for (position, (name, weight)) in providers.into_iter().enumerate() {
            index.insert(name.clone(), ProviderId(position));
            slots.push(ProviderSlot {
                name,
                base_weight: RwLock::new(weight),
                stats: RwLock::new(RollingStats::default()),
                breaker: RwLock::new(BreakerState::default()),
            });
        }
        Self { slots, index, settings }
    }

    /// Number of configured providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry has no providers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Looks up a provider's slot id by name.
    #[must_use]
    pub fn provider_id(&self, name: &str) -> Option<ProviderId> {
        self.index.get(name).copied()
    }

    /// Provider name for a slot id.
    #[must_use]
    pub fn name(&self, id: ProviderId) -> &str {
        &self.slots[id.0].name
    }

    /// All slot ids, in configuration order.
    pub fn ids(&self) -> impl Iterator<Item = ProviderId> + '_ {
        (0..self.slots.len()).map(ProviderId)
    }

    /// Checks whether the provider may receive calls right now.
    ///
    /// A read-only check: Closed circuits are available, Open circuits
    /// become eligible once the recovery timeout has elapsed (the actual
    /// transition happens in [`Self::try_acquire_trial`]), and half-open
    /// circuits are available while trial budget remains.
    #[must_use]
    pub fn is_available(&self, id: ProviderId) -> bool {
        let breaker = self.slots[id.0].breaker.read().expect("breaker lock");
        match breaker.circuit {
            CircuitState::Closed => true,
            CircuitState::Open(opened_at) => opened_at.elapsed() >= self.settings.recovery_timeout,
            CircuitState::HalfOpen => breaker.trials_remaining > 0,
        }
    }

    /// Whether the provider currently requires a trial acquisition before a
    /// call (open-but-expired or half-open).
    #[must_use]
    pub fn needs_trial(&self, id: ProviderId) -> bool {
        let breaker = self.slots[id.0].breaker.read().expect("breaker lock");
        match breaker.circuit {
            CircuitState::Closed => false,
            CircuitState::Open(_) | CircuitState::HalfOpen => true,
        }
    }

    /// Acquires one half-open trial for the provider.
    ///
    /// Performs the lazy Open→HalfOpen transition when the recovery timeout
    /// has elapsed, then decrements the shared trial budget. Returns `false`
    /// when the circuit is still open or the budget is exhausted.
    pub fn try_acquire_trial(&self, id: ProviderId) -> bool {
        let slot = &self.slots[id.0];
        let mut breaker = slot.breaker.write().expect("breaker lock");

        if let CircuitState::Open(opened_at) = breaker.circuit {
            if opened_at.elapsed() >= self.settings.recovery_timeout {
                breaker.circuit = CircuitState::HalfOpen;
                breaker.trials_remaining = self.settings.half_open_trials;
                breaker.trial_successes = 0;
                debug!(provider = %slot.name, "Circuit breaker: Open -> HalfOpen (recovery timeout elapsed)");
            }
        }

        match breaker.circuit {
            CircuitState::Closed => true,
            CircuitState::Open(_) => false,
            CircuitState::HalfOpen => {
                if breaker.trials_remaining > 0 {
                    breaker.trials_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Returns a half-open trial that was acquired but never exercised.
    ///
    /// Every acquired trial must either be exercised (its outcome reported
    /// via [`Self::record_outcome`]) or given back here; otherwise the
    /// trial budget drains without the breaker ever learning anything.
    /// The budget is capped at the configured trial count.
    pub fn release_trial(&self, id: ProviderId) {
        let slot = &self.slots[id.0];
        let mut breaker = slot.breaker.write().expect("breaker lock");
        if let CircuitState::HalfOpen = breaker.circuit {
            breaker.trials_remaining =
                (breaker.trials_remaining + 1).min(self.settings.half_open_trials);
        }
    }

    /// Records the outcome of one call attempt against a provider.
    ///
    /// The sole mutator of health data; safe to call concurrently.
    ///
    /// # Arguments
    /// * `id` - The provider's slot id
    /// * `success` - Whether the call succeeded
    /// * `latency_ms` - Observed call latency
    /// * `cost` - Cost attributed to the call in USD
    pub fn record_outcome(&self, id: ProviderId, success: bool, latency_ms: u64, cost: f64) {
        let slot = &self.slots[id.0];

        let windowed_failures = {
            let mut stats = slot.stats.write().expect("stats lock");
            stats.record(success, latency_ms, cost, self.settings.window_size);
            stats.failures
        };

        let mut breaker = slot.breaker.write().expect("breaker lock");
        match breaker.circuit {
            CircuitState::HalfOpen => {
                if success {
                    breaker.trial_successes += 1;
                    if breaker.trial_successes >= self.settings.half_open_trials {
                        breaker.circuit = CircuitState::Closed;
                        breaker.trials_remaining = 0;
                        breaker.trial_successes = 0;
                        drop(breaker);
                        slot.stats.write().expect("stats lock").reset_window();
                        debug!(provider = %slot.name, "Circuit breaker: HalfOpen -> Closed (recovery successful)");
                    }
                } else {
                    breaker.circuit = CircuitState::Open(Instant::now());
                    breaker.last_failure_at = Some(Instant::now());
                    breaker.trials_remaining = 0;
                    breaker.trial_successes = 0;
                    warn!(provider = %slot.name, "Circuit breaker: HalfOpen -> Open (trial call failed)");
                }
            }
            CircuitState::Closed => {
                if !success {
                    breaker.last_failure_at = Some(Instant::now());
                    if windowed_failures >= self.settings.failure_threshold {
                        breaker.circuit = CircuitState::Open(Instant::now());
                        warn!(
                            provider = %slot.name,
                            failures = windowed_failures,
                            threshold = self.settings.failure_threshold,
                            "Circuit breaker: Closed -> Open (failure threshold reached)"
                        );
                    }
                }
            }
            CircuitState::Open(_) => {
                // Late result from a call already in flight when the
                // circuit opened; the window keeps it, the breaker ignores it.
            }
        }
    }

    /// Forces the circuit open for a provider (operational kill switch).
    ///
    /// # Returns
    /// Returns `false` if the provider is unknown.
    pub fn trip(&self, name: &str) -> bool {
        let Some(id) = self.provider_id(name) else {
            return false;
        };
        let slot = &self.slots[id.0];
        let mut breaker = slot.breaker.write().expect("breaker lock");
        breaker.circuit = CircuitState::Open(Instant::now());
        breaker.last_failure_at = Some(Instant::now());
        breaker.trials_remaining = 0;
        breaker.trial_successes = 0;
        warn!(provider = %slot.name, "Circuit breaker forced open");
        true
    }

    /// Windowed failure rate for a provider (0.0-1.0).
    #[must_use]
    pub fn error_rate(&self, id: ProviderId) -> f64 {
        self.slots[id.0].stats.read().expect("stats lock").error_rate()
    }

    /// EWMA latency for a provider in milliseconds.
    #[must_use]
    pub fn avg_latency_ms(&self, id: ProviderId) -> f64 {
        self.slots[id.0].stats.read().expect("stats lock").avg_latency_ms
    }

    /// Current base weight for a provider.
    #[must_use]
    pub fn base_weight(&self, id: ProviderId) -> f64 {
        *self.slots[id.0].base_weight.read().expect("weight lock")
    }

    /// Updates the base weight for a provider (operational tuning).
    ///
    /// # Returns
    /// Returns `false` if the provider is unknown.
    pub fn set_weight(&self, name: &str, weight: f64) -> bool {
        match self.provider_id(name) {
            Some(id) => {
                *self.slots[id.0].base_weight.write().expect("weight lock") = weight;
                debug!(provider = %name, weight, "Updated provider base weight");
                true
            }
            None => false,
        }
    }

    /// Current circuit state for a provider, without side effects.
    #[must_use]
    pub fn circuit_state(&self, id: ProviderId) -> CircuitStateKind {
        self.slots[id.0].breaker.read().expect("breaker lock").circuit.into()
    }

    /// Snapshot of all provider statistics, in configuration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderStats> {
        self.slots
            .iter()
            .map(|slot| {
                let stats = slot.stats.read().expect("stats lock");
                let breaker = slot.breaker.read().expect("breaker lock");
                ProviderStats {
                    name: slot.name.clone(),
                    base_weight: *slot.base_weight.read().expect("weight lock"),
                    success_count: stats.successes,
                    failure_count: stats.failures,
                    error_rate: stats.error_rate(),
                    avg_latency_ms: stats.avg_latency_ms,
                    total_cost: stats.total_cost,
                    circuit_state: breaker.circuit.into(),
                }
            })
            .collect()
    }
}
