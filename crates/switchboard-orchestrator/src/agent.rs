//! Role-scoped task executors with provider failover.
//!
//! An [`Agent`] executes one task payload against the provider pool: it asks
//! the balancer for an ordered candidate list, walks it with bounded
//! attempts, and reports exactly one health outcome per attempt. Agents are
//! stateless with respect to task content; an [`AgentPool`] keeps a bounded
//! set of instances per role and hands out the least-loaded one.

use crate::balancer::{LoadBalancer, ProviderProfile};
use crate::error::{AttemptFailure, OrchestratorError, Result};
use crate::health::ProviderHealth;
use crate::task::Role;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchboard_abstraction::{
    BackendInvoker, CallFailure, PromptPayload, ProviderCallError, ProviderResponse,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Fallback call timeout for providers without an explicit one.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful execution result: the provider that answered and its response.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The provider that produced the response.
    pub provider: String,
    /// The normalized backend response.
    pub response: ProviderResponse,
}

/// Decrements the owning agent's in-flight counter on drop.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A role-scoped executor over the provider pool.
pub struct Agent {
    role: Role,
    profile: ProviderProfile,
    max_attempts: usize,
    in_flight: AtomicUsize,
    health: Arc<ProviderHealth>,
    balancer: Arc<LoadBalancer>,
    invoker: Arc<dyn BackendInvoker>,
    call_timeouts: Arc<HashMap<String, Duration>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("role", &self.role)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Creates an agent for a role.
    ///
    /// # Arguments
    /// * `role` - The role this agent serves
    /// * `profile` - Provider preference multipliers for the role
    /// * `max_attempts` - Upper bound on providers tried per execution
    /// * `health` - Shared provider health registry
    /// * `balancer` - Shared load balancer
    /// * `invoker` - The backend call boundary
    /// * `call_timeouts` - Per-provider call timeouts
    #[must_use]
    pub fn new(
        role: Role,
        profile: ProviderProfile,
        max_attempts: usize,
        health: Arc<ProviderHealth>,
        balancer: Arc<LoadBalancer>,
        invoker: Arc<dyn BackendInvoker>,
        call_timeouts: Arc<HashMap<String, Duration>>,
    ) -> Self {
        Self {
            role,
            profile,
            max_attempts,
            in_flight: AtomicUsize::new(0),
            health,
            balancer,
            invoker,
            call_timeouts,
        }
    }

    /// The role this agent serves.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of executions currently in flight on this agent.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn timeout_for(&self, provider: &str) -> Duration {
        self.call_timeouts.get(provider).copied().unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    /// Executes one payload with failover across the candidate providers.
    ///
    /// Walks the balancer's candidate list up to `max_attempts` entries.
    /// Every attempt, success or failure, reports exactly one outcome to
    /// provider health. Failed attempts advance to the next candidate
    /// without delay.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::AllProvidersUnavailable`] when the
    /// candidate list is empty (no call attempted), or
    /// [`OrchestratorError::ProvidersExhausted`] when every attempted
    /// candidate failed.
    pub async fn execute(&self, payload: &PromptPayload) -> Result<ExecutionOutcome> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlightGuard(&self.in_flight);

        let candidates = self.balancer.candidates(&self.profile);
        if candidates.is_empty() {
            warn!(role = %self.role, "No available providers, failing without attempting");
            return Err(OrchestratorError::AllProvidersUnavailable);
        }

        let attempt_limit = self.max_attempts.min(candidates.len());
        let mut attempts = Vec::new();

        for provider in candidates.into_iter().take(attempt_limit) {
            let call_timeout = self.timeout_for(&provider);
            let started = Instant::now();
            let result = match timeout(call_timeout, self.invoker.invoke(&provider, payload)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderCallError::new(
                    &provider,
                    CallFailure::Timeout(call_timeout.as_millis() as u64),
                )),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    if let Some(id) = self.health.provider_id(&provider) {
                        self.health.record_outcome(id, true, latency_ms, response.cost_estimate);
                    }
                    info!(
                        role = %self.role,
                        provider = %provider,
                        latency_ms,
                        tokens = response.tokens_used,
                        "Provider call succeeded"
                    );
                    return Ok(ExecutionOutcome { provider, response });
                }
                Err(error) => {
                    if let Some(id) = self.health.provider_id(&provider) {
                        self.health.record_outcome(id, false, latency_ms, 0.0);
                    }
                    warn!(
                        role = %self.role,
                        provider = %provider,
                        error = %error,
                        "Provider call failed, advancing to next candidate"
                    );
                    attempts.push(AttemptFailure { provider, error });
                }
            }
        }

        Err(OrchestratorError::ProvidersExhausted { attempts })
    }
}

/// A bounded pool of agent instances for one role.
///
/// Instances are created lazily up to `max_instances`; checkout prefers an
/// idle instance, grows the pool while every instance is busy, and
/// otherwise returns the least-loaded one.
pub struct AgentPool {
    role: Role,
    profile: ProviderProfile,
    max_attempts: usize,
    max_instances: usize,
    instances: Mutex<Vec<Arc<Agent>>>,
    health: Arc<ProviderHealth>,
    balancer: Arc<LoadBalancer>,
    invoker: Arc<dyn BackendInvoker>,
    call_timeouts: Arc<HashMap<String, Duration>>,
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("role", &self.role)
            .field("max_instances", &self.max_instances)
            .finish_non_exhaustive()
    }
}

impl AgentPool {
    /// Creates an empty pool for a role.
    #[must_use]
    pub fn new(
        role: Role,
        profile: ProviderProfile,
        max_attempts: usize,
        max_instances: usize,
        health: Arc<ProviderHealth>,
        balancer: Arc<LoadBalancer>,
        invoker: Arc<dyn BackendInvoker>,
        call_timeouts: Arc<HashMap<String, Duration>>,
    ) -> Self {
        Self {
            role,
            profile,
            max_attempts,
            max_instances: max_instances.max(1),
            instances: Mutex::new(Vec::new()),
            health,
            balancer,
            invoker,
            call_timeouts,
        }
    }

    /// Hands out the agent instance that should take the next task.
    #[must_use]
    pub fn checkout(&self) -> Arc<Agent> {
        let mut instances = self.instances.lock().expect("agent pool lock");

        if let Some(idle) = instances.iter().find(|agent| agent.in_flight() == 0) {
            return Arc::clone(idle);
        }

        if instances.len() < self.max_instances {
            let agent = Arc::new(Agent::new(
                self.role,
                self.profile.clone(),
                self.max_attempts,
                Arc::clone(&self.health),
                Arc::clone(&self.balancer),
                Arc::clone(&self.invoker),
                Arc::clone(&self.call_timeouts),
            ));
            instances.push(Arc::clone(&agent));
            debug!(role = %self.role, instances = instances.len(), "Created agent instance");
            return agent;
        }

        let least_loaded = instances
            .iter()
            .min_by_key(|agent| agent.in_flight())
            .expect("pool holds at least one instance");
        Arc::clone(least_loaded)
    }

    /// Total executions in flight across all instances.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let instances = self.instances.lock().expect("agent pool lock");
        instances.iter().map(|agent| agent.in_flight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::BreakerSettings;
    use switchboard_abstraction::MockInvoker;

    fn harness(
        providers: &[(&str, f64)],
        invoker: MockInvoker,
    ) -> (Arc<ProviderHealth>, Arc<LoadBalancer>, Arc<dyn BackendInvoker>) {
        let health = Arc::new(ProviderHealth::new(
            providers.iter().map(|(n, w)| ((*n).to_string(), *w)).collect(),
            BreakerSettings::default(),
        ));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&health)));
        (health, balancer, Arc::new(invoker))
    }

    fn agent(
        health: &Arc<ProviderHealth>,
        balancer: &Arc<LoadBalancer>,
        invoker: &Arc<dyn BackendInvoker>,
        profile: ProviderProfile,
    ) -> Agent {
        Agent::new(
            Role::GeneralAssistant,
            profile,
            3,
            Arc::clone(health),
            Arc::clone(balancer),
            Arc::clone(invoker),
            Arc::new(HashMap::new()),
        )
    }

    #[tokio::test]
    async fn test_execute_success_on_first_candidate() {
        let invoker = MockInvoker::new().with_success("solo", "done", 42, 0.001);
        let (health, balancer, invoker) = harness(&[("solo", 1.0)], invoker);
        let agent = agent(&health, &balancer, &invoker, ProviderProfile::default());

        let outcome = agent
            .execute(&PromptPayload::new("hello"))
            .await
            .expect("execution succeeds");

        assert_eq!(outcome.provider, "solo");
        assert_eq!(outcome.response.content, "done");

        let id = health.provider_id("solo").unwrap();
        assert_eq!(health.error_rate(id), 0.0);
        let stats = health.snapshot();
        assert_eq!(stats[0].success_count, 1);
        assert_eq!(stats[0].failure_count, 0);
    }

    #[tokio::test]
    async fn test_failover_to_second_candidate() {
        let invoker = MockInvoker::new()
            .with_failure("primary", CallFailure::RateLimited { retry_after_ms: Some(1000) })
            .with_success("backup", "ok", 10, 0.0005);
        let (health, balancer, invoker) = harness(&[("primary", 1.0), ("backup", 0.1)], invoker);
        let agent = agent(&health, &balancer, &invoker, ProviderProfile::default());

        let outcome = agent
            .execute(&PromptPayload::new("hello"))
            .await
            .expect("failover succeeds");
        assert_eq!(outcome.provider, "backup");

        // Exactly one failure on the primary, one success on the backup.
        let stats = health.snapshot();
        let primary = stats.iter().find(|s| s.name == "primary").unwrap();
        let backup = stats.iter().find(|s| s.name == "backup").unwrap();
        assert_eq!(primary.failure_count, 1);
        assert_eq!(primary.success_count, 0);
        assert_eq!(backup.success_count, 1);
    }

    #[tokio::test]
    async fn test_all_candidates_fail_aggregates_errors() {
        let invoker = MockInvoker::new()
            .with_failure("one", CallFailure::Timeout(5000))
            .with_failure("two", CallFailure::AuthenticationFailed("bad key".to_string()));
        let (health, balancer, invoker) = harness(&[("one", 1.0), ("two", 1.0)], invoker);
        let agent = agent(&health, &balancer, &invoker, ProviderProfile::default());

        let err = agent.execute(&PromptPayload::new("hello")).await.unwrap_err();
        match err {
            OrchestratorError::ProvidersExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                let providers: Vec<&str> =
                    attempts.iter().map(|a| a.provider.as_str()).collect();
                assert!(providers.contains(&"one"));
                assert!(providers.contains(&"two"));
            }
            other => panic!("expected ProvidersExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_all_open_fails_without_invoking() {
        let invoker = MockInvoker::new().with_success("solo", "unreachable", 1, 0.0);
        let (health, balancer, invoker) = harness(&[("solo", 1.0)], invoker);
        health.trip("solo");
        let agent = agent(&health, &balancer, &invoker, ProviderProfile::default());

        let err = agent.execute(&PromptPayload::new("hello")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllProvidersUnavailable));
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_failover() {
        let invoker = MockInvoker::new()
            .with_failure("a", CallFailure::Timeout(1000))
            .with_failure("b", CallFailure::Timeout(1000))
            .with_failure("c", CallFailure::Timeout(1000));
        let (health, balancer, invoker) = harness(&[("a", 1.0), ("b", 1.0), ("c", 1.0)], invoker);
        let agent = Agent::new(
            Role::GeneralAssistant,
            ProviderProfile::default(),
            2,
            Arc::clone(&health),
            Arc::clone(&balancer),
            Arc::clone(&invoker),
            Arc::new(HashMap::new()),
        );

        let err = agent.execute(&PromptPayload::new("hello")).await.unwrap_err();
        match err {
            OrchestratorError::ProvidersExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("expected ProvidersExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_returns_to_zero() {
        let invoker = MockInvoker::new().with_success("solo", "done", 1, 0.0);
        let (health, balancer, invoker) = harness(&[("solo", 1.0)], invoker);
        let agent = agent(&health, &balancer, &invoker, ProviderProfile::default());

        assert_eq!(agent.in_flight(), 0);
        agent.execute(&PromptPayload::new("hello")).await.unwrap();
        assert_eq!(agent.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pool_reuses_idle_and_grows_when_busy() {
        let invoker = MockInvoker::new().with_success("solo", "done", 1, 0.0);
        let (health, balancer, invoker) = harness(&[("solo", 1.0)], invoker);
        let pool = AgentPool::new(
            Role::CodeDeveloper,
            ProviderProfile::default(),
            3,
            2,
            health,
            balancer,
            invoker,
            Arc::new(HashMap::new()),
        );

        let first = pool.checkout();
        // Idle instance is reused.
        let again = pool.checkout();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(pool.in_flight(), 0);
    }
}
