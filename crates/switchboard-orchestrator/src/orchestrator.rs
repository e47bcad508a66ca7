//! Task lifecycle ownership: submission, dispatch, and aggregation.
//!
//! The [`Orchestrator`] is an owned value constructed from injected
//! configuration and a backend invoker; no process-wide state. A single
//! dispatch loop owns queue pops, a global semaphore bounds concurrent
//! executions, and each dispatched task runs on its own spawned worker.

use crate::agent::AgentPool;
use crate::balancer::LoadBalancer;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::cost::{CostSummary, CostTracker};
use crate::error::{OrchestratorError, Result};
use crate::health::{ProviderHealth, ProviderStats};
use crate::queue::{QueueEntry, TaskQueue};
use crate::task::{Priority, Role, Task, TaskId, TaskSnapshot, TaskStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_abstraction::{BackendInvoker, PromptPayload};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate view of the orchestrator for external monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    /// Executions currently holding a concurrency permit.
    pub active_tasks: usize,
    /// Pending tasks waiting in the queue.
    pub queue_depth: usize,
    /// Tasks that reached Completed.
    pub completed_tasks: u64,
    /// Tasks that reached Failed.
    pub failed_tasks: u64,
    /// Per-provider health statistics, in configuration order.
    pub providers: Vec<ProviderStats>,
    /// Per-provider usage accounting.
    pub costs: CostSummary,
}

/// Shared internals, referenced by the dispatch loop and spawned workers.
struct Inner {
    config: OrchestratorConfig,
    health: Arc<ProviderHealth>,
    balancer: Arc<LoadBalancer>,
    pools: HashMap<Role, AgentPool>,
    queue: TaskQueue,
    tasks: RwLock<HashMap<TaskId, Task>>,
    costs: CostTracker,
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Multi-provider task orchestrator.
pub struct Orchestrator {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.inner.health.len())
            .field("concurrency_limit", &self.inner.concurrency_limit)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator from validated configuration and a backend
    /// invoker.
    ///
    /// One agent pool is built per known role using the configured profile
    /// (neutral when none is given).
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the configuration fails validation.
    pub fn new(
        config: OrchestratorConfig,
        invoker: Arc<dyn BackendInvoker>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let health = Arc::new(ProviderHealth::new(
            config.provider_weights(),
            config.breaker_settings(),
        ));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&health)));
        let call_timeouts = Arc::new(config.call_timeouts());

        let pools = Role::ALL
            .into_iter()
            .map(|role| {
                let pool = AgentPool::new(
                    role,
                    config.profile_for(role),
                    config.max_attempts,
                    config.max_agents_per_role,
                    Arc::clone(&health),
                    Arc::clone(&balancer),
                    Arc::clone(&invoker),
                    Arc::clone(&call_timeouts),
                );
                (role, pool)
            })
            .collect();

        let concurrency_limit = config.concurrency_limit();
        info!(
            providers = health.len(),
            concurrency_limit,
            max_attempts = config.max_attempts,
            "Orchestrator initialized"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                health,
                balancer,
                pools,
                queue: TaskQueue::new(),
                tasks: RwLock::new(HashMap::new()),
                costs: CostTracker::new(),
                semaphore: Arc::new(Semaphore::new(concurrency_limit)),
                concurrency_limit,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            shutdown_tx,
            dispatch_handle: Mutex::new(None),
        })
    }

    /// Submits a task for execution.
    ///
    /// The task is recorded as Pending and enqueued priority-then-FIFO; it
    /// will not run until the dispatch loop (or [`Self::drain`]) picks it
    /// up.
    ///
    /// # Arguments
    /// * `title` - Short label (opaque payload)
    /// * `description` - Full payload
    /// * `role` - Role name; must parse to a known role
    /// * `priority` - Dispatch priority
    ///
    /// # Errors
    /// Returns [`OrchestratorError::UnknownRole`] for an unrecognized role
    /// name; the only synchronous rejection.
    pub async fn submit(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        role: &str,
        priority: Priority,
    ) -> Result<TaskId> {
        let role: Role = role
            .parse()
            .map_err(|_| OrchestratorError::UnknownRole(role.to_string()))?;

        let task = Task::new(title, description, role, priority);
        let id = task.id;
        info!(task_id = %id, role = %role, priority = %priority, "Task submitted");

        self.inner.tasks.write().await.insert(id, task);
        self.inner.queue.push(QueueEntry { id, role, priority }).await;
        Ok(id)
    }

    /// Cancels a task that is still pending.
    ///
    /// Once a task has been dispatched it runs to completion or failure;
    /// the only in-flight cancellation mechanism is the per-provider call
    /// timeout.
    ///
    /// # Returns
    /// Returns `true` if the task was pending and is now cancelled.
    pub async fn cancel(&self, id: TaskId) -> bool {
        if !self.inner.queue.cancel(id).await {
            return false;
        }
        let mut tasks = self.inner.tasks.write().await;
        if let Some(task) = tasks.get_mut(&id) {
            task.status = TaskStatus::Failed;
            task.error = Some("Cancelled before dispatch".to_string());
            task.completed_at = Some(Utc::now());
        }
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %id, "Task cancelled");
        true
    }

    /// Read-only snapshot of a task.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::TaskNotFound`] for an unknown id.
    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.inner
            .tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::TaskNotFound(id))
    }

    /// Aggregate system view for external monitoring.
    ///
    /// Idempotent: two calls with no intervening task activity return
    /// identical snapshots.
    pub async fn system_status(&self) -> SystemSnapshot {
        SystemSnapshot {
            active_tasks: self.inner.active_tasks(),
            queue_depth: self.inner.queue.depth().await,
            completed_tasks: self.inner.completed.load(Ordering::Relaxed),
            failed_tasks: self.inner.failed.load(Ordering::Relaxed),
            providers: self.inner.health.snapshot(),
            costs: self.inner.costs.summary(),
        }
    }

    /// Starts the background dispatch loop.
    ///
    /// Idempotent: calling `start` while the loop is running has no effect.
    pub async fn start(&self) {
        let mut handle = self.dispatch_handle.lock().await;
        if handle.is_some() {
            debug!("Dispatch loop already running");
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            inner.dispatch_loop(shutdown_rx).await;
        }));
        info!("Dispatch loop started");
    }

    /// Stops the dispatch loop.
    ///
    /// In-flight executions keep running to completion; only new dispatch
    /// stops.
    pub async fn stop(&self) {
        let handle = self.dispatch_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(true);
            let _ = handle.await;
            info!("Dispatch loop stopped");
        }
    }

    /// Dispatches every pending task and awaits those executions.
    ///
    /// Batch convenience for callers that do not run the background loop;
    /// respects the global concurrency limit.
    pub async fn drain(&self) {
        let mut handles = Vec::new();
        loop {
            let permit = Arc::clone(&self.inner.semaphore)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let Some(entry) = self.inner.queue.pop().await else {
                break;
            };
            handles.push(self.inner.spawn_execution(entry, permit).await);
        }
        futures::future::join_all(handles).await;
    }

    /// Updates a provider's base weight (operational tuning).
    ///
    /// # Returns
    /// Returns `false` if the provider is unknown.
    pub fn set_provider_weight(&self, provider: &str, weight: f64) -> bool {
        self.inner.balancer.set_weight(provider, weight)
    }

    /// Forces a provider's circuit open (operational kill switch).
    ///
    /// # Returns
    /// Returns `false` if the provider is unknown.
    pub fn trip_provider(&self, provider: &str) -> bool {
        self.inner.health.trip(provider)
    }
}

impl Inner {
    fn active_tasks(&self) -> usize {
        self.concurrency_limit - self.semaphore.available_permits()
    }

    /// Single-owner dispatch loop: waits for a free concurrency slot, then
    /// pops the queue, sleeping between polls when it is empty.
    ///
    /// The slot is taken before the pop so that a free slot always goes to
    /// the highest-priority task pending at that moment; a task popped
    /// first and then parked waiting on a permit would jump anything
    /// submitted while the system was at capacity.
    async fn dispatch_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.expect("semaphore is never closed")
                }
                changed = shutdown_rx.changed() => {
                    // Sender dropped means the orchestrator is gone.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };
            if let Some(entry) = self.queue.pop().await {
                // Workers are tracked by the semaphore, not joined here.
                let _ = self.spawn_execution(entry, permit).await;
            } else {
                drop(permit);
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    /// Marks the task Assigned and launches its execution on a worker that
    /// holds the already-acquired concurrency permit.
    async fn spawn_execution(
        self: &Arc<Self>,
        entry: QueueEntry,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        self.set_status(entry.id, TaskStatus::Assigned).await;
        debug!(task_id = %entry.id, role = %entry.role, "Task assigned");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            inner.execute_entry(entry).await;
        })
    }

    /// Runs one task on an agent from its role pool and records the
    /// terminal outcome.
    async fn execute_entry(&self, entry: QueueEntry) {
        let payload = {
            let tasks = self.tasks.read().await;
            let Some(task) = tasks.get(&entry.id) else {
                warn!(task_id = %entry.id, "Dequeued task missing from store");
                return;
            };
            let mut payload = PromptPayload::new(task.description.clone());
            if !task.title.is_empty() {
                payload = payload.with_system(task.title.clone());
            }
            payload
        };

        let agent = self
            .pools
            .get(&entry.role)
            .expect("every role has a pool")
            .checkout();
        self.set_status(entry.id, TaskStatus::Executing).await;

        match agent.execute(&payload).await {
            Ok(outcome) => {
                self.costs.record(
                    &outcome.provider,
                    outcome.response.tokens_used,
                    outcome.response.cost_estimate,
                );
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&entry.id) {
                    task.status = TaskStatus::Completed;
                    task.assigned_provider = Some(outcome.provider.clone());
                    task.result = Some(outcome.response.content);
                    task.tokens_used = outcome.response.tokens_used;
                    task.cost_estimate = outcome.response.cost_estimate;
                    task.completed_at = Some(Utc::now());
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %entry.id, provider = %outcome.provider, "Task completed");
            }
            Err(error) => {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&entry.id) {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.to_string());
                    task.completed_at = Some(Utc::now());
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %entry.id, error = %error, "Task failed");
            }
        }
    }

    async fn set_status(&self, id: TaskId, to: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(&id) {
            if task.status.can_transition_to(to) {
                task.status = to;
            } else {
                warn!(task_id = %id, from = ?task.status, to = ?to, "Rejected status transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use switchboard_abstraction::MockInvoker;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new(vec![
            ProviderConfig::new("anthropic"),
            ProviderConfig::new("gemini").with_weight(0.5),
        ])
    }

    fn orchestrator(invoker: MockInvoker) -> Orchestrator {
        Orchestrator::new(config(), Arc::new(invoker)).expect("valid config")
    }

    #[tokio::test]
    async fn test_submit_unknown_role_rejected() {
        let orch = orchestrator(MockInvoker::new());
        let err = orch
            .submit("t", "d", "Wizard", Priority::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownRole(role) if role == "Wizard"));

        // Nothing was enqueued.
        assert_eq!(orch.system_status().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_submit_records_pending() {
        let orch = orchestrator(MockInvoker::new());
        let id = orch
            .submit("t", "d", "CodeDeveloper", Priority::High)
            .await
            .unwrap();

        let snapshot = orch.status(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Pending);
        assert_eq!(orch.system_status().await.queue_depth, 1);
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let orch = orchestrator(MockInvoker::new());
        let err = orch.status(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_drain_completes_task() {
        let invoker = MockInvoker::new().with_success("anthropic", "answer", 42, 0.003);
        let orch = orchestrator(invoker);
        let id = orch
            .submit("title", "body", "CodeDeveloper", Priority::High)
            .await
            .unwrap();

        orch.drain().await;

        let snapshot = orch.status(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.assigned_provider.is_some());
        assert!(snapshot.completed_at.is_some());
        assert_eq!(snapshot.result.as_deref(), Some("answer"));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let orch = orchestrator(MockInvoker::new());
        let id = orch
            .submit("t", "d", "DataAnalyst", Priority::Low)
            .await
            .unwrap();

        assert!(orch.cancel(id).await);
        let snapshot = orch.status(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("Cancelled before dispatch"));

        // Second cancel and cancel of unknown ids are no-ops.
        assert!(!orch.cancel(id).await);
        assert!(!orch.cancel(TaskId::new()).await);
    }

    #[tokio::test]
    async fn test_cancelled_task_never_executes() {
        let invoker = MockInvoker::new();
        let orch = Orchestrator::new(config(), Arc::new(invoker)).unwrap();
        let id = orch
            .submit("t", "d", "ContentWriter", Priority::Medium)
            .await
            .unwrap();
        orch.cancel(id).await;

        orch.drain().await;
        let status = orch.system_status().await;
        assert_eq!(status.completed_tasks, 0);
        assert_eq!(status.costs.total_requests, 0);
    }

    #[tokio::test]
    async fn test_system_status_idempotent() {
        let orch = orchestrator(MockInvoker::new());
        orch.submit("t", "d", "GeneralAssistant", Priority::Medium)
            .await
            .unwrap();
        orch.drain().await;

        assert_eq!(orch.system_status().await, orch.system_status().await);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let orch = orchestrator(MockInvoker::new());
        orch.start().await;
        // Second start is a no-op.
        orch.start().await;

        let id = orch
            .submit("t", "d", "CodeDeveloper", Priority::Medium)
            .await
            .unwrap();

        // Wait for the background loop to pick it up.
        for _ in 0..100 {
            if orch.status(id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.stop().await;

        assert_eq!(orch.status(id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let invoker = MockInvoker::new().with_success("anthropic", "done", 10, 0.001);
        let orch = orchestrator(invoker);
        orch.submit("t", "d", "GeneralAssistant", Priority::Medium)
            .await
            .unwrap();
        orch.drain().await;

        let json = serde_json::to_value(orch.system_status().await).unwrap();
        assert_eq!(json["completed_tasks"], 1);
        assert_eq!(json["providers"][0]["circuit_state"], "closed");
    }

    #[tokio::test]
    async fn test_operational_knobs() {
        let orch = orchestrator(MockInvoker::new());
        assert!(orch.set_provider_weight("gemini", 2.0));
        assert!(!orch.set_provider_weight("unknown", 1.0));
        assert!(orch.trip_provider("anthropic"));
        assert!(!orch.trip_provider("unknown"));

        let status = orch.system_status().await;
        let anthropic = status.providers.iter().find(|p| p.name == "anthropic").unwrap();
        assert_eq!(
            anthropic.circuit_state,
            crate::health::CircuitStateKind::Open
        );
    }
}
