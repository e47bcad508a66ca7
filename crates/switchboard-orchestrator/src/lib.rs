//! Multi-provider task orchestrator for Switchboard.
//!
//! Distributes units of work across interchangeable LLM backends: a
//! priority queue feeds a bounded dispatch loop, role-scoped agents fail
//! over between providers, and per-provider circuit breakers isolate
//! backends that keep failing. Backend call mechanics live behind the
//! `BackendInvoker` trait in `switchboard-abstraction`.

pub mod agent;
pub mod balancer;
pub mod config;
pub mod cost;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod queue;
pub mod task;

pub use agent::{Agent, AgentPool, ExecutionOutcome};
pub use balancer::{LoadBalancer, ProviderProfile};
pub use config::{BreakerConfig, ConfigError, OrchestratorConfig, ProviderConfig};
pub use cost::{CostSummary, CostTracker, ProviderCost};
pub use error::{AttemptFailure, OrchestratorError, Result};
pub use health::{BreakerSettings, CircuitStateKind, ProviderHealth, ProviderId, ProviderStats};
pub use orchestrator::{Orchestrator, SystemSnapshot};
pub use queue::{QueueEntry, TaskQueue};
pub use task::{Priority, Role, Task, TaskId, TaskSnapshot, TaskStatus};
