// Error types for orchestration

use crate::task::TaskId;
use switchboard_abstraction::ProviderCallError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// One failed attempt within an agent's failover sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// The provider that was attempted.
    pub provider: String,
    /// The normalized failure for that attempt.
    pub error: ProviderCallError,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.error.reason)
    }
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Submitted role does not map to any configured agent profile.
    /// The only error that rejects `submit` synchronously.
    #[error("Unknown role: '{0}'")]
    UnknownRole(String),

    /// Status lookup on an id the orchestrator has never seen.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// All providers have open circuits (or none are configured); no call
    /// was attempted.
    #[error("All providers unavailable")]
    AllProvidersUnavailable,

    /// Every candidate provider was attempted and failed.
    #[error("All candidate providers failed: [{}]", attempts.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ProvidersExhausted {
        /// The per-provider failures, in attempt order.
        attempts: Vec<AttemptFailure>,
    },
}
