//! Backend abstraction layer for Switchboard.
//!
//! This crate defines the boundary between the task orchestrator and the
//! concrete LLM backend integrations: the [`BackendInvoker`] trait, the
//! payload/response types that cross it, and the normalized
//! [`ProviderCallError`] every backend failure is mapped to.
//!
//! The mechanics of talking to a real backend (HTTP, auth, SDKs, retries
//! with backoff) live entirely on the collaborator side of this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// The reason a single backend call failed.
///
/// Timeouts, rate limits, auth failures, and garbled responses are all
/// transient from the orchestrator's point of view: each one drives a
/// health update and a failover to the next candidate provider.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallFailure {
    /// The call did not complete within the configured deadline.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// The provider rejected the call due to rate limiting or quota.
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited {
        /// Optional retry-after hint from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// Credentials were rejected by the provider.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The provider answered, but the response could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Any other request-level error (network, 5xx, connection reset).
    #[error("request error: {0}")]
    Request(String),
}

/// A failed call against one provider, normalized for the orchestrator.
///
/// Every invoker implementation maps its native errors into this single
/// shape so the agent failover loop never has to know which backend it is
/// talking to.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("provider '{provider}' call failed: {reason}")]
pub struct ProviderCallError {
    /// The provider that was called (e.g., "anthropic", "gemini").
    pub provider: String,
    /// Why the call failed.
    pub reason: CallFailure,
}

impl ProviderCallError {
    /// Creates a new call error for the given provider.
    #[must_use]
    pub fn new(provider: impl Into<String>, reason: CallFailure) -> Self {
        Self { provider: provider.into(), reason }
    }
}

/// The prompt payload handed to a backend.
///
/// Opaque to the orchestrator: it is assembled by the caller from the task's
/// title/description and passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    /// Optional system/instruction preamble.
    pub system: Option<String>,
    /// The prompt body.
    pub prompt: String,
}

impl PromptPayload {
    /// Creates a payload from a bare prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { system: None, prompt: prompt.into() }
    }

    /// Sets the system preamble.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// The normalized result of one successful backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The response payload (opaque to the orchestrator).
    pub content: String,
    /// Tokens consumed by the call (prompt + completion).
    pub tokens_used: u32,
    /// Estimated cost of the call in USD.
    pub cost_estimate: f64,
}

/// A capability that executes one call against one named backend.
///
/// Implementations must be `Send + Sync`: the orchestrator invokes them from
/// many concurrent task executions. The orchestrator bounds each call with
/// its own per-provider timeout; implementations should not retry
/// internally, since failover across providers is the orchestrator's job.
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    /// Executes one call against `provider`.
    ///
    /// # Arguments
    /// * `provider` - The provider name to call
    /// * `payload` - The prompt payload to send
    ///
    /// # Errors
    /// Returns a [`ProviderCallError`] if the call fails for any reason.
    async fn invoke(
        &self,
        provider: &str,
        payload: &PromptPayload,
    ) -> Result<ProviderResponse, ProviderCallError>;
}

/// Per-provider behavior for the [`MockInvoker`].
#[derive(Debug, Clone)]
enum MockBehavior {
    /// Succeed with the given response content and usage.
    Succeed { content: String, tokens_used: u32, cost_estimate: f64 },
    /// Fail with the given reason.
    Fail(CallFailure),
}

/// A scriptable [`BackendInvoker`] for tests and demonstrations.
///
/// Each provider can be scripted to succeed or fail; unscripted providers
/// succeed with a canned response. Calls are counted per provider so tests
/// can assert exactly how many attempts reached each backend.
#[derive(Debug, Default)]
pub struct MockInvoker {
    behaviors: RwLock<HashMap<String, MockBehavior>>,
    latencies: RwLock<HashMap<String, Duration>>,
    call_count: AtomicUsize,
    per_provider_calls: RwLock<HashMap<String, usize>>,
}

impl MockInvoker {
    /// Creates a mock invoker where every provider succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `provider` to succeed with the given content and usage.
    #[must_use]
    pub fn with_success(
        self,
        provider: impl Into<String>,
        content: impl Into<String>,
        tokens_used: u32,
        cost_estimate: f64,
    ) -> Self {
        self.behaviors.write().expect("behaviors lock").insert(
            provider.into(),
            MockBehavior::Succeed { content: content.into(), tokens_used, cost_estimate },
        );
        self
    }

    /// Scripts `provider` to fail with the given reason.
    #[must_use]
    pub fn with_failure(self, provider: impl Into<String>, reason: CallFailure) -> Self {
        self.behaviors
            .write()
            .expect("behaviors lock")
            .insert(provider.into(), MockBehavior::Fail(reason));
        self
    }

    /// Scripts `provider` to sleep for `latency` before answering, so tests
    /// can hold a concurrency slot open for a controlled window.
    #[must_use]
    pub fn with_latency(self, provider: impl Into<String>, latency: Duration) -> Self {
        self.latencies.write().expect("latencies lock").insert(provider.into(), latency);
        self
    }

    /// Re-scripts a provider after construction (e.g., to simulate recovery).
    pub fn set_failure(&self, provider: impl Into<String>, reason: CallFailure) {
        self.behaviors
            .write()
            .expect("behaviors lock")
            .insert(provider.into(), MockBehavior::Fail(reason));
    }

    /// Re-scripts a provider to succeed.
    pub fn set_success(
        &self,
        provider: impl Into<String>,
        content: impl Into<String>,
        tokens_used: u32,
        cost_estimate: f64,
    ) {
        self.behaviors.write().expect("behaviors lock").insert(
            provider.into(),
            MockBehavior::Succeed { content: content.into(), tokens_used, cost_estimate },
        );
    }

    /// Total number of `invoke` calls across all providers.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of `invoke` calls that reached a specific provider.
    pub fn calls_for(&self, provider: &str) -> usize {
        self.per_provider_calls
            .read()
            .expect("call counts lock")
            .get(provider)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BackendInvoker for MockInvoker {
    async fn invoke(
        &self,
        provider: &str,
        payload: &PromptPayload,
    ) -> Result<ProviderResponse, ProviderCallError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut calls = self.per_provider_calls.write().expect("call counts lock");
            *calls.entry(provider.to_string()).or_insert(0) += 1;
        }

        debug!(provider = %provider, prompt_len = payload.prompt.len(), "MockInvoker invoked");

        let latency = self.latencies.read().expect("latencies lock").get(provider).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let behavior = self.behaviors.read().expect("behaviors lock").get(provider).cloned();
        match behavior {
            Some(MockBehavior::Fail(reason)) => Err(ProviderCallError::new(provider, reason)),
            Some(MockBehavior::Succeed { content, tokens_used, cost_estimate }) => {
                Ok(ProviderResponse { content, tokens_used, cost_estimate })
            }
            None => Ok(ProviderResponse {
                content: format!("Mock response from {provider}: {}", payload.prompt),
                tokens_used: 100,
                cost_estimate: 0.001,
            }),
        }
    }
}
