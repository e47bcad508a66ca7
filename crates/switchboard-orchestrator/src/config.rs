//! Orchestrator configuration.
//!
//! Configuration is deserialized from TOML (or built programmatically) and
//! validated before the orchestrator starts: provider names must be unique,
//! weights positive, breaker thresholds sane, and every role profile must
//! reference known roles and configured providers.

use crate::balancer::ProviderProfile;
use crate::health::BreakerSettings;
use crate::task::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the TOML contents.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// No providers configured.
    #[error("At least one provider must be configured")]
    NoProviders,

    /// Two providers share a name.
    #[error("Duplicate provider name: '{0}'")]
    DuplicateProvider(String),

    /// A provider weight is not a positive finite number.
    #[error("Invalid weight {weight} for provider '{provider}' (must be positive)")]
    InvalidWeight {
        /// The offending provider.
        provider: String,
        /// The rejected weight.
        weight: f64,
    },

    /// A provider call timeout of zero.
    #[error("Provider '{0}' has a zero call timeout")]
    ZeroTimeout(String),

    /// A breaker threshold or budget of zero.
    #[error("Invalid breaker setting: {0}")]
    InvalidBreaker(String),

    /// `max_attempts` of zero; no task could ever be executed.
    #[error("max_attempts must be > 0")]
    ZeroAttempts,

    /// A profile is keyed by a role name that does not exist.
    #[error("Profile references unknown role: '{0}'")]
    UnknownProfileRole(String),

    /// A profile references a provider that is not configured.
    #[error("Profile for role '{role}' references unknown provider: '{provider}'")]
    UnknownProfileProvider {
        /// The profile's role.
        role: String,
        /// The unconfigured provider.
        provider: String,
    },

    /// A profile multiplier is negative or non-finite.
    #[error("Invalid multiplier {multiplier} for provider '{provider}' in role '{role}'")]
    InvalidMultiplier {
        /// The profile's role.
        role: String,
        /// The provider the multiplier applies to.
        provider: String,
        /// The rejected multiplier.
        multiplier: f64,
    },
}

/// One configured backend provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (e.g., "anthropic").
    pub name: String,
    /// Operator-set base weight.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProviderConfig {
    /// Creates a provider entry with default weight and timeout.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), weight: default_weight(), timeout_ms: default_timeout_ms() }
    }

    /// Sets the base weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Windowed failures that open a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Milliseconds an open circuit waits before trial calls.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Trial calls permitted while half-open.
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
    /// Outcomes kept in the per-provider tracking window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_trials: default_half_open_trials(),
            window_size: default_window_size(),
        }
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            half_open_trials: config.half_open_trials,
            window_size: config.window_size,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_trials() -> u32 {
    2
}

fn default_window_size() -> usize {
    50
}

fn default_fan_out() -> usize {
    4
}

fn default_max_attempts() -> usize {
    3
}

fn default_max_agents_per_role() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// The backend provider pool.
    pub providers: Vec<ProviderConfig>,

    /// Circuit breaker tuning.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Per-role provider preference multipliers, keyed by role name.
    /// Roles without a profile use neutral multipliers.
    #[serde(default)]
    pub profiles: HashMap<String, HashMap<String, f64>>,

    /// Per-provider fan-out factor used when `max_concurrency` is unset:
    /// the global limit defaults to `providers.len() * fan_out`.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Explicit global concurrency limit, overriding the fan-out formula.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Upper bound on providers tried per task execution.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Upper bound on agent instances per role.
    #[serde(default = "default_max_agents_per_role")]
    pub max_agents_per_role: usize,

    /// Dispatch loop poll interval in milliseconds when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl OrchestratorConfig {
    /// Creates a configuration with the given providers and defaults for
    /// everything else.
    #[must_use]
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            breaker: BreakerConfig::default(),
            profiles: HashMap::new(),
            fan_out: default_fan_out(),
            max_concurrency: None,
            max_attempts: default_max_attempts(),
            max_agents_per_role: default_max_agents_per_role(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        info!(
            path = %path.display(),
            providers = config.providers.len(),
            "Loaded orchestrator config"
        );
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if parsing or validation fails.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            if !(provider.weight.is_finite() && provider.weight > 0.0) {
                return Err(ConfigError::InvalidWeight {
                    provider: provider.name.clone(),
                    weight: provider.weight,
                });
            }
            if provider.timeout_ms == 0 {
                return Err(ConfigError::ZeroTimeout(provider.name.clone()));
            }
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreaker("failure_threshold must be > 0".to_string()));
        }
        if self.breaker.half_open_trials == 0 {
            return Err(ConfigError::InvalidBreaker("half_open_trials must be > 0".to_string()));
        }
        if self.breaker.window_size < self.breaker.failure_threshold {
            return Err(ConfigError::InvalidBreaker(
                "window_size must be >= failure_threshold".to_string(),
            ));
        }

        for (role_name, weights) in &self.profiles {
            if role_name.parse::<Role>().is_err() {
                return Err(ConfigError::UnknownProfileRole(role_name.clone()));
            }
            for (provider, multiplier) in weights {
                if !seen.contains(provider.as_str()) {
                    return Err(ConfigError::UnknownProfileProvider {
                        role: role_name.clone(),
                        provider: provider.clone(),
                    });
                }
                if !(multiplier.is_finite() && *multiplier >= 0.0) {
                    return Err(ConfigError::InvalidMultiplier {
                        role: role_name.clone(),
                        provider: provider.clone(),
                        multiplier: *multiplier,
                    });
                }
            }
        }

        Ok(())
    }

    /// The effective global concurrency limit.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| self.providers.len() * self.fan_out)
            .max(1)
    }

    /// Breaker settings derived from this configuration.
    #[must_use]
    pub fn breaker_settings(&self) -> BreakerSettings {
        (&self.breaker).into()
    }

    /// The preference profile for a role (neutral if none configured).
    #[must_use]
    pub fn profile_for(&self, role: Role) -> ProviderProfile {
        self.profiles
            .get(role.name())
            .map(|weights| ProviderProfile::new(weights.clone()))
            .unwrap_or_default()
    }

    /// Per-provider call timeouts.
    #[must_use]
    pub fn call_timeouts(&self) -> HashMap<String, Duration> {
        self.providers
            .iter()
            .map(|p| (p.name.clone(), Duration::from_millis(p.timeout_ms)))
            .collect()
    }

    /// Provider names with their base weights, in configured order.
    #[must_use]
    pub fn provider_weights(&self) -> Vec<(String, f64)> {
        self.providers.iter().map(|p| (p.name.clone(), p.weight)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn two_providers() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig::new("anthropic"),
            ProviderConfig::new("gemini").with_weight(0.5),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::new(two_providers());
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency_limit(), 8);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            fan_out = 2
            max_attempts = 2
            poll_interval_ms = 10

            [[providers]]
            name = "anthropic"
            weight = 0.7
            timeout_ms = 10000

            [[providers]]
            name = "gemini"
            weight = 0.3

            [breaker]
            failure_threshold = 3
            recovery_timeout_ms = 5000

            [profiles.CodeDeveloper]
            anthropic = 0.7
            gemini = 0.3
        "#;

        let config = OrchestratorConfig::from_toml(toml).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].timeout_ms, 10_000);
        assert_eq!(config.providers[1].timeout_ms, 30_000);
        assert_eq!(config.concurrency_limit(), 4);
        assert_eq!(config.breaker.failure_threshold, 3);

        let profile = config.profile_for(Role::CodeDeveloper);
        assert_eq!(profile.multiplier("anthropic"), 0.7);
        assert_eq!(profile.multiplier("gemini"), 0.3);
        // Roles without a profile get neutral multipliers.
        assert_eq!(config.profile_for(Role::DataAnalyst).multiplier("anthropic"), 1.0);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[providers]]
            name = "anthropic"
            "#
        )
        .unwrap();

        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].weight, 1.0);
    }

    #[test]
    fn test_missing_file_errors() {
        let result = OrchestratorConfig::from_file("/nonexistent/orchestrator.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_no_providers_rejected() {
        let config = OrchestratorConfig::new(Vec::new());
        assert!(matches!(config.validate(), Err(ConfigError::NoProviders)));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let config = OrchestratorConfig::new(vec![
            ProviderConfig::new("anthropic"),
            ProviderConfig::new("anthropic"),
        ]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateProvider(_))));
    }

    #[test]
    fn test_nonpositive_weight_rejected() {
        let config =
            OrchestratorConfig::new(vec![ProviderConfig::new("anthropic").with_weight(0.0)]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidWeight { .. })));
    }

    #[test]
    fn test_profile_unknown_role_rejected() {
        let mut config = OrchestratorConfig::new(two_providers());
        config
            .profiles
            .insert("Wizard".to_string(), [("anthropic".to_string(), 1.0)].into_iter().collect());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfileRole(_))));
    }

    #[test]
    fn test_profile_unknown_provider_rejected() {
        let mut config = OrchestratorConfig::new(two_providers());
        config.profiles.insert(
            "CodeDeveloper".to_string(),
            [("openai".to_string(), 1.0)].into_iter().collect(),
        );
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfileProvider { .. })));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = OrchestratorConfig::new(two_providers());
        config.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAttempts)));
    }

    #[test]
    fn test_breaker_window_smaller_than_threshold_rejected() {
        let mut config = OrchestratorConfig::new(two_providers());
        config.breaker.failure_threshold = 10;
        config.breaker.window_size = 5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBreaker(_))));
    }

    #[test]
    fn test_explicit_concurrency_overrides_fan_out() {
        let mut config = OrchestratorConfig::new(two_providers());
        config.max_concurrency = Some(3);
        assert_eq!(config.concurrency_limit(), 3);
    }
}
