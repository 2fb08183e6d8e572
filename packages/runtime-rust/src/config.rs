//! Instance configuration.
//!
//! One immutable [`HemeraConfig`] is produced at startup and shared by `Arc`
//! with every component. Field names deserialize from `camelCase` so a
//! configuration file reads like `{ "timeout": 2000, "bloomrun": { "indexing": "depth" } }`.
//! All durations are milliseconds.

use std::time::Duration;

use hemera_core::ErrioConfig;
use serde::{Deserialize, Serialize};

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("`{field}` {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

/// Top-level configuration of a Hemera instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HemeraConfig {
    /// Instance name, reported in logs and in error hops.
    pub name: String,
    /// Free-form tag attached to log records.
    pub tag: String,
    /// Default time an act waits for its reply.
    pub timeout: u64,
    /// Maximum time a plugin may take to register.
    pub plugin_timeout: u64,
    /// Terminate the process on fatal errors.
    pub crash_on_fatal: bool,
    /// Maximum consecutive nested calls of one pattern; 0 disables the guard.
    pub max_recursion: u32,
    pub bloomrun: BloomrunConfig,
    pub load: LoadConfig,
    pub errio: ErrioConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default filter directive for [`crate::logging::init`].
    pub log_level: String,
}

impl Default for HemeraConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("hemera-{}", &id[..8]),
            tag: String::new(),
            timeout: 2000,
            plugin_timeout: 10_000,
            crash_on_fatal: true,
            max_recursion: 0,
            bloomrun: BloomrunConfig::default(),
            load: LoadConfig::default(),
            errio: ErrioConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl HemeraConfig {
    /// Parses and validates a JSON configuration document. Missing keys take
    /// their default value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed documents or invalid values.
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty",
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "must be greater than zero",
            });
        }
        if self.plugin_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "pluginTimeout",
                reason: "must be greater than zero",
            });
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.max_failures == 0 {
                return Err(ConfigError::Invalid {
                    field: "circuitBreaker.maxFailures",
                    reason: "must be greater than zero",
                });
            }
            if self.circuit_breaker.min_successes == 0 {
                return Err(ConfigError::Invalid {
                    field: "circuitBreaker.minSuccesses",
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    #[must_use]
    pub fn plugin_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout)
    }
}

/// Router indexing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indexing {
    /// Candidates are tried in registration order.
    #[default]
    Insertion,
    /// Candidates with more concrete keys are tried first; ties keep
    /// registration order.
    Depth,
}

/// Router options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BloomrunConfig {
    pub indexing: Indexing,
    /// Reject a registration whose pattern is already registered.
    pub lookup_before_add: bool,
}

impl Default for BloomrunConfig {
    fn default() -> Self {
        Self {
            indexing: Indexing::Insertion,
            lookup_before_add: true,
        }
    }
}

/// Process-load sampling and admission policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadConfig {
    pub process: ProcessSamplingConfig,
    pub policy: LoadPolicy,
    /// Reject inbound requests while the policy is exceeded.
    pub check_policy: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            process: ProcessSamplingConfig::default(),
            policy: LoadPolicy::default(),
            check_policy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessSamplingConfig {
    /// Interval between samples; 0 disables sampling.
    pub sample_interval: u64,
}

/// Admission thresholds; 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadPolicy {
    pub max_heap_used_bytes: u64,
    pub max_rss_bytes: u64,
    /// Maximum scheduler delay in milliseconds.
    pub max_event_loop_delay: u64,
}

/// Per-registration circuit breaker options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failures in CLOSED that open the circuit.
    pub max_failures: u32,
    /// Successes in HALF_OPEN that close the circuit.
    pub min_successes: u32,
    /// Time spent OPEN before probing in HALF_OPEN.
    pub half_open_time: u64,
    /// Interval at which the CLOSED/OPEN failure counter is zeroed.
    pub reset_interval_time: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: 3,
            min_successes: 1,
            half_open_time: 5_000,
            reset_interval_time: 15_000,
        }
    }
}
