//! Engine configuration.
//!
//! Loaded from TOML, then overlaid with `TASK_ENGINE_*` environment
//! variables. Every section has production defaults, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [orchestrator]
//! task_timeout_secs = 180
//! step_timeout_secs = 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay, in [0, 1].
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Failures older than this are forgotten while closed.
    pub window_secs: u64,
    pub cooldown_secs: u64,
    /// Consecutive half-open successes needed to close.
    pub required_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 600,
            cooldown_secs: 60,
            required_successes: 2,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub task_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub step_retries: u32,
    pub step_backoff_base_ms: u64,
    pub step_backoff_max_ms: u64,
    /// Fixed delay after network quiescence following a mutating action.
    pub settle_delay_ms: u64,
    /// Budget for the network-idle wait.
    pub network_idle_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 180,
            step_timeout_secs: 30,
            step_retries: 2,
            step_backoff_base_ms: 1_000,
            step_backoff_max_ms: 4_000,
            settle_delay_ms: 800,
            network_idle_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    pub max_concurrent: usize,
    /// Soft deadline for a winner to emerge.
    pub grace_window_ms: u64,
    /// How long losers get to acknowledge cancellation before being abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            grace_window_ms: 60_000,
            cancel_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub pass_threshold: f64,
    /// Composite at or above this skips the vision review.
    pub short_circuit_threshold: f64,
    /// Composite below this (with a screenshot-requiring task) invokes the vision review.
    pub vision_threshold: f64,
    /// Composite below this triggers one delayed re-check.
    pub recheck_threshold: f64,
    pub recheck_delay_ms: u64,
    /// Action success rate below this adds a correction hint.
    pub low_action_rate: f64,
    pub judge_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 70.0,
            short_circuit_threshold: 95.0,
            vision_threshold: 90.0,
            recheck_threshold: 50.0,
            recheck_delay_ms: 2_000,
            low_action_rate: 80.0,
            judge_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub stale_after_days: i64,
    /// Exact-selector fixes need a success rate above this.
    pub exact_min_rate: f64,
    /// Domain-wide fallback fixes need a success rate above this.
    pub domain_min_rate: f64,
    pub learning_domain_min_rate: f64,
    pub learning_domain_min_observations: u32,
    pub learning_global_min_rate: f64,
    pub learning_global_min_observations: u32,
    pub max_known_issues: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            exact_min_rate: 50.0,
            domain_min_rate: 70.0,
            learning_domain_min_rate: 60.0,
            learning_domain_min_observations: 2,
            learning_global_min_rate: 75.0,
            learning_global_min_observations: 5,
            max_known_issues: 5,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub orchestrator: OrchestratorConfig,
    pub race: RaceConfig,
    pub verification: VerificationConfig,
    pub memory: MemoryConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TASK_ENGINE_*` variables onto this config.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("TASK_ENGINE_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_RETRY_BASE_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_RETRY_JITTER") {
            self.retry.jitter_factor = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_TASK_TIMEOUT_SECS") {
            self.orchestrator.task_timeout_secs = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_STEP_TIMEOUT_SECS") {
            self.orchestrator.step_timeout_secs = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_RACE_MAX_CONCURRENT") {
            self.race.max_concurrent = v;
        }
        if let Some(v) = env_parse("TASK_ENGINE_STALE_AFTER_DAYS") {
            self.memory.stale_after_days = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid {
                field: "retry.jitter_factor",
                message: format!("{} is outside [0, 1]", self.retry.jitter_factor),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.max_delay_ms",
                message: "must be >= base_delay_ms".to_string(),
            });
        }
        if self.breaker.failure_threshold == 0 || self.breaker.required_successes == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker",
                message: "failure_threshold and required_successes must be positive".to_string(),
            });
        }
        if self.orchestrator.task_timeout_secs == 0 || self.orchestrator.step_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "orchestrator",
                message: "timeouts must be positive".to_string(),
            });
        }
        if self.race.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "race.max_concurrent",
                message: "must be positive".to_string(),
            });
        }
        let v = &self.verification;
        for (field, value) in [
            ("verification.pass_threshold", v.pass_threshold),
            ("verification.short_circuit_threshold", v.short_circuit_threshold),
            ("verification.vision_threshold", v.vision_threshold),
            ("verification.recheck_threshold", v.recheck_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("{value} is outside [0, 100]"),
                });
            }
        }
        Ok(())
    }
}
