//! Bounded exponential backoff with jitter.
//!
//! ```text
//! attempt 0 ── fail ── sleep min(base·2⁰, max)±jitter ── attempt 1 ── ...
//!          └─ success → return                    (max_retries + 1 attempts total)
//! ```
//!
//! Non-retriable errors end the loop immediately; the caller still gets the
//! error tagged with the label and attempt count.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::EngineError;

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retriable(&self) -> bool;
}

impl Retryable for EngineError {
    fn is_retriable(&self) -> bool {
        EngineError::is_retriable(self)
    }
}

/// Final error of a retried operation.
#[derive(Debug, Clone)]
pub struct Exhausted<E> {
    pub label: String,
    pub attempts: u32,
    pub last: E,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Unjittered delay before retry number `retry` (0-based): `min(base·2^retry, max)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = base_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(self.max_delay)
    }

    /// [`Self::backoff`] scaled by a random factor in `[1 - jitter, 1 + jitter]`, floored at zero.
    pub fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    /// Run `op` until it succeeds, fails non-retriably, or the budget is spent.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Exhausted<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(label, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let attempts = attempt + 1;
                    if !err.is_retriable() || attempt >= self.max_retries {
                        return Err(Exhausted {
                            label: label.to_string(),
                            attempts,
                            last: err,
                        });
                    }
                    let delay = self.jittered(attempt);
                    warn!(
                        label,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// [`Self::run`] for engine operations; exhaustion becomes
    /// [`EngineError::RetriesExhausted`].
    pub async fn execute<T, F, Fut>(&self, label: &str, op: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.run(label, op)
            .await
            .map_err(|ex| EngineError::RetriesExhausted {
                label: ex.label,
                attempts: ex.attempts,
                source: Box::new(ex.last),
            })
    }
}
