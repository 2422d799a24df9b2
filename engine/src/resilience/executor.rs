//! Retry policy behind a circuit breaker.
//!
//! ```text
//! call ── breaker.can_execute()? ── no ──▶ Err(CircuitOpen)   (retry budget untouched)
//!                 │ yes
//!                 ▼
//!         RetryPolicy::execute ── Ok ──▶ record_success
//!                              └─ Err ─▶ record_failure
//! ```
//!
//! A call dropped before it finishes records no outcome; it releases any
//! half-open probe slot it held.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::circuit_breaker::{BreakerRegistry, CircuitBreaker};
use super::retry::RetryPolicy;
use crate::error::EngineError;

/// Releases the breaker's probe slot if the call is dropped unfinished.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl OutcomeGuard<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe();
        }
    }
}

/// Retry policy plus per-resource breakers.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ResilientExecutor {
    pub fn new(retry: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { retry, breakers }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `op` against `resource` with breaker gating and retries. The whole
    /// retried call counts as one breaker outcome.
    pub async fn execute<T, F, Fut>(&self, resource: &str, label: &str, op: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let breaker = self.breakers.get(resource);
        if !breaker.can_execute() {
            debug!(resource, label, "short-circuited by open breaker");
            return Err(EngineError::CircuitOpen {
                resource: resource.to_string(),
            });
        }
        let guard = OutcomeGuard {
            breaker: &breaker,
            settled: false,
        };
        match self.retry.execute(label, op).await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(err) => {
                guard.failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn executor(threshold: u32) -> ResilientExecutor {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            ..BreakerConfig::default()
        }));
        ResilientExecutor::new(
            RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10)),
            breakers,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let exec = executor(1);
        let calls = AtomicU32::new(0);

        let first: Result<(), _> = exec
            .execute("judge", "review", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Transient("503".into())) }
            })
            .await;
        assert!(first.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one retry consumed");

        let second: Result<(), _> = exec
            .execute("judge", "review", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(second.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open circuit skipped the call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_through() {
        let exec = executor(3);
        let value = exec
            .execute("judge", "review", |_| async { Ok::<_, EngineError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(exec.breakers().get("judge").failure_count(), 0);
    }
}
