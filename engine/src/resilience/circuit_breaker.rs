//! Per-resource circuit breaker.
//!
//! ```text
//!            failures ≥ threshold
//!   Closed ───────────────────────▶ Open
//!     ▲                              │ cooldown elapsed (next can_execute)
//!     │ required successes           ▼
//!     └──────────────────────── HalfOpen ──── any failure ──▶ Open
//! ```
//!
//! While closed, each success decays the failure count by one, and a count
//! whose last failure is older than the window resets to zero. Half-open
//! admits one probe at a time. A probe holds its slot until its outcome is
//! recorded, it is released with [`CircuitBreaker::release_probe`], or one
//! cooldown passes, after which the lease lapses and a new probe is granted.
//!
//! One breaker instance is shared per resource (see [`BreakerRegistry`]); all
//! transitions are serialized behind a mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests refused until cooldown expires.
    Open,
    /// Cooldown expired, probing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds since the last recorded failure.
    pub since_last_failure_ms: Option<u64>,
    pub successes_in_half_open: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    successes_in_half_open: u32,
    /// When the outstanding half-open probe was granted.
    probe_started: Option<Instant>,
}

/// Breaker guarding one resource key. Share it through [`BreakerRegistry`].
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A closed breaker for `resource`.
    pub fn new(resource: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                successes_in_half_open: 0,
                probe_started: None,
            }),
        }
    }

    /// Resource key this breaker guards.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_if_stale(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Closed || inner.failure_count == 0 {
            return;
        }
        if let Some(last) = inner.last_failure {
            if now.duration_since(last) >= self.config.window() {
                inner.failure_count = 0;
            }
        }
    }

    /// Whether a call may proceed. May move Open → HalfOpen.
    pub fn can_execute(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                self.reset_if_stale(&mut inner, now);
                true
            }
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.config.cooldown())
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes_in_half_open = 0;
                    inner.probe_started = Some(now);
                    info!(resource = %self.resource, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                Some(at) if now.duration_since(at) < self.config.cooldown() => false,
                Some(_) => {
                    warn!(resource = %self.resource, "half-open probe lease lapsed, granting another");
                    inner.probe_started = Some(now);
                    true
                }
                None => {
                    inner.probe_started = Some(now);
                    true
                }
            },
        }
    }

    /// Give back a half-open probe slot without recording an outcome. Used
    /// when a granted call is cancelled before it finishes.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_started.take().is_some() {
            debug!(resource = %self.resource, "half-open probe released unfinished");
        }
    }

    /// Record a successful call. Closes a half-open breaker once enough
    /// probes succeed; decays the failure count while closed.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                inner.successes_in_half_open += 1;
                if inner.successes_in_half_open >= self.config.required_successes {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.successes_in_half_open = 0;
                    inner.opened_at = None;
                    info!(resource = %self.resource, "circuit closed");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Opens the breaker at the threshold, and reopens
    /// it on any half-open failure.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.reset_if_stale(&mut inner, now);
        inner.failure_count += 1;
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_started = None;
                inner.successes_in_half_open = 0;
                warn!(resource = %self.resource, "half-open probe failed, circuit reopened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    resource = %self.resource,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Current state without triggering the Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures counted in the current window.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Copy of the breaker's state for reporting.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            resource: self.resource.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            since_last_failure_ms: inner
                .last_failure
                .map(|at| Instant::now().duration_since(at).as_millis() as u64),
            successes_in_half_open: inner.successes_in_half_open,
        }
    }
}

/// Hands out one shared breaker per resource key.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Registry whose breakers all share `config`.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `resource`, created on first use.
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut map = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(resource.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(resource, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker, sorted by resource.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let map = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snaps: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.resource.cmp(&b.resource));
        snaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            window_secs: 600,
            cooldown_secs: 60,
            required_successes: 2,
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("example.com", config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_probes_after_cooldown() {
        let cb = CircuitBreaker::new("example.com", config());
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute(), "cooldown elapsed, probe granted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_execute(), "only one probe in flight");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("r", config());
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreported_probe_lease_lapses() {
        let cb = CircuitBreaker::new("r", config());
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_execute());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.can_execute(), "lease still held");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.can_execute(), "lease lapsed after one cooldown");
        cb.record_success();
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_frees_slot() {
        let cb = CircuitBreaker::new("r", config());
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.can_execute());
        cb.release_probe();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_success_decays_failures_while_closed() {
        let cb = CircuitBreaker::new("r", config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 1);
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_reset() {
        let cb = CircuitBreaker::new("r", config());
        for _ in 0..4 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(cb.can_execute());
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_instances() {
        let registry = BreakerRegistry::new(config());
        let a = registry.get("ai_judge");
        let b = registry.get("ai_judge");
        assert!(Arc::ptr_eq(&a, &b));
        a.record_failure();
        assert_eq!(b.failure_count(), 1);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
