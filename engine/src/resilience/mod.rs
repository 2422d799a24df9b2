//! Resilience primitives: retry with backoff, circuit breaking, and their
//! composition for a single guarded call.

pub mod circuit_breaker;
pub mod executor;
pub mod retry;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use executor::ResilientExecutor;
pub use retry::{Exhausted, RetryPolicy, Retryable};
