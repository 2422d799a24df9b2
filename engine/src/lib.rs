//! Task Engine Library
//!
//! Resilient execution of browser automation tasks:
//! - Fallback method chains per action type, steered by learned fixes
//! - Step orchestration with session recovery, per-step retry, and timeouts
//! - Retry with jittered backoff behind per-resource circuit breakers
//! - Parallel strategy races with cooperative cancellation
//! - Three-stage verification with quality tiers and correction hints
//! - Failure diagnosis with automatic fix application
//!
//! # Usage
//!
//! ```rust,ignore
//! use task_engine::{EngineConfig, InMemoryLearningStore, TaskContext, TaskEngine};
//!
//! let engine = TaskEngine::builder(EngineConfig::from_env()?, driver, Arc::new(InMemoryLearningStore::new()))
//!     .vault(vault)
//!     .judge(judge)
//!     .build()?;
//! let report = engine
//!     .run_task(TaskContext::new("user-1", "example.com", "booking"), &actions, &cancel)
//!     .await;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod diagnoser;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod orchestrator;
pub mod racer;
pub mod resilience;
pub mod services;
pub mod test_support;
pub mod types;
pub mod verifier;

pub use config::{
    BreakerConfig, ConfigError, EngineConfig, MemoryConfig, OrchestratorConfig, RaceConfig, RetryConfig,
    VerificationConfig,
};
pub use engine::{TaskEngine, TaskEngineBuilder, TaskReport};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use types::{Action, ActionParams, ActionType, StepResult, TaskContext, TaskOutcome};

// Re-export external interface types
pub use driver::{AutomationDriver, DriverError, DriverResult, Locator, WaitCondition};
pub use services::{
    AiJudge, AllowAll, AuditEntry, AuditLogger, CapabilityValidator, Credential, CredentialVault, EmptyVault,
    JudgeContext, NoopAuditLogger, TracingAuditLogger, Validation,
};

// Re-export key component types
pub use diagnoser::{
    hypothesize, DebugHypothesis, DiagnosisInput, FailureContext, FailureDiagnoser, FixApplier, FixAttempt,
    FixKind, FixReport, StepFixApplier,
};
pub use executor::{ActionExecutor, Method, StepFailure, StepOutcome};
pub use memory::{
    FailureMemory, FailureRecord, InMemoryLearningStore, JsonFileLearningStore, LearningStore,
    VerificationLearningStore,
};
pub use orchestrator::StepOrchestrator;
pub use racer::{ParallelStrategy, ParallelStrategyRacer, RaceOutcome, RaceScope, StrategyStatus};
pub use resilience::{BreakerRegistry, CircuitBreaker, CircuitState, ResilientExecutor, RetryPolicy};
pub use verifier::{QualityTier, VerificationInput, VerificationPipeline, VerificationResult};
