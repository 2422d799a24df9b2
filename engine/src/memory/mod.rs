//! Persistent learning: failure fixes and verification corrections.

pub mod failure_memory;
pub mod store;
pub mod verification_learning;

pub use failure_memory::{
    FailureKey, FailureMemory, FailureRecord, FailureReport, LearnedFix, Solution,
};
pub use store::{InMemoryLearningStore, JsonFileLearningStore, LearningStore, StoreError, StoreResult};
pub use verification_learning::{
    hint_class, known_issues_preamble, HintScope, KnownCorrection, LearningKey, VerificationLearning,
    VerificationLearningStore,
};
