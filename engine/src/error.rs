//! Engine error taxonomy with retry classification.
//!
//! Every failure that crosses a component boundary is an [`EngineError`].
//! Callers branch on [`EngineError::kind`] instead of matching strings.
//!
//! | Kind          | Retriable | Surfaced as                                  |
//! |---------------|-----------|----------------------------------------------|
//! | Blocked       | no        | immediate step failure                        |
//! | Transient     | yes       | retried, then escalated                       |
//! | Structural    | yes       | all fallback methods exhausted                |
//! | Session       | yes       | driver session reinitialized or auth fix      |
//! | CircuitOpen   | no        | "try later", distinct from "broken now"       |
//! | Timeout       | yes       | step timeout; task timeout aborts the task    |
//! | Cancelled     | no        | cooperative cancellation                      |
//! | Store         | yes       | learning datastore unavailable                |
//! | Configuration | no        | invalid engine configuration                  |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::DriverError;
use crate::memory::store::StoreError;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capability scope rejected the action.
    Blocked,
    /// Network or timing hiccup.
    Transient,
    /// Every method in the fallback chain failed.
    Structural,
    /// Driver session or authentication lost.
    Session,
    /// Circuit breaker refused the call.
    CircuitOpen,
    /// A step or task exceeded its time budget.
    Timeout,
    /// Explicitly cancelled by the caller or a race.
    Cancelled,
    /// Learning datastore failure.
    Store,
    /// Invalid configuration.
    Configuration,
}

impl ErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Structural | Self::Session | Self::Timeout | Self::Store
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked"),
            Self::Transient => write!(f, "transient"),
            Self::Structural => write!(f, "structural"),
            Self::Session => write!(f, "session"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Unified error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("all {attempted} methods failed for {action}: {last_error}")]
    MethodsExhausted {
        action: String,
        attempted: usize,
        last_error: String,
    },

    #[error("session lost: {0}")]
    Session(String),

    /// The guarded resource is degraded; the call was not attempted.
    #[error("circuit open for {resource}")]
    CircuitOpen { resource: String },

    #[error("{label} timed out after {elapsed_ms}ms")]
    Timeout { label: String, elapsed_ms: u64 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Final error of a retried operation, tagged with its label and attempt count.
    #[error("{label} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Blocked(_) => ErrorKind::Blocked,
            Self::Transient(_) => ErrorKind::Transient,
            Self::MethodsExhausted { .. } => ErrorKind::Structural,
            Self::Session(_) => ErrorKind::Session,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Store(_) => ErrorKind::Store,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// The innermost error, unwrapping retry tagging.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<DriverError> for EngineError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::SessionClosed(msg) => Self::Session(msg),
            DriverError::Unauthorized(msg) => Self::Session(format!("unauthorized: {msg}")),
            other => Self::Transient(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
