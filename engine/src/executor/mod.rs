//! Action execution through ordered fallback methods.

pub mod action;
pub mod methods;

pub use action::{ActionExecutor, StepFailure, StepOutcome};
pub use methods::{chain_for, Method, MethodContext, MethodError};
