//! External collaborators: capability validation, credential vault, audit
//! logging, and the AI vision judge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, ErrorKind};
use crate::types::Action;

/// Verdict of a [`CapabilityValidator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validation {
    /// The action may run.
    pub fn approved() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    /// The action is refused for `reason`.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorization boundary checked before every action. A rejection is a
/// non-retryable `blocked` outcome.
#[async_trait]
pub trait CapabilityValidator: Send + Sync {
    /// Whether `user_id` may perform `action`.
    async fn validate(&self, user_id: &str, action: &Action) -> Validation;
}

/// Approves everything.
pub struct AllowAll;

#[async_trait]
impl CapabilityValidator for AllowAll {
    async fn validate(&self, _user_id: &str, _action: &Action) -> Validation {
        Validation::approved()
    }
}

/// Username and password for one site. `Debug` redacts the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Set by the vault when the stored secret is known to be stale.
    #[serde(default)]
    pub expired: bool,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expired", &self.expired)
            .finish()
    }
}

/// Stored site credentials, consulted only when a login action carries none.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Stored credential for `user_id` on `domain`, if any.
    async fn get(&self, user_id: &str, domain: &str) -> Result<Option<Credential>, EngineError>;

    /// Re-fetch or rotate an expired credential. `Ok(true)` if a fresh one is now stored.
    async fn refresh(&self, _user_id: &str, _domain: &str) -> Result<bool, EngineError> {
        Ok(false)
    }
}

/// Vault with no stored credentials.
pub struct EmptyVault;

#[async_trait]
impl CredentialVault for EmptyVault {
    async fn get(&self, _user_id: &str, _domain: &str) -> Result<Option<Credential>, EngineError> {
        Ok(None)
    }
}

/// One audited step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub task_id: String,
    pub user_id: String,
    pub domain: String,
    pub step_index: usize,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Best-effort audit sink. Implementations must not block; errors are
/// logged and discarded by the caller.
pub trait AuditLogger: Send + Sync {
    /// Write one entry. An `Err` carries a description of the sink failure.
    fn log_step(&self, entry: AuditEntry) -> Result<(), String>;
}

/// Log an audit entry, swallowing sink failures.
pub(crate) fn audit_best_effort(logger: &dyn AuditLogger, entry: AuditEntry) {
    let task_id = entry.task_id.clone();
    if let Err(e) = logger.log_step(entry) {
        warn!(task_id = %task_id, error = %e, "audit log write failed");
    }
}

/// Discards every entry.
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn log_step(&self, _entry: AuditEntry) -> Result<(), String> {
        Ok(())
    }
}

/// Emits audit rows as `tracing` events on the `audit` target.
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_step(&self, entry: AuditEntry) -> Result<(), String> {
        info!(
            target: "audit",
            task_id = %entry.task_id,
            user_id = %entry.user_id,
            domain = %entry.domain,
            step = entry.step_index,
            action = %entry.action,
            success = entry.success,
            method = entry.method.as_deref().unwrap_or("-"),
            duration_ms = entry.duration_ms,
            "step"
        );
        Ok(())
    }
}

/// Context sent to the vision judge alongside the screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeContext {
    pub task_type: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    /// Truncated page text.
    pub page_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_issues: Vec<String>,
}

/// AI vision reviewer. Returns the model's raw reply; the pipeline parses
/// `{success, confidence, reason}` JSON out of it and sniffs keywords when
/// the reply is not parseable.
#[async_trait]
pub trait AiJudge: Send + Sync {
    /// Review the screenshot at `screenshot_ref` and reply in free text.
    async fn judge(&self, screenshot_ref: &str, context: &JudgeContext) -> Result<String, EngineError>;
}
