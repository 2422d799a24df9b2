//! Executes one action through its fallback method chain.
//!
//! ```text
//! validate ── rejected ──▶ Blocked (not retried)
//!    │
//! failure memory lookup ── learned fix? ── move its method to the front
//!    │
//! method chain ── first Ok ──▶ learn (non-default winner) / credit learned fix
//!    │ all Err
//!    ▼
//! unresolved failure row ──▶ Structural
//! ```
//!
//! Method-level errors are swallowed inside the chain. A lost session aborts
//! the chain immediately: no later method can succeed without a new session.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::methods::{chain_for, Method, MethodContext, MethodError};
use crate::driver::AutomationDriver;
use crate::error::EngineError;
use crate::memory::{FailureMemory, FailureReport, LearnedFix, Solution};
use crate::resilience::Retryable;
use crate::services::{
    audit_best_effort, AllowAll, AuditEntry, AuditLogger, CapabilityValidator, CredentialVault, EmptyVault,
    NoopAuditLogger,
};
use crate::types::{Action, StepResult, TaskContext};

/// A failed step attempt: the error plus the result row to log.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: EngineError,
    pub result: StepResult,
    /// Ends the task regardless of the error kind (e.g. the session could not be restarted).
    pub fatal: bool,
}

impl StepFailure {
    pub fn new(error: EngineError, result: StepResult) -> Self {
        Self {
            error,
            result,
            fatal: false,
        }
    }

    pub fn fatal(error: EngineError, result: StepResult) -> Self {
        Self {
            error,
            result,
            fatal: true,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl Retryable for StepFailure {
    fn is_retriable(&self) -> bool {
        !self.fatal && self.error.is_retriable()
    }
}

pub type StepOutcome = Result<StepResult, StepFailure>;

pub struct ActionExecutor {
    driver: Arc<dyn AutomationDriver>,
    validator: Arc<dyn CapabilityValidator>,
    vault: Arc<dyn CredentialVault>,
    audit: Arc<dyn AuditLogger>,
    memory: FailureMemory,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn AutomationDriver>, memory: FailureMemory) -> Self {
        Self {
            driver,
            validator: Arc::new(AllowAll),
            vault: Arc::new(EmptyVault),
            audit: Arc::new(NoopAuditLogger),
            memory,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn CapabilityValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = vault;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn driver(&self) -> &Arc<dyn AutomationDriver> {
        &self.driver
    }

    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    pub fn memory(&self) -> &FailureMemory {
        &self.memory
    }

    /// Run `action` through its chain, consulting and updating failure memory.
    pub async fn execute(&self, task: &TaskContext, step_index: usize, action: &Action) -> StepOutcome {
        let started = Instant::now();
        if let Err(error) = self.validate(task, action).await {
            return Err(self.finish_failure(task, step_index, action, error, started, false).await);
        }

        let selector = action.params.selector.as_deref();
        let learned = match self.memory.lookup(&task.domain, action.action_type, selector).await {
            Ok(found) => found,
            Err(e) => {
                warn!(domain = %task.domain, error = %e, "failure memory lookup failed, using default chain");
                None
            }
        };
        let chain = ordered_chain(action, learned.as_ref());

        let attempt = self.run_chain(task, action, &chain, learned.as_ref()).await;
        match attempt {
            ChainResult::Succeeded { method, data, first_error } => {
                self.learn_from_success(task, action, method, learned.as_ref(), first_error)
                    .await;
                let mut result = self.base_result(step_index, action, started);
                result.success = true;
                result.method = Some(method.name().to_string());
                result.data = data;
                self.finish(task, result, true).await
            }
            ChainResult::SessionLost(err) => {
                let error = EngineError::Session(err.to_string());
                Err(self.finish_failure(task, step_index, action, error, started, false).await)
            }
            ChainResult::Exhausted { attempted, last } => {
                self.record_unresolved(task, action, &last).await;
                let error = EngineError::MethodsExhausted {
                    action: action.describe(),
                    attempted,
                    last_error: last.to_string(),
                };
                Err(self.finish_failure(task, step_index, action, error, started, true).await)
            }
        }
    }

    /// Run exactly one method, bypassing failure memory. Used when applying a
    /// diagnosed fix.
    pub async fn execute_with_method(
        &self,
        task: &TaskContext,
        step_index: usize,
        action: &Action,
        method: Method,
    ) -> StepOutcome {
        let started = Instant::now();
        if let Err(error) = self.validate(task, action).await {
            return Err(self.finish_failure(task, step_index, action, error, started, false).await);
        }
        match self.run_chain(task, action, &[method], None).await {
            ChainResult::Succeeded { data, .. } => {
                let mut result = self.base_result(step_index, action, started);
                result.success = true;
                result.method = Some(method.name().to_string());
                result.data = data;
                self.finish(task, result, true).await
            }
            ChainResult::SessionLost(err) => {
                let error = EngineError::Session(err.to_string());
                Err(self.finish_failure(task, step_index, action, error, started, false).await)
            }
            ChainResult::Exhausted { attempted, last } => {
                let error = EngineError::MethodsExhausted {
                    action: action.describe(),
                    attempted,
                    last_error: last.to_string(),
                };
                Err(self.finish_failure(task, step_index, action, error, started, true).await)
            }
        }
    }

    async fn validate(&self, task: &TaskContext, action: &Action) -> Result<(), EngineError> {
        let verdict = self.validator.validate(&task.user_id, action).await;
        if verdict.approved {
            return Ok(());
        }
        let reason = verdict.reason.unwrap_or_else(|| "outside capability scope".to_string());
        info!(task_id = %task.task_id, action = %action.describe(), reason = %reason, "action blocked");
        Err(EngineError::Blocked(reason))
    }

    async fn run_chain(
        &self,
        task: &TaskContext,
        action: &Action,
        chain: &[Method],
        learned: Option<&LearnedFix>,
    ) -> ChainResult {
        let mut first_error: Option<MethodError> = None;
        let mut last: Option<MethodError> = None;
        for &method in chain {
            let is_learned = learned.is_some_and(|fix| fix.method == method.name());
            let ctx = MethodContext {
                driver: self.driver.as_ref(),
                vault: self.vault.as_ref(),
                task,
                action,
                selector_override: if is_learned {
                    learned.and_then(|fix| fix.selector.as_deref())
                } else {
                    None
                },
            };
            match method.run(&ctx).await {
                Ok(data) => {
                    debug!(action = %action.describe(), method = method.name(), "method succeeded");
                    return ChainResult::Succeeded {
                        method,
                        data,
                        first_error,
                    };
                }
                Err(err) => {
                    debug!(
                        action = %action.describe(),
                        method = method.name(),
                        error = %err,
                        "method failed, falling back"
                    );
                    if is_learned {
                        if let Some(fix) = learned {
                            if let Err(e) = self.memory.record_solution_failed(&fix.key).await {
                                warn!(error = %e, "could not debit learned fix");
                            }
                        }
                    }
                    if err.is_session_loss() {
                        return ChainResult::SessionLost(err);
                    }
                    if first_error.is_none() && !matches!(err, MethodError::NotApplicable(_)) {
                        first_error = Some(err.clone());
                    }
                    // Keep the most informative error: a driver failure beats "not applicable".
                    let replace = match (&last, &err) {
                        (None, _) => true,
                        (Some(MethodError::NotApplicable(_)), _) => true,
                        (Some(_), MethodError::NotApplicable(_)) => false,
                        _ => true,
                    };
                    if replace {
                        last = Some(err);
                    }
                }
            }
        }
        ChainResult::Exhausted {
            attempted: chain.len(),
            last: last.unwrap_or_else(|| MethodError::NotApplicable("empty method chain".into())),
        }
    }

    async fn learn_from_success(
        &self,
        task: &TaskContext,
        action: &Action,
        method: Method,
        learned: Option<&LearnedFix>,
        first_error: Option<MethodError>,
    ) {
        if action.action_type.is_meta() {
            return;
        }
        if let Some(fix) = learned.filter(|fix| fix.method == method.name()) {
            if let Err(e) = self.memory.record_success(&fix.key).await {
                warn!(error = %e, "could not credit learned fix");
            }
            return;
        }
        let default = chain_for(action.action_type).first().copied();
        if Some(method) == default {
            return;
        }
        info!(
            domain = %task.domain,
            action = %action.describe(),
            method = method.name(),
            "learned fallback method"
        );
        let report = FailureReport {
            domain: task.domain.clone(),
            action_type: action.action_type,
            selector: action.params.selector.clone(),
            original_method: default.map(|m| m.name().to_string()),
            error_type: first_error
                .as_ref()
                .map(MethodError::error_type)
                .unwrap_or("not_applicable")
                .to_string(),
            solution: Some(Solution::method(method.name())),
        };
        if let Err(e) = self.memory.record_failure(report).await {
            warn!(error = %e, "could not record learned solution");
        }
    }

    async fn record_unresolved(&self, task: &TaskContext, action: &Action, last: &MethodError) {
        if action.action_type.is_meta() {
            return;
        }
        let report = FailureReport {
            domain: task.domain.clone(),
            action_type: action.action_type,
            selector: action.params.selector.clone(),
            original_method: chain_for(action.action_type).first().map(|m| m.name().to_string()),
            error_type: last.error_type().to_string(),
            solution: None,
        };
        if let Err(e) = self.memory.record_failure(report).await {
            warn!(error = %e, "could not record unresolved failure");
        }
    }

    fn base_result(&self, step_index: usize, action: &Action, started: Instant) -> StepResult {
        StepResult {
            step_index,
            success: false,
            action: action.clone(),
            method: None,
            data: None,
            error: None,
            error_kind: None,
            screenshot_ref: None,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: 1,
        }
    }

    async fn finish_failure(
        &self,
        task: &TaskContext,
        step_index: usize,
        action: &Action,
        error: EngineError,
        started: Instant,
        capture: bool,
    ) -> StepFailure {
        let mut result = self.base_result(step_index, action, started);
        result.error = Some(error.to_string());
        result.error_kind = Some(error.kind());
        match self.finish(task, result, capture).await {
            Ok(result) | Err(StepFailure { result, .. }) => StepFailure::new(error, result),
        }
    }

    /// Attach the evidence screenshot and write the audit row.
    async fn finish(&self, task: &TaskContext, mut result: StepResult, capture: bool) -> StepOutcome {
        if capture && !result.action.action_type.is_meta() {
            match self.driver.screenshot().await {
                Ok(reference) => result.screenshot_ref = Some(reference),
                Err(e) => debug!(error = %e, "evidence screenshot failed"),
            }
        }
        audit_best_effort(
            self.audit.as_ref(),
            AuditEntry {
                task_id: task.task_id.clone(),
                user_id: task.user_id.clone(),
                domain: task.domain.clone(),
                step_index: result.step_index,
                action: result.action.describe(),
                success: result.success,
                method: result.method.clone(),
                error_kind: result.error_kind,
                screenshot_ref: result.screenshot_ref.clone(),
                duration_ms: result.duration_ms,
                at: Utc::now(),
            },
        );
        Ok(result)
    }
}

enum ChainResult {
    Succeeded {
        method: Method,
        data: Option<serde_json::Value>,
        first_error: Option<MethodError>,
    },
    SessionLost(MethodError),
    Exhausted {
        attempted: usize,
        last: MethodError,
    },
}

/// Default chain with the learned method, if it belongs to this action type, moved first.
fn ordered_chain(action: &Action, learned: Option<&LearnedFix>) -> Vec<Method> {
    let mut chain = chain_for(action.action_type).to_vec();
    if let Some(method) = learned.and_then(|fix| Method::from_name(&fix.method)) {
        if let Some(pos) = chain.iter().position(|m| *m == method) {
            let m = chain.remove(pos);
            chain.insert(0, m);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::driver::{DriverError, Locator};
    use crate::error::ErrorKind;
    use crate::memory::{FailureKey, InMemoryLearningStore};
    use crate::services::{Credential, Validation};
    use crate::test_support::{MapVault, RecordingAuditLogger, ScriptedDriver, StaticValidator};
    use crate::types::ActionType;

    fn setup(driver: Arc<ScriptedDriver>) -> (ActionExecutor, FailureMemory) {
        let memory = FailureMemory::new(Arc::new(InMemoryLearningStore::new()), MemoryConfig::default());
        (ActionExecutor::new(driver, memory.clone()), memory)
    }

    fn task() -> TaskContext {
        TaskContext::new("u1", "example.com", "form_submit")
    }

    #[tokio::test]
    async fn test_text_fallback_is_learned() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_element(Locator::Text("Submit".into()));
        let (exec, memory) = setup(driver.clone());

        let result = exec.execute(&task(), 0, &Action::click("#submit")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.method.as_deref(), Some("click_text"));
        assert!(result.screenshot_ref.is_some());

        let fix = memory
            .lookup("example.com", ActionType::Click, Some("#submit"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fix.method, "click_text");
        assert!(fix.exact);
    }

    #[tokio::test]
    async fn test_learned_method_runs_first_and_is_credited() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_element(Locator::Text("Submit".into()));
        let (exec, memory) = setup(driver.clone());
        exec.execute(&task(), 0, &Action::click("#submit")).await.unwrap();
        let clicks_before = driver.calls("click");

        exec.execute(&task(), 0, &Action::click("#submit")).await.unwrap();
        assert_eq!(driver.calls("click") - clicks_before, 1, "learned method tried first");

        let key = FailureKey::new("example.com", ActionType::Click, Some("#submit"));
        let row = memory.lookup("example.com", ActionType::Click, Some("#submit")).await.unwrap().unwrap();
        assert_eq!(row.key, key);
        assert_eq!(row.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_default_method_success_writes_nothing() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_element(Locator::Css("#ok".into()));
        let (exec, memory) = setup(driver);
        let result = exec.execute(&task(), 0, &Action::click("#ok")).await.unwrap();
        assert_eq!(result.method.as_deref(), Some("click_css"));
        assert!(memory.recent_failures("example.com", ActionType::Click).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_records_unresolved_row() {
        let driver = Arc::new(ScriptedDriver::new());
        let (exec, memory) = setup(driver);
        let failure = exec.execute(&task(), 2, &Action::click("#gone")).await.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Structural);
        assert_eq!(failure.result.step_index, 2);
        assert!(!failure.result.success);

        let rows = memory.recent_failures("example.com", ActionType::Click).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].solution.is_none());
        assert_eq!(rows[0].error_type, "not_found");
    }

    #[tokio::test]
    async fn test_blocked_action_is_not_retriable() {
        let driver = Arc::new(ScriptedDriver::new());
        let (exec, _) = setup(driver.clone());
        let exec = exec.with_validator(Arc::new(StaticValidator::new(Validation::rejected("payments disabled"))));
        let failure = exec.execute(&task(), 0, &Action::click("#pay")).await.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Blocked);
        assert!(!failure.is_retriable());
        assert_eq!(driver.calls("click"), 0);
    }

    #[tokio::test]
    async fn test_session_loss_aborts_chain() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.fail_next("click", DriverError::SessionClosed("browser crashed".into()));
        let (exec, _) = setup(driver.clone());
        let failure = exec.execute(&task(), 0, &Action::click("#x")).await.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Session);
        assert_eq!(driver.calls("click"), 1);
    }

    #[tokio::test]
    async fn test_login_uses_vault_when_no_explicit_credentials() {
        let driver = Arc::new(ScriptedDriver::permissive());
        let vault = MapVault::new();
        vault.insert(
            "u1",
            "example.com",
            Credential {
                username: "ada".into(),
                password: "pw".into(),
                expired: false,
            },
        );
        let audit = Arc::new(RecordingAuditLogger::new());
        let (exec, _) = setup(driver.clone());
        let exec = exec.with_vault(Arc::new(vault)).with_audit(audit.clone());

        let result = exec.execute(&task(), 0, &Action::login()).await.unwrap();
        assert_eq!(result.method.as_deref(), Some("login_vault_credentials"));
        assert_eq!(driver.filled_values(), vec!["ada".to_string(), "pw".to_string()]);
        assert_eq!(audit.entries().len(), 1);
    }
}
