//! Failure Diagnoser: ranked hypotheses for a failed step, and automatic
//! application of the most likely fixes.
//!
//! Hypotheses are derived deterministically from the error text and attempt
//! count; no model is consulted.
//!
//! | Signal                                   | Hypothesis            | Likelihood |
//! |------------------------------------------|-----------------------|------------|
//! | "not found" / "selector"                 | retry next method     | 80         |
//! | "timeout" / "loading"                    | progressive wait      | 75         |
//! | first attempt, no timing words           | progressive wait      | 50         |
//! | "unauthorized" / "login", expired cred   | refresh credential    | 90         |
//! | "unauthorized" / "login"                 | refresh credential    | 65         |
//! | "unauthorized" / "login"                 | clear session         | 70         |
//! | "shadow" / "iframe"                      | switch to vision      | 85         |
//! | ≥ 2 attempts                             | switch to vision      | 60         |
//! | ≥ 3 attempts                             | escalate tier         | 55         |
//! | CAPTCHA / verification mentioned         | escalate to human     | 95         |
//! | ≥ 5 attempts                             | escalate to human     | 40         |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::executor::{ActionExecutor, Method};
use crate::memory::{FailureMemory, FailureReport, Solution, VerificationLearningStore};
use crate::types::{Action, StepResult, TaskContext};

/// How many hypotheses [`FailureDiagnoser::auto_fix`] tries.
pub const MAX_FIX_ATTEMPTS: usize = 3;

/// Delays of the progressive-wait fix, tried in order.
pub const PROGRESSIVE_WAITS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(5)];

/// Remediation a hypothesis suggests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    /// Re-run the fallback chain; failure memory may reorder it.
    RetryNextMethod,
    /// Wait 2s, retry, then 5s, retry.
    ProgressiveWait,
    RefreshCredential,
    ClearSession,
    SwitchToVision,
    /// Hand the step to a stronger execution tier.
    EscalateTier,
    EscalateToHuman { reason: String },
}

impl FixKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryNextMethod => "retry_next_method",
            Self::ProgressiveWait => "progressive_wait",
            Self::RefreshCredential => "refresh_credential",
            Self::ClearSession => "clear_session",
            Self::SwitchToVision => "switch_to_vision",
            Self::EscalateTier => "escalate_tier",
            Self::EscalateToHuman { .. } => "escalate_to_human",
        }
    }

    /// Escalations cannot be applied in-process.
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::EscalateTier | Self::EscalateToHuman { .. })
    }

    /// Correction hint recorded when this fix resolves a failure.
    pub fn correction_hint(&self, action: &Action) -> String {
        let target = action.describe();
        match self {
            Self::RetryNextMethod => format!("{target}: default selector is unreliable, use an alternative locator"),
            Self::ProgressiveWait => format!("{target}: wait for the page to finish loading first"),
            Self::RefreshCredential => "stored credentials expire; refresh them before logging in".to_string(),
            Self::ClearSession => "stale session cookies break login; clear the stored session".to_string(),
            Self::SwitchToVision => format!("{target}: use vision-guided interaction"),
            Self::EscalateTier => format!("{target}: needs a stronger execution tier"),
            Self::EscalateToHuman { reason } => format!("{target}: needs a human ({reason})"),
        }
    }
}

impl std::fmt::Display for FixKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugHypothesis {
    pub cause: String,
    /// Percentage in [0, 100].
    pub likelihood: f64,
    pub suggested_fix: FixKind,
    pub reasoning: String,
}

/// What the diagnoser knows about a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisInput {
    pub error: String,
    /// Attempts already spent on the step.
    pub attempts: u32,
    /// The vault holds an expired credential for the domain.
    #[serde(default)]
    pub credential_expired: bool,
    /// Earlier failures recorded for the same domain and action type.
    #[serde(default)]
    pub prior_failures: u32,
}

/// Ranked hypotheses, most likely first.
pub fn hypothesize(input: &DiagnosisInput) -> Vec<DebugHypothesis> {
    let err = input.error.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| err.contains(w));
    let history = if input.prior_failures > 0 {
        format!("; {} earlier failure(s) on this site", input.prior_failures)
    } else {
        String::new()
    };
    let mut out = Vec::new();

    if has(&["not found", "selector", "no such element", "no element"]) {
        out.push(DebugHypothesis {
            cause: "selector or layout mismatch".into(),
            likelihood: 80.0,
            suggested_fix: FixKind::RetryNextMethod,
            reasoning: format!("target element could not be resolved{history}"),
        });
    }

    let timing_words = has(&["timeout", "timed out", "loading"]);
    if timing_words || input.attempts <= 1 {
        out.push(DebugHypothesis {
            cause: "page not ready".into(),
            likelihood: if timing_words { 75.0 } else { 50.0 },
            suggested_fix: FixKind::ProgressiveWait,
            reasoning: if timing_words {
                "error mentions a timeout or loading state".into()
            } else {
                "first attempt failed; the page may still have been rendering".into()
            },
        });
    }

    if has(&["unauthorized", "login", "401", "403", "session expired", "credential"]) {
        out.push(DebugHypothesis {
            cause: "expired credential".into(),
            likelihood: if input.credential_expired { 90.0 } else { 65.0 },
            suggested_fix: FixKind::RefreshCredential,
            reasoning: if input.credential_expired {
                format!("vault reports the stored credential as expired{history}")
            } else {
                format!("authentication was rejected{history}")
            },
        });
        out.push(DebugHypothesis {
            cause: "stale stored session".into(),
            likelihood: 70.0,
            suggested_fix: FixKind::ClearSession,
            reasoning: format!("a persisted session may be overriding fresh login{history}"),
        });
    }

    let complex_dom = has(&["shadow", "iframe"]);
    if complex_dom || input.attempts >= 2 {
        out.push(DebugHypothesis {
            cause: "complex DOM".into(),
            likelihood: if complex_dom { 85.0 } else { 60.0 },
            suggested_fix: FixKind::SwitchToVision,
            reasoning: if complex_dom {
                "element sits inside a shadow root or iframe".into()
            } else {
                format!("{} attempts failed with DOM locators", input.attempts)
            },
        });
    }

    if input.attempts >= 3 {
        out.push(DebugHypothesis {
            cause: "method chain exhausted".into(),
            likelihood: 55.0,
            suggested_fix: FixKind::EscalateTier,
            reasoning: format!("{} attempts exhausted the fallback chain", input.attempts),
        });
    }

    if has(&["captcha", "verification"]) {
        out.push(DebugHypothesis {
            cause: "human verification wall".into(),
            likelihood: 95.0,
            suggested_fix: FixKind::EscalateToHuman {
                reason: "captcha or verification challenge".into(),
            },
            reasoning: "site demands a human verification step".into(),
        });
    } else if input.attempts >= 5 {
        out.push(DebugHypothesis {
            cause: "full exhaustion".into(),
            likelihood: 40.0,
            suggested_fix: FixKind::EscalateToHuman {
                reason: format!("{} attempts failed", input.attempts),
            },
            reasoning: "every automated remedy has been tried".into(),
        });
    }

    out.sort_by(|a, b| b.likelihood.total_cmp(&a.likelihood));
    out
}

/// A failed step to repair.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub task: TaskContext,
    pub step_index: usize,
    pub action: Action,
    pub input: DiagnosisInput,
}

/// Result of applying one fix.
#[derive(Debug)]
pub enum FixAttempt {
    Fixed(StepResult),
    /// The fix cannot run here (e.g. nothing to refresh, escalation).
    NotApplicable(String),
    Failed(EngineError),
}

/// Applies a [`FixKind`] to a failed step.
#[async_trait]
pub trait FixApplier: Send + Sync {
    async fn apply(&self, fix: &FixKind, ctx: &FailureContext) -> FixAttempt;
}

/// Applies fixes by re-running the step through an [`ActionExecutor`].
pub struct StepFixApplier<'a> {
    executor: &'a ActionExecutor,
}

impl<'a> StepFixApplier<'a> {
    pub fn new(executor: &'a ActionExecutor) -> Self {
        Self { executor }
    }

    async fn rerun(&self, ctx: &FailureContext) -> FixAttempt {
        match self.executor.execute(&ctx.task, ctx.step_index, &ctx.action).await {
            Ok(result) => FixAttempt::Fixed(result),
            Err(failure) => FixAttempt::Failed(failure.error),
        }
    }
}

#[async_trait]
impl FixApplier for StepFixApplier<'_> {
    async fn apply(&self, fix: &FixKind, ctx: &FailureContext) -> FixAttempt {
        let task = &ctx.task;
        match fix {
            FixKind::RetryNextMethod => self.rerun(ctx).await,
            FixKind::ProgressiveWait => {
                let mut last = FixAttempt::NotApplicable("no wait configured".into());
                for delay in PROGRESSIVE_WAITS {
                    debug!(delay_ms = delay.as_millis() as u64, "progressive wait");
                    tokio::time::sleep(delay).await;
                    last = self.rerun(ctx).await;
                    if matches!(last, FixAttempt::Fixed(_)) {
                        break;
                    }
                }
                last
            }
            FixKind::RefreshCredential => match self.executor.vault().refresh(&task.user_id, &task.domain).await {
                Ok(true) => self.rerun(ctx).await,
                Ok(false) => FixAttempt::NotApplicable("vault has no refreshable credential".into()),
                Err(e) => FixAttempt::Failed(e),
            },
            FixKind::ClearSession => match self.executor.driver().clear_session(&task.domain).await {
                Ok(()) => self.rerun(ctx).await,
                Err(e) => FixAttempt::Failed(e.into()),
            },
            FixKind::SwitchToVision => match Method::vision_for(ctx.action.action_type) {
                Some(method) => match self
                    .executor
                    .execute_with_method(task, ctx.step_index, &ctx.action, method)
                    .await
                {
                    Ok(result) => FixAttempt::Fixed(result),
                    Err(failure) => FixAttempt::Failed(failure.error),
                },
                None => FixAttempt::NotApplicable(format!("no vision method for {}", ctx.action.action_type)),
            },
            FixKind::EscalateTier | FixKind::EscalateToHuman { .. } => {
                FixAttempt::NotApplicable(format!("{fix} is handled by the caller"))
            }
        }
    }
}

/// Outcome of [`FailureDiagnoser::auto_fix`].
#[derive(Debug)]
pub struct FixReport {
    pub fixed: bool,
    pub hypotheses: Vec<DebugHypothesis>,
    /// Hypothesis whose fix worked.
    pub applied: Option<DebugHypothesis>,
    pub result: Option<StepResult>,
    /// Each tried fix and what happened.
    pub tried: Vec<(FixKind, String)>,
    /// Highest-ranked escalation among the tried hypotheses, for the caller.
    pub escalation: Option<FixKind>,
    pub message: String,
}

pub struct FailureDiagnoser {
    memory: FailureMemory,
    learning: VerificationLearningStore,
}

impl FailureDiagnoser {
    pub fn new(memory: FailureMemory, learning: VerificationLearningStore) -> Self {
        Self { memory, learning }
    }

    /// Hypotheses for a failure, counting prior failures from failure memory
    /// when the caller did not supply them.
    pub async fn diagnose(&self, ctx: &FailureContext) -> Vec<DebugHypothesis> {
        let mut input = ctx.input.clone();
        if input.prior_failures == 0 {
            match self
                .memory
                .recent_failures(&ctx.task.domain, ctx.action.action_type)
                .await
            {
                Ok(rows) => input.prior_failures = rows.iter().map(|r| r.failure_count).sum(),
                Err(e) => warn!(error = %e, "could not read failure history"),
            }
        }
        let hypotheses = hypothesize(&input);
        for h in &hypotheses {
            debug!(
                cause = %h.cause,
                likelihood = h.likelihood,
                fix = %h.suggested_fix,
                "hypothesis"
            );
        }
        hypotheses
    }

    /// Try the top hypotheses in order; the first fix that works is recorded
    /// as a learned correction.
    pub async fn auto_fix(&self, ctx: &FailureContext, applier: &dyn FixApplier) -> FixReport {
        let hypotheses = self.diagnose(ctx).await;
        let mut tried = Vec::new();
        let mut escalation = None;

        for hypothesis in hypotheses.iter().take(MAX_FIX_ATTEMPTS) {
            let fix = &hypothesis.suggested_fix;
            if fix.is_escalation() {
                escalation.get_or_insert_with(|| fix.clone());
                tried.push((fix.clone(), "escalation deferred to caller".to_string()));
                continue;
            }
            match applier.apply(fix, ctx).await {
                FixAttempt::Fixed(result) => {
                    info!(
                        task_id = %ctx.task.task_id,
                        domain = %ctx.task.domain,
                        fix = %fix,
                        likelihood = hypothesis.likelihood,
                        "auto-fix succeeded"
                    );
                    tried.push((fix.clone(), "fixed".to_string()));
                    self.record_fix(ctx, fix, &result, true).await;
                    return FixReport {
                        fixed: true,
                        hypotheses: hypotheses.clone(),
                        applied: Some(hypothesis.clone()),
                        result: Some(result),
                        tried,
                        escalation,
                        message: format!("fixed by {fix}: {}", hypothesis.cause),
                    };
                }
                FixAttempt::NotApplicable(reason) => {
                    debug!(fix = %fix, reason = %reason, "fix not applicable");
                    tried.push((fix.clone(), format!("not applicable: {reason}")));
                }
                FixAttempt::Failed(e) => {
                    debug!(fix = %fix, error = %e, "fix failed");
                    self.learn(ctx, fix, false).await;
                    tried.push((fix.clone(), format!("failed: {e}")));
                }
            }
        }

        warn!(
            task_id = %ctx.task.task_id,
            error = %ctx.input.error,
            tried = tried.len(),
            "could not auto-fix"
        );
        FixReport {
            fixed: false,
            hypotheses,
            applied: None,
            result: None,
            tried,
            escalation,
            message: format!("could not auto-fix: {}", ctx.input.error),
        }
    }

    async fn record_fix(&self, ctx: &FailureContext, fix: &FixKind, result: &StepResult, helped: bool) {
        // Chain reruns already teach failure memory through the executor.
        if *fix == FixKind::SwitchToVision {
            if let Some(method) = result.method.clone() {
                let report = FailureReport {
                    domain: ctx.task.domain.clone(),
                    action_type: ctx.action.action_type,
                    selector: ctx.action.params.selector.clone(),
                    original_method: None,
                    error_type: "diagnosed".to_string(),
                    solution: Some(Solution::method(method)),
                };
                if let Err(e) = self.memory.record_failure(report).await {
                    warn!(error = %e, "could not record vision fix");
                }
            }
        }
        self.learn(ctx, fix, helped).await;
    }

    async fn learn(&self, ctx: &FailureContext, fix: &FixKind, helped: bool) {
        let hint = fix.correction_hint(&ctx.action);
        if let Err(e) = self
            .learning
            .record_correction(&ctx.task.domain, &ctx.task.task_type, &hint, helped)
            .await
        {
            warn!(error = %e, "could not record correction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::MemoryConfig;
    use crate::driver::{DriverError, Locator};
    use crate::memory::{FailureKey, InMemoryLearningStore, LearningStore};
    use crate::services::Credential;
    use crate::test_support::{MapVault, ScriptedDriver};
    use crate::types::ActionType;

    fn input(error: &str, attempts: u32) -> DiagnosisInput {
        DiagnosisInput {
            error: error.into(),
            attempts,
            ..DiagnosisInput::default()
        }
    }

    fn fixes(hs: &[DebugHypothesis]) -> Vec<&str> {
        hs.iter().map(|h| h.suggested_fix.as_str()).collect()
    }

    #[test]
    fn test_expired_credential_outranks_clear_session() {
        let hs = hypothesize(&DiagnosisInput {
            error: "all 3 methods failed for login: unauthorized: stored credential expired".into(),
            attempts: 1,
            credential_expired: true,
            prior_failures: 3,
        });
        let refresh = hs.iter().find(|h| h.suggested_fix == FixKind::RefreshCredential).unwrap();
        let clear = hs.iter().find(|h| h.suggested_fix == FixKind::ClearSession).unwrap();
        assert_eq!(refresh.likelihood, 90.0);
        assert_eq!(clear.likelihood, 70.0);
        assert_eq!(hs[0].suggested_fix, FixKind::RefreshCredential);
        assert!(refresh.reasoning.contains("3 earlier failure(s)"));
    }

    #[test]
    fn test_unexpired_auth_failure_prefers_clearing_session() {
        let hs = hypothesize(&input("login failed: 401", 2));
        let auth: Vec<_> = fixes(&hs)
            .into_iter()
            .filter(|f| *f == "clear_session" || *f == "refresh_credential")
            .collect();
        assert_eq!(auth, vec!["clear_session", "refresh_credential"]);
    }

    #[test]
    fn test_selector_and_timing_ranking() {
        let hs = hypothesize(&input("element not found: css=#buy", 1));
        assert_eq!(fixes(&hs), vec!["retry_next_method", "progressive_wait"]);
        assert_eq!(hs[1].likelihood, 50.0);

        let hs = hypothesize(&input("navigate timed out after 30000ms", 2));
        assert_eq!(fixes(&hs), vec!["progressive_wait", "switch_to_vision"]);
    }

    #[test]
    fn test_shadow_dom_and_exhaustion() {
        let hs = hypothesize(&input("target inside shadow root not found", 3));
        assert_eq!(hs[0].suggested_fix, FixKind::SwitchToVision);
        assert_eq!(hs[0].likelihood, 85.0);
        assert!(hs.iter().any(|h| h.suggested_fix == FixKind::EscalateTier));

        let hs = hypothesize(&input("flaky", 5));
        assert!(hs.iter().any(|h| matches!(h.suggested_fix, FixKind::EscalateToHuman { .. }) && h.likelihood == 40.0));
    }

    #[test]
    fn test_captcha_escalates_to_human_first() {
        let hs = hypothesize(&input("blocked by CAPTCHA challenge", 1));
        assert!(matches!(hs[0].suggested_fix, FixKind::EscalateToHuman { .. }));
        assert_eq!(hs[0].likelihood, 95.0);
    }

    fn stores() -> (Arc<InMemoryLearningStore>, FailureMemory, VerificationLearningStore) {
        let store = Arc::new(InMemoryLearningStore::new());
        let dyn_store: Arc<dyn LearningStore> = store.clone();
        (
            store,
            FailureMemory::new(dyn_store.clone(), MemoryConfig::default()),
            VerificationLearningStore::new(dyn_store, MemoryConfig::default()),
        )
    }

    fn login_context(error: &str) -> FailureContext {
        FailureContext {
            task: TaskContext::new("u1", "bank.test", "login"),
            step_index: 0,
            action: Action::login(),
            input: DiagnosisInput {
                error: error.into(),
                attempts: 1,
                credential_expired: true,
                prior_failures: 0,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_fix_refreshes_credential_and_learns_hint() {
        let (_, memory, learning) = stores();
        let vault = Arc::new(MapVault::new());
        vault.insert(
            "u1",
            "bank.test",
            Credential {
                username: "ada".into(),
                password: "pw".into(),
                expired: true,
            },
        );
        vault.set_refreshable(true);
        let driver = Arc::new(ScriptedDriver::permissive());
        let executor = ActionExecutor::new(driver.clone(), memory.clone()).with_vault(vault);
        let diagnoser = FailureDiagnoser::new(memory, learning.clone());

        let ctx = login_context("unauthorized: stored credential expired");
        let report = diagnoser.auto_fix(&ctx, &StepFixApplier::new(&executor)).await;

        assert!(report.fixed, "{}", report.message);
        assert_eq!(report.tried[0].0, FixKind::RefreshCredential);
        assert_eq!(
            report.result.unwrap().method.as_deref(),
            Some("login_vault_credentials")
        );
        assert_eq!(driver.filled_values(), vec!["ada".to_string(), "pw".to_string()]);

        let hint = FixKind::RefreshCredential.correction_hint(&ctx.action);
        let row = learning.record_correction("bank.test", "login", &hint, true).await.unwrap();
        assert_eq!(row.times_applied, 2, "auto-fix recorded one application");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_fix_reports_original_error_when_nothing_works() {
        let (_, memory, learning) = stores();
        let driver = Arc::new(ScriptedDriver::new());
        let executor = ActionExecutor::new(driver, memory.clone());
        let diagnoser = FailureDiagnoser::new(memory, learning);
        let ctx = FailureContext {
            task: TaskContext::new("u1", "shop.test", "purchase"),
            step_index: 2,
            action: Action::click("#gone"),
            input: input("element not found: css=#gone", 1),
        };

        let report = diagnoser.auto_fix(&ctx, &StepFixApplier::new(&executor)).await;
        assert!(!report.fixed);
        assert_eq!(report.message, "could not auto-fix: element not found: css=#gone");
        assert_eq!(report.tried.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vision_fix_is_written_to_failure_memory() {
        let (_, memory, learning) = stores();
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_element(Locator::Vision("Buy now".into()));
        let executor = ActionExecutor::new(driver.clone(), memory.clone());
        let diagnoser = FailureDiagnoser::new(memory.clone(), learning);
        let action = Action::click("#buy-now").with_text("Buy now");
        let ctx = FailureContext {
            task: TaskContext::new("u1", "shop.test", "purchase"),
            step_index: 1,
            action: action.clone(),
            input: input("element inside iframe could not be clicked", 2),
        };

        let report = diagnoser.auto_fix(&ctx, &StepFixApplier::new(&executor)).await;
        assert!(report.fixed, "{}", report.message);
        assert_eq!(report.applied.unwrap().suggested_fix, FixKind::SwitchToVision);

        let fix = memory
            .lookup("shop.test", ActionType::Click, Some("#buy-now"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fix.method, "click_vision");
        assert_eq!(fix.key, FailureKey::new("shop.test", ActionType::Click, Some("#buy-now")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressive_wait_retries_after_delays() {
        let (_, memory, learning) = stores();
        let driver = Arc::new(ScriptedDriver::permissive());
        driver.fail_next("navigate", DriverError::Timeout("slow".into()));
        driver.fail_next("evaluate", DriverError::Timeout("slow".into()));
        let executor = ActionExecutor::new(driver.clone(), memory.clone());
        let diagnoser = FailureDiagnoser::new(memory, learning);
        let ctx = FailureContext {
            task: TaskContext::new("u1", "news.test", "research"),
            step_index: 0,
            action: Action::navigate("https://news.test"),
            input: input("navigate timed out", 1),
        };

        let started = tokio::time::Instant::now();
        let report = diagnoser.auto_fix(&ctx, &StepFixApplier::new(&executor)).await;
        assert!(report.fixed);
        assert_eq!(report.tried[0].0, FixKind::ProgressiveWait);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
