//! Runs an action list end to end.
//!
//! ```text
//! task timeout (180s)
//! └─ for each step, strictly in order
//!      ├─ cancellation token checked
//!      ├─ step retry loop (2 retries, 1s/2s backoff; none for verify/wait)
//!      │    ├─ session liveness check → close + restart when dead
//!      │    └─ step timeout (30s) around the action executor
//!      └─ mutating action → network idle + 800ms settle
//! ```
//!
//! The log holds exactly one [`StepResult`] per step that ran: a retried
//! step's final attempt replaces the earlier ones. A task timeout tears down
//! the session and returns the log collected so far, charged to the last step
//! that started (including one still settling). Steps that never started get
//! no entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::driver::{AutomationDriver, WaitCondition};
use crate::error::{EngineError, ErrorKind};
use crate::executor::{ActionExecutor, StepFailure, StepOutcome};
use crate::resilience::RetryPolicy;
use crate::types::{Action, StepResult, TaskContext, TaskOutcome};

pub struct StepOrchestrator {
    executor: Arc<ActionExecutor>,
    config: OrchestratorConfig,
}

struct Abort {
    step: usize,
    error: EngineError,
    fatal: bool,
}

impl StepOrchestrator {
    pub fn new(executor: Arc<ActionExecutor>, config: OrchestratorConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    fn driver(&self) -> &Arc<dyn AutomationDriver> {
        self.executor.driver()
    }

    fn step_policy(&self, action: &Action) -> RetryPolicy {
        if !action.action_type.retried_at_step_level() {
            return RetryPolicy::no_retry();
        }
        RetryPolicy::new(
            self.config.step_retries,
            Duration::from_millis(self.config.step_backoff_base_ms),
            Duration::from_millis(self.config.step_backoff_max_ms),
        )
    }

    /// Run `actions` in order. Never returns `Err`: failures are reported in
    /// the outcome together with the partial log.
    pub async fn run(&self, task: &TaskContext, actions: &[Action], cancel: &CancellationToken) -> TaskOutcome {
        info!(task_id = %task.task_id, domain = %task.domain, steps = actions.len(), "task started");
        self.run_from(task, actions, 0, Vec::with_capacity(actions.len()), 0, cancel)
            .await
    }

    /// Continue a failed run after its failed step was repaired out of band.
    /// `repaired` replaces that step's log entry and execution picks up at the
    /// next step, within what is left of the task budget.
    pub async fn resume(
        &self,
        task: &TaskContext,
        actions: &[Action],
        failed: TaskOutcome,
        repaired: StepResult,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let index = repaired.step_index;
        let mut log = failed.steps;
        log.retain(|s| s.step_index < index);
        log.push(repaired);
        info!(task_id = %task.task_id, step = index, "resuming after repaired step");
        if actions.get(index).is_some_and(|a| a.action_type.is_mutating()) {
            self.settle().await;
        }
        self.run_from(task, actions, index + 1, log, failed.duration_ms, cancel)
            .await
    }

    async fn run_from(
        &self,
        task: &TaskContext,
        actions: &[Action],
        start: usize,
        mut log: Vec<StepResult>,
        spent_ms: u64,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.task_timeout_secs).saturating_sub(Duration::from_millis(spent_ms));
        // Last step handed to the executor; a task timeout is charged to it.
        let mut current = start;

        let raced = tokio::time::timeout(
            budget,
            self.run_steps(task, actions, start, cancel, &mut log, &mut current),
        )
        .await;
        let verdict = match raced {
            Ok(verdict) => verdict,
            Err(_) => {
                let step = current.min(actions.len().saturating_sub(1));
                let error = EngineError::Timeout {
                    label: "task".to_string(),
                    elapsed_ms: spent_ms + started.elapsed().as_millis() as u64,
                };
                let logged = log.iter().any(|s| s.step_index == step);
                if let (false, Some(action)) = (logged, actions.get(step)) {
                    log.push(StepResult::failed(step, action, ErrorKind::Timeout, error.to_string()));
                }
                Err(Abort {
                    step,
                    error,
                    fatal: true,
                })
            }
        };

        let duration_ms = spent_ms + started.elapsed().as_millis() as u64;
        match verdict {
            Ok(()) => {
                info!(task_id = %task.task_id, duration_ms, "task completed");
                TaskOutcome {
                    task_id: task.task_id.clone(),
                    success: true,
                    steps: log,
                    explanation: None,
                    error_kind: None,
                    failed_step: None,
                    duration_ms,
                }
            }
            Err(abort) => {
                if abort.fatal {
                    self.release_session().await;
                }
                let explanation = match actions.get(abort.step) {
                    Some(action) => format!("step {} ({}) failed: {}", abort.step, action.describe(), abort.error),
                    None => abort.error.to_string(),
                };
                warn!(
                    task_id = %task.task_id,
                    step = abort.step,
                    kind = %abort.error.kind(),
                    error = %abort.error,
                    "task failed"
                );
                TaskOutcome {
                    task_id: task.task_id.clone(),
                    success: false,
                    steps: log,
                    explanation: Some(explanation),
                    error_kind: Some(abort.error.kind()),
                    failed_step: Some(abort.step),
                    duration_ms,
                }
            }
        }
    }

    async fn run_steps(
        &self,
        task: &TaskContext,
        actions: &[Action],
        start: usize,
        cancel: &CancellationToken,
        log: &mut Vec<StepResult>,
        current: &mut usize,
    ) -> Result<(), Abort> {
        for (index, action) in actions.iter().enumerate().skip(start) {
            *current = index;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let error = EngineError::Cancelled(format!("task {}", task.task_id));
                    log.push(StepResult::failed(index, action, ErrorKind::Cancelled, error.to_string()));
                    return Err(Abort { step: index, error, fatal: false });
                }
                outcome = self.run_step(task, index, action, cancel) => outcome,
            };
            match outcome {
                Ok(result) => {
                    log.push(result);
                    if action.action_type.is_mutating() {
                        self.settle().await;
                    }
                }
                Err(failure) => {
                    let fatal = failure.fatal;
                    log.push(failure.result);
                    return Err(Abort {
                        step: index,
                        error: failure.error,
                        fatal,
                    });
                }
            }
        }
        Ok(())
    }

    /// One step under the step retry rule.
    pub async fn run_step(
        &self,
        task: &TaskContext,
        index: usize,
        action: &Action,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let label = format!("step {index} ({})", action.describe());
        let policy = self.step_policy(action);
        let step_budget = Duration::from_secs(self.config.step_timeout_secs);

        let result = policy
            .run(&label, |attempt| {
                let label = label.clone();
                async move {
                    if cancel.is_cancelled() {
                        let error = EngineError::Cancelled(label);
                        let result = StepResult::failed(index, action, ErrorKind::Cancelled, error.to_string());
                        return Err(StepFailure::new(error, result));
                    }
                    self.ensure_session(index, action).await?;
                    let started = Instant::now();
                    let outcome = match tokio::time::timeout(step_budget, self.executor.execute(task, index, action)).await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let error = EngineError::Timeout {
                                label: label.clone(),
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            };
                            let mut result =
                                StepResult::failed(index, action, ErrorKind::Timeout, error.to_string());
                            result.duration_ms = started.elapsed().as_millis() as u64;
                            Err(StepFailure::new(error, result))
                        }
                    };
                    stamp_attempts(outcome, attempt + 1)
                }
            })
            .await;

        result.map_err(|exhausted| {
            let mut failure = exhausted.last;
            failure.result.attempts = exhausted.attempts;
            failure
        })
    }

    /// Restart a dead session. A failed restart is fatal for the task.
    async fn ensure_session(&self, index: usize, action: &Action) -> Result<(), StepFailure> {
        let driver = self.driver();
        if driver.is_alive().await {
            return Ok(());
        }
        warn!(step = index, "session not alive, reinitializing");
        if let Err(e) = driver.close().await {
            debug!(error = %e, "closing dead session failed");
        }
        driver.restart().await.map_err(|e| {
            let error = EngineError::Session(format!("session restart failed: {e}"));
            let result = StepResult::failed(index, action, ErrorKind::Session, error.to_string());
            StepFailure::fatal(error, result)
        })
    }

    async fn settle(&self) {
        let idle = Duration::from_millis(self.config.network_idle_timeout_ms);
        if let Err(e) = self.driver().wait_for(&WaitCondition::NetworkIdle, idle).await {
            debug!(error = %e, "network did not go idle, continuing");
        }
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
    }

    async fn release_session(&self) {
        if let Err(e) = self.driver().close().await {
            debug!(error = %e, "session release failed");
        }
    }
}

fn stamp_attempts(outcome: StepOutcome, attempts: u32) -> StepOutcome {
    match outcome {
        Ok(mut result) => {
            result.attempts = attempts;
            Ok(result)
        }
        Err(mut failure) => {
            failure.result.attempts = attempts;
            Err(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::driver::{DriverError, Locator};
    use crate::memory::{FailureMemory, InMemoryLearningStore};
    use crate::test_support::ScriptedDriver;

    fn orchestrator(driver: Arc<ScriptedDriver>, config: OrchestratorConfig) -> StepOrchestrator {
        let memory = FailureMemory::new(Arc::new(InMemoryLearningStore::new()), MemoryConfig::default());
        StepOrchestrator::new(Arc::new(ActionExecutor::new(driver, memory)), config)
    }

    fn task() -> TaskContext {
        TaskContext::new("u1", "example.com", "form_submit")
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_steps_succeed_in_order() {
        let driver = Arc::new(ScriptedDriver::permissive());
        let orch = orchestrator(driver.clone(), OrchestratorConfig::default());
        let actions = vec![
            Action::navigate("https://example.com/form"),
            Action::fill("#email", "a@b.test"),
            Action::click("#submit"),
        ];
        let outcome = orch.run(&task(), &actions, &CancellationToken::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.steps.len(), 3);
        let indices: Vec<_> = outcome.steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert_eq!(driver.calls("wait_for"), 2, "navigate and click settle, fill does not");
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retry_replaces_attempt_in_log() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_element(Locator::Css("#late".into()));
        // First pass: seven click-based methods plus the js method all time out.
        for _ in 0..7 {
            driver.fail_next("click", DriverError::Timeout("slow".into()));
        }
        driver.fail_next("evaluate", DriverError::Timeout("slow".into()));
        let orch = orchestrator(driver, OrchestratorConfig::default());

        let outcome = orch.run(&task(), &[Action::click("#late")], &CancellationToken::new()).await;
        assert!(outcome.success, "{:?}", outcome.explanation);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_fails_after_three_attempts() {
        let driver = Arc::new(ScriptedDriver::new());
        let orch = orchestrator(driver, OrchestratorConfig::default());
        let started = Instant::now();
        let outcome = orch
            .run(&task(), &[Action::click("#missing"), Action::click("#never")], &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_step, Some(0));
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].attempts, 3);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Structural));
        assert!(started.elapsed() >= Duration::from_secs(3), "1s + 2s backoff");
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_is_not_retried() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.set_page_text("nothing here");
        let orch = orchestrator(driver, OrchestratorConfig::default());
        let outcome = orch
            .run(&task(), &[Action::verify_text("Order confirmed")], &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.steps[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_restarted() {
        let driver = Arc::new(ScriptedDriver::permissive());
        driver.set_alive(false);
        let orch = orchestrator(driver.clone(), OrchestratorConfig::default());
        let outcome = orch
            .run(&task(), &[Action::click("#go")], &CancellationToken::new())
            .await;
        assert!(outcome.success);
        assert_eq!(driver.calls("restart"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_is_fatal() {
        let driver = Arc::new(ScriptedDriver::permissive());
        driver.set_alive(false);
        driver.fail_next("restart", DriverError::Failed("no browser".into()));
        let orch = orchestrator(driver.clone(), OrchestratorConfig::default());
        let outcome = orch
            .run(&task(), &[Action::click("#go")], &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Session));
        assert_eq!(outcome.steps[0].attempts, 1);
        assert_eq!(driver.calls("restart"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_returns_partial_log() {
        let driver = Arc::new(ScriptedDriver::permissive());
        driver.set_delay("click", Duration::from_secs(20));
        let config = OrchestratorConfig {
            task_timeout_secs: 30,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(driver.clone(), config);
        let actions = vec![Action::navigate("https://example.com"), Action::click("#slow"), Action::click("#slower")];
        let outcome = orch.run(&task(), &actions, &CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(outcome.steps.len(), 3);
        assert!(outcome.steps[0].success);
        assert!(outcome.steps[1].success);
        assert_eq!(outcome.failed_step, Some(2));
        assert!(driver.calls("close") >= 1, "session released");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_settling_charges_last_started_step() {
        let driver = Arc::new(ScriptedDriver::permissive());
        let config = OrchestratorConfig {
            task_timeout_secs: 30,
            settle_delay_ms: 60_000,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(driver.clone(), config);
        let actions = vec![Action::click("#a"), Action::click("#b")];
        let outcome = orch.run(&task(), &actions, &CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(outcome.failed_step, Some(0));
        assert_eq!(outcome.steps.len(), 1, "unstarted step has no entry");
        assert!(outcome.steps[0].success);
        assert_eq!(driver.calls("click"), 1);
        assert!(outcome.explanation.unwrap().starts_with("step 0 (click"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_after_repaired_step() {
        let driver = Arc::new(ScriptedDriver::permissive());
        let orch = orchestrator(driver.clone(), OrchestratorConfig::default());
        let actions = vec![Action::navigate("https://example.com"), Action::click("#a"), Action::click("#b")];
        let first = orch.executor().execute(&task(), 0, &actions[0]).await.unwrap();
        let failed = TaskOutcome {
            task_id: task().task_id,
            success: false,
            steps: vec![
                first,
                StepResult::failed(1, &actions[1], ErrorKind::Structural, "element not found"),
            ],
            explanation: Some("step 1 failed".into()),
            error_kind: Some(ErrorKind::Structural),
            failed_step: Some(1),
            duration_ms: 5_000,
        };
        let repaired = orch.executor().execute(&task(), 1, &actions[1]).await.unwrap();

        let outcome = orch
            .resume(&task(), &actions, failed, repaired, &CancellationToken::new())
            .await;
        assert!(outcome.success, "{:?}", outcome.explanation);
        let indices: Vec<_> = outcome.steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert!(outcome.steps.iter().all(|s| s.success));
        assert_eq!(driver.calls("navigate"), 1, "earlier steps are not replayed");
        assert!(outcome.duration_ms >= 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_retried() {
        let driver = Arc::new(ScriptedDriver::permissive());
        driver.set_delay_once("click", Duration::from_secs(60));
        let orch = orchestrator(driver, OrchestratorConfig::default());
        let outcome = orch.run(&task(), &[Action::click("#x")], &CancellationToken::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.steps[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_before_next_step() {
        let driver = Arc::new(ScriptedDriver::permissive());
        let orch = orchestrator(driver, OrchestratorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = orch.run(&task(), &[Action::click("#x")], &cancel).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(outcome.steps.len(), 1);
    }
}
