//! Task engine facade: runs a task through execution, verification,
//! diagnosis, and learning.
//!
//! ```text
//! known-issues preamble ─▶ attempt 1..=tier.max_attempts
//!                            ├─ orchestrator.run(actions)
//!                            │    └─ structural failure → diagnoser.auto_fix
//!                            │         └─ fixed → orchestrator.resume (same attempt)
//!                            ├─ verifier.verify(page)
//!                            └─ hints → next attempt; outcome credits or debits
//!                               the hints the attempt was given
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::diagnoser::{
    DebugHypothesis, DiagnosisInput, FailureContext, FailureDiagnoser, FixReport, StepFixApplier,
};
use crate::driver::AutomationDriver;
use crate::error::ErrorKind;
use crate::executor::ActionExecutor;
use crate::memory::{
    hint_class, known_issues_preamble, FailureMemory, LearningStore, VerificationLearningStore,
};
use crate::orchestrator::StepOrchestrator;
use crate::racer::{ParallelStrategy, ParallelStrategyRacer, RaceOutcome, RaceScope};
use crate::resilience::{BreakerRegistry, CircuitSnapshot, ResilientExecutor, RetryPolicy};
use crate::services::{AiJudge, AuditLogger, CapabilityValidator, CredentialVault};
use crate::types::{Action, TaskContext, TaskOutcome};
use crate::verifier::{profile_for, QualityTier, VerificationInput, VerificationPipeline, VerificationResult};

/// Everything a caller learns about one task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub success: bool,
    pub tier: QualityTier,
    pub attempts: u32,
    /// Step log of the final attempt.
    pub outcome: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// Hints produced by the final attempt.
    pub correction_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<DebugHypothesis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

pub struct TaskEngineBuilder {
    config: EngineConfig,
    driver: Arc<dyn AutomationDriver>,
    store: Arc<dyn LearningStore>,
    validator: Option<Arc<dyn CapabilityValidator>>,
    vault: Option<Arc<dyn CredentialVault>>,
    audit: Option<Arc<dyn AuditLogger>>,
    judge: Option<Arc<dyn AiJudge>>,
}

impl TaskEngineBuilder {
    pub fn validator(mut self, validator: Arc<dyn CapabilityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn judge(mut self, judge: Arc<dyn AiJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn build(self) -> Result<TaskEngine, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let memory = FailureMemory::new(self.store.clone(), config.memory.clone());
        let learning = VerificationLearningStore::new(self.store.clone(), config.memory.clone());

        let mut executor = ActionExecutor::new(self.driver, memory.clone());
        if let Some(v) = self.validator {
            executor = executor.with_validator(v);
        }
        if let Some(v) = self.vault {
            executor = executor.with_vault(v);
        }
        if let Some(a) = self.audit {
            executor = executor.with_audit(a);
        }
        let executor = Arc::new(executor);

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let resilience = ResilientExecutor::new(RetryPolicy::from(&config.retry), breakers.clone());
        let mut verifier = VerificationPipeline::new(config.verification.clone(), resilience);
        if let Some(judge) = self.judge {
            verifier = verifier.with_judge(judge);
        }

        Ok(TaskEngine {
            orchestrator: StepOrchestrator::new(executor.clone(), config.orchestrator.clone()),
            racer: ParallelStrategyRacer::new(config.race.clone()).with_store(self.store),
            diagnoser: FailureDiagnoser::new(memory, learning.clone()),
            executor,
            verifier,
            learning,
            breakers,
            config,
        })
    }
}

pub struct TaskEngine {
    config: EngineConfig,
    executor: Arc<ActionExecutor>,
    orchestrator: StepOrchestrator,
    verifier: VerificationPipeline,
    learning: VerificationLearningStore,
    diagnoser: FailureDiagnoser,
    racer: ParallelStrategyRacer,
    breakers: Arc<BreakerRegistry>,
}

impl TaskEngine {
    pub fn builder(
        config: EngineConfig,
        driver: Arc<dyn AutomationDriver>,
        store: Arc<dyn LearningStore>,
    ) -> TaskEngineBuilder {
        TaskEngineBuilder {
            config,
            driver,
            store,
            validator: None,
            vault: None,
            audit: None,
            judge: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn orchestrator(&self) -> &StepOrchestrator {
        &self.orchestrator
    }

    pub fn verifier(&self) -> &VerificationPipeline {
        &self.verifier
    }

    pub fn diagnoser(&self) -> &FailureDiagnoser {
        &self.diagnoser
    }

    pub fn learning(&self) -> &VerificationLearningStore {
        &self.learning
    }

    pub fn breaker_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshot()
    }

    /// Race strategies for one goal, reordered and scored by past races on
    /// the same task type and domain.
    pub async fn race<T: Send + 'static>(
        &self,
        scope: &RaceScope,
        strategies: Vec<ParallelStrategy<T>>,
        cancel: &CancellationToken,
    ) -> RaceOutcome<T> {
        self.racer.race(Some(scope), strategies, cancel).await
    }

    /// Run `actions` until the result verifies or the tier's attempt budget
    /// is spent. Never returns `Err`; failures carry the step log and hints.
    pub async fn run_task(
        &self,
        mut task: TaskContext,
        actions: &[Action],
        cancel: &CancellationToken,
    ) -> TaskReport {
        let profile = profile_for(&task.task_type);
        let max_attempts = profile.tier.target().max_attempts.max(1);

        let known = match self.learning.known_corrections(&task.domain, &task.task_type).await {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "known corrections unavailable");
                Vec::new()
            }
        };
        let known_issues: Vec<String> = known.iter().map(|k| k.hint.clone()).collect();
        task.known_issues = known_issues_preamble(&known);
        if task.known_issues.is_some() {
            info!(task_id = %task.task_id, hints = known.len(), "injected known issues");
        }

        // Hints the current attempt was given; credited or debited by its result.
        let mut applied: Vec<String> = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            task.correction_hints = applied.clone();
            debug!(task_id = %task.task_id, attempt, max_attempts, "task attempt");
            let mut outcome = self.orchestrator.run(&task, actions, cancel).await;

            let mut hints = Vec::new();
            let mut hypotheses = Vec::new();
            let mut unrepaired = None;
            // A repaired step resumes the same attempt; each resume starts past
            // the repaired step, so this ends.
            while !outcome.success && outcome.error_kind == Some(ErrorKind::Structural) {
                let Some(report) = self.diagnose(&task, actions, &outcome).await else {
                    break;
                };
                hypotheses = report.hypotheses;
                match report.result {
                    Some(repaired) if report.fixed => {
                        info!(task_id = %task.task_id, attempt, message = %report.message, "step repaired, resuming");
                        outcome = self
                            .orchestrator
                            .resume(&task, actions, outcome, repaired, cancel)
                            .await;
                    }
                    _ => {
                        unrepaired = Some(report.message);
                        break;
                    }
                }
            }

            let mut verification = None;
            let mut explanation = outcome.explanation.clone();

            if outcome.success {
                let result = self.verify(&task, actions, &outcome, &known_issues).await;
                if result.passed {
                    self.settle_hints(&task, &applied, true).await;
                    info!(
                        task_id = %task.task_id,
                        attempt,
                        confidence = result.confidence,
                        "task verified"
                    );
                    return TaskReport {
                        task_id: task.task_id.clone(),
                        success: true,
                        tier: profile.tier,
                        attempts: attempt,
                        outcome,
                        correction_hints: result.correction_hints.clone(),
                        verification: Some(result),
                        hypotheses,
                        explanation: None,
                    };
                }
                explanation = Some(format!(
                    "verification failed at confidence {:.0}",
                    result.confidence
                ));
                hints.extend(result.correction_hints.iter().cloned());
                verification = Some(result);
            } else {
                if let Some(text) = &outcome.explanation {
                    hints.push(text.clone());
                }
                hints.extend(unrepaired);
            }
            self.settle_hints(&task, &applied, false).await;

            let terminal = matches!(
                outcome.error_kind,
                Some(ErrorKind::Blocked | ErrorKind::Cancelled | ErrorKind::CircuitOpen)
            );
            if terminal || attempt >= max_attempts {
                warn!(
                    task_id = %task.task_id,
                    attempts = attempt,
                    terminal,
                    "task did not succeed"
                );
                return TaskReport {
                    task_id: task.task_id.clone(),
                    success: false,
                    tier: profile.tier,
                    attempts: attempt,
                    outcome,
                    verification,
                    correction_hints: hints,
                    hypotheses,
                    explanation,
                };
            }
            applied = hints;
        }
    }

    async fn verify(
        &self,
        task: &TaskContext,
        actions: &[Action],
        outcome: &TaskOutcome,
        known_issues: &[String],
    ) -> VerificationResult {
        let driver = self.executor.driver();
        let page_text = match driver.text_content().await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "could not read page text for verification");
                String::new()
            }
        };
        let url = driver.current_url().await.ok();
        let input = VerificationInput {
            task_type: task.task_type.clone(),
            domain: task.domain.clone(),
            page_text,
            url,
            screenshot_ref: outcome.steps.iter().rev().find_map(|s| s.screenshot_ref.clone()),
            action_success_rate: outcome.action_success_rate(),
            expected_outcome: actions.iter().rev().find_map(|a| a.expected_outcome.clone()),
            known_issues: known_issues.to_vec(),
        };
        self.verifier.verify(input, Some(driver.as_ref())).await
    }

    /// Diagnose and try to repair the failed step.
    async fn diagnose(&self, task: &TaskContext, actions: &[Action], outcome: &TaskOutcome) -> Option<FixReport> {
        let step_index = outcome.failed_step?;
        let action = actions.get(step_index)?.clone();
        let step = outcome.steps.iter().find(|s| s.step_index == step_index);
        let credential_expired = match self.executor.vault().get(&task.user_id, &task.domain).await {
            Ok(Some(cred)) => cred.expired,
            _ => false,
        };
        let ctx = FailureContext {
            task: task.clone(),
            step_index,
            action,
            input: DiagnosisInput {
                error: step
                    .and_then(|s| s.error.clone())
                    .or_else(|| outcome.explanation.clone())
                    .unwrap_or_default(),
                attempts: step.map(|s| s.attempts).unwrap_or(1),
                credential_expired,
                prior_failures: 0,
            },
        };
        let applier = StepFixApplier::new(&self.executor);
        Some(self.diagnoser.auto_fix(&ctx, &applier).await)
    }

    /// Credit or debit each hint class the attempt was given, once.
    async fn settle_hints(&self, task: &TaskContext, hints: &[String], helped: bool) {
        let classes: BTreeSet<String> = hints.iter().map(|h| hint_class(h)).collect();
        for hint in &classes {
            if let Err(e) = self
                .learning
                .record_correction(&task.domain, &task.task_type, hint, helped)
                .await
            {
                warn!(error = %e, "could not record correction outcome");
            }
        }
    }
}
