//! Three-stage post-execution verification.
//!
//! ```text
//! 1. self-check   text scan for success / error indicators
//! 2. evidence     regex proof (confirmation ids) or success-shaped URL
//!    composite    0.3·self + 0.3·evidence + 0.4·action rate   (rate known)
//!                 0.55·self + 0.45·evidence                    (otherwise)
//!    composite ≥ 95 → pass, stop
//!    composite < 50 → wait 2s, re-run stages 1–2 once
//! 3. smart review vision judge, when composite < 90 and the task needs a
//!                 screenshot, or always for financial tasks
//! ```
//!
//! The final verdict is `composite ≥ 70` unless the judge ran and answered,
//! in which case its `success` decides. The judge's confidence is reported
//! and checked against the tier target but does not gate the pass. Correction hints are emitted on every
//! path so the next attempt (and verification learning) can use them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::profile::{profile_for, QualityTier, TaskProfile};
use crate::config::VerificationConfig;
use crate::driver::AutomationDriver;
use crate::error::EngineError;
use crate::resilience::ResilientExecutor;
use crate::services::{AiJudge, JudgeContext};

/// Breaker resource key for the vision judge.
pub const JUDGE_RESOURCE: &str = "ai_judge";

const SNIFF_CONFIDENCE: f64 = 60.0;
const EXCERPT_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    SelfCheck,
    Evidence,
    SmartReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageScore {
    pub stage: VerificationMethod,
    pub confidence: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    /// Composite score, or the judge's confidence when the judge decided.
    pub confidence: f64,
    /// Deepest stage that produced the verdict.
    pub method: VerificationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub correction_hints: Vec<String>,
    pub stages: Vec<StageScore>,
    pub composite: f64,
    pub tier: QualityTier,
    /// Whether the aspirational tier target was reached.
    pub meets_tier_target: bool,
    pub rechecked: bool,
}

impl VerificationResult {
    pub fn stage(&self, stage: VerificationMethod) -> Option<&StageScore> {
        self.stages.iter().rev().find(|s| s.stage == stage)
    }
}

/// What the pipeline looks at.
#[derive(Debug, Clone, Default)]
pub struct VerificationInput {
    pub task_type: String,
    pub domain: String,
    pub page_text: String,
    pub url: Option<String>,
    pub screenshot_ref: Option<String>,
    /// Percentage of successful steps, when steps ran.
    pub action_success_rate: Option<f64>,
    pub expected_outcome: Option<String>,
    pub known_issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SelfCheck {
    pub score: f64,
    pub passed: bool,
    pub successes: Vec<&'static str>,
    pub errors: Vec<&'static str>,
}

pub fn self_check(profile: &TaskProfile, text: &str) -> SelfCheck {
    let lower = text.to_lowercase();
    let successes: Vec<_> = profile
        .success_indicators
        .iter()
        .copied()
        .filter(|p| lower.contains(p))
        .collect();
    let errors: Vec<_> = profile
        .error_indicators
        .iter()
        .copied()
        .filter(|p| lower.contains(p))
        .collect();
    let (score, passed) = match (successes.len(), errors.len()) {
        (0, 0) => (30.0, false),
        (0, _) => (20.0, false),
        (s, 0) => ((50.0 + 15.0 * s as f64).min(95.0), true),
        (s, e) => (40.0, s > e),
    };
    SelfCheck {
        score,
        passed,
        successes,
        errors,
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceCheck {
    pub score: f64,
    pub passed: bool,
    pub evidence: Option<String>,
}

pub fn evidence_check(profile: &TaskProfile, text: &str, url: Option<&str>) -> EvidenceCheck {
    for re in profile.evidence_patterns {
        if let Some(m) = re.find(text) {
            return EvidenceCheck {
                score: 95.0,
                passed: true,
                evidence: Some(m.as_str().trim().to_string()),
            };
        }
    }
    if let Some(url) = url {
        let lower = url.to_lowercase();
        if let Some(fragment) = profile.success_url_fragments.iter().find(|f| lower.contains(*f)) {
            return EvidenceCheck {
                score: 90.0,
                passed: true,
                evidence: Some(format!("url contains '{fragment}'")),
            };
        }
    }
    EvidenceCheck {
        score: 20.0,
        passed: false,
        evidence: None,
    }
}

/// Weighted blend of the first two stages and the action success rate.
pub fn composite_score(self_score: f64, evidence_score: f64, action_success_rate: Option<f64>) -> f64 {
    let score = match action_success_rate {
        Some(rate) => 0.3 * self_score + 0.3 * evidence_score + 0.4 * rate.clamp(0.0, 100.0),
        None => 0.55 * self_score + 0.45 * evidence_score,
    };
    score.clamp(0.0, 100.0)
}

/// Stages 1–2 and the composite, without delays or the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub task_type: String,
    pub tier: QualityTier,
    pub self_check: StageScore,
    pub evidence: StageScore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_text: Option<String>,
    pub composite: f64,
    pub passed: bool,
    pub correction_hints: Vec<String>,
}

pub fn score_snapshot(
    config: &VerificationConfig,
    task_type: &str,
    text: &str,
    url: Option<&str>,
    action_success_rate: Option<f64>,
) -> Snapshot {
    let profile = profile_for(task_type);
    let sc = self_check(&profile, text);
    let ev = evidence_check(&profile, text, url);
    let composite = composite_score(sc.score, ev.score, action_success_rate);
    let mut hints = Vec::new();
    collect_hints(config, &profile, &sc, &ev, action_success_rate, &mut hints);
    Snapshot {
        task_type: profile.task_type.to_string(),
        tier: profile.tier,
        self_check: StageScore {
            stage: VerificationMethod::SelfCheck,
            confidence: sc.score,
            passed: sc.passed,
        },
        evidence: StageScore {
            stage: VerificationMethod::Evidence,
            confidence: ev.score,
            passed: ev.passed,
        },
        evidence_text: ev.evidence,
        composite,
        passed: composite >= config.pass_threshold,
        correction_hints: hints,
    }
}

fn collect_hints(
    config: &VerificationConfig,
    profile: &TaskProfile,
    sc: &SelfCheck,
    ev: &EvidenceCheck,
    action_success_rate: Option<f64>,
    hints: &mut Vec<String>,
) {
    for phrase in &sc.errors {
        push_unique(hints, format!("page shows error: \"{phrase}\""));
    }
    if ev.evidence.is_none() {
        push_unique(hints, format!("no evidence found for {}", profile.task_type));
    }
    if let Some(rate) = action_success_rate {
        if rate < config.low_action_rate {
            push_unique(
                hints,
                format!("low action success rate ({rate:.0}%): earlier steps may not have taken effect"),
            );
        }
    }
}

fn push_unique(hints: &mut Vec<String>, hint: String) {
    if !hints.contains(&hint) {
        hints.push(hint);
    }
}

/// Parsed judge verdict.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JudgeVerdict {
    pub success: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Pull `{success, confidence, reason}` out of a judge reply, falling back to
/// keyword sniffing at fixed confidence when the reply is not JSON.
pub fn parse_judge_reply(reply: &str) -> JudgeVerdict {
    if let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) {
        if start < end {
            if let Ok(mut verdict) = serde_json::from_str::<JudgeVerdict>(&reply[start..=end]) {
                // Some models answer on a 0–1 scale.
                if verdict.confidence > 0.0 && verdict.confidence <= 1.0 {
                    verdict.confidence *= 100.0;
                }
                verdict.confidence = verdict.confidence.clamp(0.0, 100.0);
                return verdict;
            }
        }
    }
    let lower = reply.to_lowercase();
    let negative = ["fail", "not complete", "unsuccessful", "error", "did not", "no evidence"]
        .iter()
        .any(|w| lower.contains(w));
    let positive = ["success", "completed", "confirmed", "passed", "done"]
        .iter()
        .any(|w| lower.contains(w));
    JudgeVerdict {
        success: positive && !negative,
        confidence: SNIFF_CONFIDENCE,
        reason: Some("judge reply was not structured; keyword fallback".to_string()),
    }
}

pub struct VerificationPipeline {
    config: VerificationConfig,
    judge: Option<Arc<dyn AiJudge>>,
    resilience: ResilientExecutor,
}

impl VerificationPipeline {
    pub fn new(config: VerificationConfig, resilience: ResilientExecutor) -> Self {
        Self {
            config,
            judge: None,
            resilience,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn AiJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Run the pipeline. With a driver, a low composite re-reads the page
    /// after the re-check delay and a missing screenshot is captured for the
    /// judge.
    pub async fn verify(&self, mut input: VerificationInput, driver: Option<&dyn AutomationDriver>) -> VerificationResult {
        let profile = profile_for(&input.task_type);
        let target = profile.tier.target();
        let mut stages = Vec::new();

        let (mut sc, mut ev, mut composite) = self.score(&profile, &input, &mut stages);
        let mut rechecked = false;
        if composite < self.config.recheck_threshold {
            if let Some(driver) = driver {
                debug!(composite, "low composite, re-checking after delay");
                tokio::time::sleep(Duration::from_millis(self.config.recheck_delay_ms)).await;
                if let Ok(text) = driver.text_content().await {
                    input.page_text = text;
                }
                if let Ok(url) = driver.current_url().await {
                    input.url = Some(url);
                }
                (sc, ev, composite) = self.score(&profile, &input, &mut stages);
                rechecked = true;
            }
        }

        let mut hints = Vec::new();
        collect_hints(&self.config, &profile, &sc, &ev, input.action_success_rate, &mut hints);

        let mut passed = composite >= self.config.pass_threshold;
        let mut confidence = composite;
        let mut method = if ev.passed {
            VerificationMethod::Evidence
        } else {
            VerificationMethod::SelfCheck
        };

        let short_circuit = composite >= self.config.short_circuit_threshold && !target.always_vision;
        let wants_review = target.always_vision
            || (!short_circuit && composite < self.config.vision_threshold && profile.requires_screenshot);
        if wants_review {
            match self.smart_review(&profile, &input, driver).await {
                Ok(verdict) => {
                    info!(
                        task_type = profile.task_type,
                        success = verdict.success,
                        confidence = verdict.confidence,
                        "smart review verdict"
                    );
                    stages.push(StageScore {
                        stage: VerificationMethod::SmartReview,
                        confidence: verdict.confidence,
                        passed: verdict.success,
                    });
                    passed = verdict.success;
                    confidence = verdict.confidence;
                    method = VerificationMethod::SmartReview;
                    if !verdict.success {
                        if let Some(reason) = verdict.reason {
                            push_unique(&mut hints, format!("visual review: {reason}"));
                        }
                    }
                }
                Err(e) => {
                    warn!(task_type = profile.task_type, error = %e, "smart review unavailable, using composite");
                    push_unique(&mut hints, format!("visual review unavailable: {e}"));
                }
            }
        }

        let meets_tier_target = passed && confidence >= target.confidence;
        if !meets_tier_target {
            push_unique(
                &mut hints,
                format!(
                    "confidence {confidence:.0} below {} target {:.0}",
                    profile.tier, target.confidence
                ),
            );
        }
        info!(
            task_type = profile.task_type,
            domain = %input.domain,
            self_check = sc.score,
            evidence = ev.score,
            composite,
            passed,
            "verification complete"
        );

        VerificationResult {
            passed,
            confidence: confidence.clamp(0.0, 100.0),
            method,
            evidence: ev.evidence,
            correction_hints: hints,
            stages,
            composite,
            tier: profile.tier,
            meets_tier_target,
            rechecked,
        }
    }

    fn score(
        &self,
        profile: &TaskProfile,
        input: &VerificationInput,
        stages: &mut Vec<StageScore>,
    ) -> (SelfCheck, EvidenceCheck, f64) {
        let sc = self_check(profile, &input.page_text);
        let ev = evidence_check(profile, &input.page_text, input.url.as_deref());
        let composite = composite_score(sc.score, ev.score, input.action_success_rate);
        debug!(
            self_check = sc.score,
            evidence = ev.score,
            composite,
            "verification stages 1-2"
        );
        stages.push(StageScore {
            stage: VerificationMethod::SelfCheck,
            confidence: sc.score,
            passed: sc.passed,
        });
        stages.push(StageScore {
            stage: VerificationMethod::Evidence,
            confidence: ev.score,
            passed: ev.passed,
        });
        (sc, ev, composite)
    }

    async fn smart_review(
        &self,
        profile: &TaskProfile,
        input: &VerificationInput,
        driver: Option<&dyn AutomationDriver>,
    ) -> Result<JudgeVerdict, EngineError> {
        let judge = self
            .judge
            .clone()
            .ok_or_else(|| EngineError::Configuration("no AI judge configured".into()))?;
        let screenshot = match (&input.screenshot_ref, driver) {
            (Some(shot), _) => shot.clone(),
            (None, Some(driver)) => driver.screenshot().await?,
            (None, None) => return Err(EngineError::Transient("no screenshot available".into())),
        };
        let context = JudgeContext {
            task_type: profile.task_type.to_string(),
            domain: input.domain.clone(),
            expected_outcome: input.expected_outcome.clone(),
            page_excerpt: input.page_text.chars().take(EXCERPT_CHARS).collect(),
            current_url: input.url.clone(),
            known_issues: input.known_issues.clone(),
        };
        let budget = Duration::from_secs(self.config.judge_timeout_secs);

        let reply = self
            .resilience
            .execute(JUDGE_RESOURCE, "smart_review", |_| {
                let judge = judge.clone();
                let context = context.clone();
                let screenshot = screenshot.clone();
                async move {
                    match tokio::time::timeout(budget, judge.judge(&screenshot, &context)).await {
                        Ok(reply) => reply,
                        Err(_) => Err(EngineError::Timeout {
                            label: "ai_judge".to_string(),
                            elapsed_ms: budget.as_millis() as u64,
                        }),
                    }
                }
            })
            .await?;
        Ok(parse_judge_reply(&reply))
    }
}
