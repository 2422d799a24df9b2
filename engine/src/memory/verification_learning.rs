//! Correction hints that fixed failed verifications, per (domain, task type).
//!
//! Before a task's first attempt the engine asks for known corrections:
//! domain rows are preferred; when the domain has none that qualify, hints for
//! the same task type are aggregated across every domain under a stricter bar.
//!
//! Hints are learned by class, not by exact text: free-standing numbers
//! (timings, scores, counts) are replaced with `<n>` so repeated failures of
//! the same kind land on one row.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::{LearningStore, StoreResult};
use crate::config::MemoryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LearningKey {
    pub domain: String,
    pub task_type: String,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationLearning {
    pub domain: String,
    pub task_type: String,
    pub correction_hint: String,
    /// `times_helped / times_applied` as a percentage.
    pub success_rate: f64,
    pub times_applied: u32,
    pub times_helped: u32,
    pub last_applied_at: DateTime<Utc>,
}

impl VerificationLearning {
    pub fn key(&self) -> LearningKey {
        LearningKey {
            domain: self.domain.clone(),
            task_type: self.task_type.clone(),
            hint: self.correction_hint.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintScope {
    Domain,
    /// Aggregated over every domain for the task type.
    CrossDomain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownCorrection {
    pub hint: String,
    pub success_rate: f64,
    pub observations: u32,
    pub scope: HintScope,
}

static VOLATILE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_#.\-])[0-9]+(?:\.[0-9]+)?").expect("VOLATILE_NUMBER_RE regex should compile")
});

/// Learning key for a hint. Numbers inside identifiers such as `#item-3`
/// are kept.
pub fn hint_class(hint: &str) -> String {
    VOLATILE_NUMBER_RE
        .replace_all(hint.trim(), "${1}<n>")
        .into_owned()
}

fn rate(helped: u32, applied: u32) -> f64 {
    if applied == 0 {
        return 0.0;
    }
    (f64::from(helped) * 100.0 / f64::from(applied)).clamp(0.0, 100.0)
}

#[derive(Clone)]
pub struct VerificationLearningStore {
    store: Arc<dyn LearningStore>,
    config: MemoryConfig,
}

impl VerificationLearningStore {
    pub fn new(store: Arc<dyn LearningStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    /// Count one application of `hint`'s class; `helped` when the attempt it
    /// was applied to then passed verification.
    pub async fn record_correction(
        &self,
        domain: &str,
        task_type: &str,
        hint: &str,
        helped: bool,
    ) -> StoreResult<VerificationLearning> {
        let key = LearningKey {
            domain: domain.to_string(),
            task_type: task_type.to_string(),
            hint: hint_class(hint),
        };
        let mut row = self.store.get_learning(&key).await?.unwrap_or_else(|| VerificationLearning {
            domain: key.domain.clone(),
            task_type: key.task_type.clone(),
            correction_hint: key.hint.clone(),
            success_rate: 0.0,
            times_applied: 0,
            times_helped: 0,
            last_applied_at: Utc::now(),
        });
        row.times_applied = row.times_applied.saturating_add(1);
        if helped {
            row.times_helped = row.times_helped.saturating_add(1);
        }
        row.success_rate = rate(row.times_helped, row.times_applied);
        row.last_applied_at = Utc::now();
        debug!(
            domain,
            task_type,
            hint = %key.hint,
            helped,
            success_rate = row.success_rate,
            "verification learning updated"
        );
        self.store.upsert_learning(row.clone()).await?;
        Ok(row)
    }

    pub async fn known_corrections(&self, domain: &str, task_type: &str) -> StoreResult<Vec<KnownCorrection>> {
        let rows = self.store.learnings_for_task_type(task_type).await?;
        let limit = self.config.max_known_issues;

        let mut local: Vec<KnownCorrection> = rows
            .iter()
            .filter(|r| r.domain == domain)
            .filter(|r| {
                r.success_rate >= self.config.learning_domain_min_rate
                    && r.times_applied >= self.config.learning_domain_min_observations
            })
            .map(|r| KnownCorrection {
                hint: r.correction_hint.clone(),
                success_rate: r.success_rate,
                observations: r.times_applied,
                scope: HintScope::Domain,
            })
            .collect();
        if !local.is_empty() {
            sort_and_truncate(&mut local, limit);
            return Ok(local);
        }

        let mut totals: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
        for r in &rows {
            let entry = totals.entry(r.correction_hint.as_str()).or_default();
            entry.0 = entry.0.saturating_add(r.times_helped);
            entry.1 = entry.1.saturating_add(r.times_applied);
        }
        let mut global: Vec<KnownCorrection> = totals
            .into_iter()
            .map(|(hint, (helped, applied))| KnownCorrection {
                hint: hint.to_string(),
                success_rate: rate(helped, applied),
                observations: applied,
                scope: HintScope::CrossDomain,
            })
            .filter(|c| {
                c.success_rate >= self.config.learning_global_min_rate
                    && c.observations >= self.config.learning_global_min_observations
            })
            .collect();
        sort_and_truncate(&mut global, limit);
        Ok(global)
    }

    /// Known corrections rendered as a preamble, or `None` when there are none.
    pub async fn preamble_for(&self, domain: &str, task_type: &str) -> StoreResult<Option<String>> {
        let known = self.known_corrections(domain, task_type).await?;
        Ok(known_issues_preamble(&known))
    }
}

fn sort_and_truncate(list: &mut Vec<KnownCorrection>, limit: usize) {
    list.sort_by(|a, b| {
        b.success_rate
            .total_cmp(&a.success_rate)
            .then(b.observations.cmp(&a.observations))
            .then(a.hint.cmp(&b.hint))
    });
    list.truncate(limit);
}

/// Bullet list injected before the first attempt.
pub fn known_issues_preamble(known: &[KnownCorrection]) -> Option<String> {
    if known.is_empty() {
        return None;
    }
    let mut out = String::from("Known issues from previous runs:\n");
    for k in known {
        let source = match k.scope {
            HintScope::Domain => "this site",
            HintScope::CrossDomain => "similar sites",
        };
        out.push_str(&format!(
            "- {} (helped {:.0}% of {} attempts on {})\n",
            k.hint, k.success_rate, k.observations, source
        ));
    }
    Some(out)
}
