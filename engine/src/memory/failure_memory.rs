//! Failure memory: (domain, action type, selector) → best known fix.
//!
//! # Lookup order
//!
//! ```text
//! exact (domain, action, selector) with a fix, rate > 50, not stale
//!   └─ miss → any selector on (domain, action) with a fix, rate > 70, not stale
//!        └─ miss → no learned fix
//! ```
//!
//! Per-selector rows localize learning; the domain-wide fallback generalizes a
//! fix to unseen selectors on a site that is known to be difficult.
//!
//! Success rates are a running average over outcomes (100 for a success, 0
//! for a failure), clamped to [0, 100]. Stale rows are skipped by lookup but
//! never deleted.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::store::{LearningStore, StoreResult};
use crate::config::MemoryConfig;
use crate::types::ActionType;

/// Natural key of a [`FailureRecord`]. A missing selector is stored as `""`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureKey {
    pub domain: String,
    pub action_type: ActionType,
    pub selector: String,
}

impl FailureKey {
    pub fn new(domain: &str, action_type: ActionType, selector: Option<&str>) -> Self {
        Self {
            domain: domain.to_string(),
            action_type,
            selector: selector.unwrap_or_default().to_string(),
        }
    }
}

/// A method (and optionally a replacement selector) that made an action work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl Solution {
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            selector: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub site_domain: String,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_method: Option<String>,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,
    /// Percentage in [0, 100].
    pub success_rate: f64,
    pub times_used: u32,
    pub last_seen_at: DateTime<Utc>,
    /// Failure writes observed for this key.
    #[serde(default)]
    pub failure_count: u32,
}

impl FailureRecord {
    pub fn key(&self) -> FailureKey {
        FailureKey::new(&self.site_domain, self.action_type, self.original_selector.as_deref())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: ChronoDuration) -> bool {
        now.signed_duration_since(self.last_seen_at) > stale_after
    }
}

/// A failure observation to upsert.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub domain: String,
    pub action_type: ActionType,
    pub selector: Option<String>,
    pub original_method: Option<String>,
    pub error_type: String,
    /// Present when a fallback already resolved the failure.
    pub solution: Option<Solution>,
}

/// Result of [`FailureMemory::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedFix {
    /// Row to credit or debit once the fix has been tried.
    pub key: FailureKey,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub success_rate: f64,
    /// `true` when the row matched the selector exactly.
    pub exact: bool,
}

/// Weighted running average of a 0/100 outcome, clamped to [0, 100].
pub fn running_average(old_rate: f64, times_used: u32, outcome: f64) -> f64 {
    let n = f64::from(times_used);
    ((old_rate * n + outcome) / (n + 1.0)).clamp(0.0, 100.0)
}

#[derive(Clone)]
pub struct FailureMemory {
    store: Arc<dyn LearningStore>,
    config: MemoryConfig,
}

impl FailureMemory {
    pub fn new(store: Arc<dyn LearningStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::days(self.config.stale_after_days)
    }

    pub async fn lookup(
        &self,
        domain: &str,
        action_type: ActionType,
        selector: Option<&str>,
    ) -> StoreResult<Option<LearnedFix>> {
        let now = Utc::now();
        let stale_after = self.stale_after();
        let usable = |r: &FailureRecord, min_rate: f64| {
            r.solution.is_some() && r.success_rate > min_rate && !r.is_stale(now, stale_after)
        };

        let key = FailureKey::new(domain, action_type, selector);
        if let Some(row) = self.store.get_failure(&key).await? {
            if usable(&row, self.config.exact_min_rate) {
                return Ok(fix_from(&row, true));
            }
        }

        let best = self
            .store
            .failures_for(domain, action_type)
            .await?
            .into_iter()
            .filter(|r| usable(r, self.config.domain_min_rate))
            .max_by(|a, b| {
                a.success_rate
                    .total_cmp(&b.success_rate)
                    .then(a.times_used.cmp(&b.times_used))
            });
        Ok(best.as_ref().and_then(|r| fix_from(r, false)))
    }

    /// Upsert a failure observation. Identical reports touch the same row.
    pub async fn record_failure(&self, report: FailureReport) -> StoreResult<FailureRecord> {
        let key = FailureKey::new(&report.domain, report.action_type, report.selector.as_deref());
        let now = Utc::now();
        let record = match self.store.get_failure(&key).await? {
            Some(mut row) => {
                row.error_type = report.error_type;
                row.last_seen_at = now;
                row.failure_count = row.failure_count.saturating_add(1);
                if report.original_method.is_some() {
                    row.original_method = report.original_method;
                }
                if let Some(solution) = report.solution {
                    if row.solution.as_ref() != Some(&solution) {
                        row.solution = Some(solution);
                        row.success_rate = 100.0;
                        row.times_used = 1;
                    }
                }
                row
            }
            None => {
                let resolved = report.solution.is_some();
                FailureRecord {
                    site_domain: report.domain,
                    action_type: report.action_type,
                    original_selector: report.selector.filter(|s| !s.is_empty()),
                    original_method: report.original_method,
                    error_type: report.error_type,
                    solution: report.solution,
                    success_rate: if resolved { 100.0 } else { 0.0 },
                    times_used: u32::from(resolved),
                    last_seen_at: now,
                    failure_count: 1,
                }
            }
        };
        debug!(
            domain = %record.site_domain,
            action = %record.action_type,
            selector = record.original_selector.as_deref().unwrap_or(""),
            resolved = record.solution.is_some(),
            "failure memory upsert"
        );
        self.store.upsert_failure(record.clone()).await?;
        Ok(record)
    }

    /// Credit a learned fix that worked. Returns the new rate, if the row exists.
    pub async fn record_success(&self, key: &FailureKey) -> StoreResult<Option<f64>> {
        self.apply_outcome(key, 100.0).await
    }

    /// Debit a learned fix that was tried and failed.
    pub async fn record_solution_failed(&self, key: &FailureKey) -> StoreResult<Option<f64>> {
        self.apply_outcome(key, 0.0).await
    }

    async fn apply_outcome(&self, key: &FailureKey, outcome: f64) -> StoreResult<Option<f64>> {
        let Some(mut row) = self.store.get_failure(key).await? else {
            return Ok(None);
        };
        row.success_rate = running_average(row.success_rate, row.times_used, outcome);
        row.times_used = row.times_used.saturating_add(1);
        row.last_seen_at = Utc::now();
        let rate = row.success_rate;
        info!(
            domain = %key.domain,
            action = %key.action_type,
            selector = %key.selector,
            success_rate = rate,
            "learned fix outcome recorded"
        );
        self.store.upsert_failure(row).await?;
        Ok(Some(rate))
    }

    /// Non-stale rows for a domain, newest first.
    pub async fn recent_failures(&self, domain: &str, action_type: ActionType) -> StoreResult<Vec<FailureRecord>> {
        let now = Utc::now();
        let stale_after = self.stale_after();
        let mut rows: Vec<_> = self
            .store
            .failures_for(domain, action_type)
            .await?
            .into_iter()
            .filter(|r| !r.is_stale(now, stale_after))
            .collect();
        rows.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(rows)
    }
}

fn fix_from(row: &FailureRecord, exact: bool) -> Option<LearnedFix> {
    let solution = row.solution.as_ref()?;
    Some(LearnedFix {
        key: row.key(),
        method: solution.method.clone(),
        selector: solution.selector.clone(),
        success_rate: row.success_rate,
        exact,
    })
}
