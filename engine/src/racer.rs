//! Parallel strategy racer: JoinSet fan-out, first success wins.
//!
//! ```text
//! strategies ── order by learned weight ──▶ JoinSet::spawn × N (Semaphore-bounded)
//!                                               │
//!             first Ok ─▶ winner; shared token cancelled once
//!                                               │
//!             losers get `cancel_grace` to return, then are detached (abandoned)
//! ```
//!
//! Cancellation is cooperative: a strategy receives the shared
//! [`CancellationToken`] and must check it at its own yield points. Strategies
//! still running when the grace window closes are detached, not aborted.
//!
//! Ordering weight per strategy, recomputed every race:
//! `0.7 × success rate of its family + 0.3 × usage normalized to the most-used`,
//! where the family is the name prefix before the first `_`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RaceConfig;
use crate::error::{EngineError, ErrorKind};
use crate::memory::LearningStore;

const FAMILY_WEIGHT: f64 = 0.7;
const USAGE_WEIGHT: f64 = 0.3;

type StrategyFn<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, EngineError>> + Send>;

/// One independent approach to a goal.
pub struct ParallelStrategy<T> {
    pub id: String,
    pub name: String,
    pub estimated_duration: Duration,
    pub estimated_cost: f64,
    executor: StrategyFn<T>,
}

impl<T> ParallelStrategy<T> {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, executor: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            estimated_duration: Duration::ZERO,
            estimated_cost: 0.0,
            executor: Box::new(move |token| executor(token).boxed()),
        }
    }

    pub fn with_estimates(mut self, duration: Duration, cost: f64) -> Self {
        self.estimated_duration = duration;
        self.estimated_cost = cost;
        self
    }
}

impl<T> std::fmt::Debug for ParallelStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStrategy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("estimated_duration", &self.estimated_duration)
            .field("estimated_cost", &self.estimated_cost)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Succeeded,
    Failed,
    /// Stopped (or never started) after the shared token was cancelled.
    Cancelled,
    /// Still running when the race ended; detached.
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReport {
    pub id: String,
    pub name: String,
    pub status: StrategyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct RaceOutcome<T> {
    /// Id of the winning strategy.
    pub winning_strategy: Option<String>,
    pub value: Option<T>,
    /// One report per strategy, in input order.
    pub results: Vec<StrategyReport>,
    pub duration_ms: u64,
}

impl<T> RaceOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.winning_strategy.is_some()
    }
}

/// Where a race's history is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceScope {
    pub task_type: String,
    pub domain: String,
}

impl RaceScope {
    pub fn new(task_type: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            domain: domain.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RaceStatKey {
    pub task_type: String,
    pub domain: String,
    pub strategy_name: String,
}

/// Per-strategy race history under a (task type, domain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceStat {
    pub task_type: String,
    pub domain: String,
    pub strategy_name: String,
    pub runs: u32,
    pub wins: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_won_at: Option<DateTime<Utc>>,
}

impl RaceStat {
    pub fn key(&self) -> RaceStatKey {
        RaceStatKey {
            task_type: self.task_type.clone(),
            domain: self.domain.clone(),
            strategy_name: self.strategy_name.clone(),
        }
    }
}

fn family(name: &str) -> &str {
    name.split('_').next().unwrap_or(name)
}

/// `0.7 × family win rate + 0.3 × normalized usage`, in [0, 1].
pub fn strategy_weight(name: &str, stats: &[RaceStat]) -> f64 {
    let fam = family(name);
    let (wins, runs) = stats
        .iter()
        .filter(|s| family(&s.strategy_name) == fam)
        .fold((0u64, 0u64), |(w, r), s| (w + u64::from(s.wins), r + u64::from(s.runs)));
    let family_rate = if runs == 0 { 0.0 } else { wins as f64 / runs as f64 };

    let max_runs = stats.iter().map(|s| s.runs).max().unwrap_or(0);
    let own_runs = stats
        .iter()
        .find(|s| s.strategy_name == name)
        .map(|s| s.runs)
        .unwrap_or(0);
    let usage = if max_runs == 0 {
        0.0
    } else {
        f64::from(own_runs) / f64::from(max_runs)
    };

    (FAMILY_WEIGHT * family_rate + USAGE_WEIGHT * usage).clamp(0.0, 1.0)
}

enum Finish<T> {
    Ran(Result<T, EngineError>),
    /// Cancelled while waiting for a concurrency slot.
    NotStarted,
}

pub struct ParallelStrategyRacer {
    config: RaceConfig,
    store: Option<Arc<dyn LearningStore>>,
}

impl ParallelStrategyRacer {
    pub fn new(config: RaceConfig) -> Self {
        Self { config, store: None }
    }

    pub fn with_store(mut self, store: Arc<dyn LearningStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn history(&self, scope: Option<&RaceScope>) -> Vec<RaceStat> {
        let (Some(store), Some(scope)) = (&self.store, scope) else {
            return Vec::new();
        };
        match store.race_stats(&scope.task_type, &scope.domain).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "race history unavailable, keeping input order");
                Vec::new()
            }
        }
    }

    /// Strategies sorted by descending weight; ties keep input order.
    pub async fn order<T>(&self, scope: Option<&RaceScope>, strategies: Vec<ParallelStrategy<T>>) -> Vec<ParallelStrategy<T>> {
        let stats = self.history(scope).await;
        if stats.is_empty() {
            return strategies;
        }
        let mut weighted: Vec<(f64, ParallelStrategy<T>)> = strategies
            .into_iter()
            .map(|s| (strategy_weight(&s.name, &stats), s))
            .collect();
        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        weighted.into_iter().map(|(_, s)| s).collect()
    }

    pub async fn race<T: Send + 'static>(
        &self,
        scope: Option<&RaceScope>,
        strategies: Vec<ParallelStrategy<T>>,
        parent: &CancellationToken,
    ) -> RaceOutcome<T> {
        let started = Instant::now();
        let strategies = self.order(scope, strategies).await;
        let token = parent.child_token();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        let mut reports: Vec<StrategyReport> = strategies
            .iter()
            .map(|s| StrategyReport {
                id: s.id.clone(),
                name: s.name.clone(),
                status: StrategyStatus::Abandoned,
                error: None,
                duration_ms: 0,
            })
            .collect();

        let mut join_set: JoinSet<(usize, Finish<T>, Duration)> = JoinSet::new();
        // Maps a panicked task back to its report.
        let mut slots: HashMap<Id, usize> = HashMap::new();
        for (idx, strategy) in strategies.into_iter().enumerate() {
            let sem = sem.clone();
            let token = token.clone();
            let handle = join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (idx, Finish::NotStarted, Duration::ZERO);
                };
                let start = Instant::now();
                let result = (strategy.executor)(token).await;
                (idx, Finish::Ran(result), start.elapsed())
            });
            slots.insert(handle.id(), idx);
        }

        let mut winner: Option<(usize, T)> = None;
        let mut draining = false;
        let mut deadline = started + Duration::from_millis(self.config.grace_window_ms);
        let cancel_grace = Duration::from_millis(self.config.cancel_grace_ms);

        loop {
            let joined = match tokio::time::timeout_at(deadline, join_set.join_next_with_id()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    if draining {
                        break;
                    }
                    warn!(pending = join_set.len(), "race grace window elapsed without a winner");
                    token.cancel();
                    draining = true;
                    deadline = Instant::now() + cancel_grace;
                    continue;
                }
            };
            let (idx, finish, elapsed) = match joined {
                Ok((_, done)) => done,
                Err(e) => {
                    if let Some(&idx) = slots.get(&e.id()) {
                        let report = &mut reports[idx];
                        report.status = StrategyStatus::Failed;
                        report.error = Some(format!("strategy task died: {e}"));
                        warn!(strategy = %report.id, error = %e, "strategy task panicked");
                    }
                    continue;
                }
            };
            let report = &mut reports[idx];
            report.duration_ms = elapsed.as_millis() as u64;
            match finish {
                Finish::Ran(Ok(value)) if !draining => {
                    report.status = StrategyStatus::Succeeded;
                    info!(strategy = %report.id, name = %report.name, elapsed_ms = report.duration_ms, "race winner");
                    winner = Some((idx, value));
                    token.cancel();
                    draining = true;
                    deadline = Instant::now() + cancel_grace;
                }
                Finish::Ran(Ok(_)) => {
                    debug!(strategy = %report.id, "late success discarded");
                    report.status = StrategyStatus::Cancelled;
                }
                Finish::Ran(Err(e)) => {
                    report.status = if draining || e.kind() == ErrorKind::Cancelled {
                        StrategyStatus::Cancelled
                    } else {
                        StrategyStatus::Failed
                    };
                    debug!(strategy = %report.id, status = ?report.status, error = %e, "strategy finished");
                    report.error = Some(e.to_string());
                }
                Finish::NotStarted => report.status = StrategyStatus::Cancelled,
            }
        }

        if !join_set.is_empty() {
            warn!(abandoned = join_set.len(), "detaching strategies that ignored cancellation");
            join_set.detach_all();
        }

        let (winning_strategy, value) = match winner {
            Some((idx, value)) => (Some(reports[idx].id.clone()), Some(value)),
            None => (None, None),
        };
        if let Some(scope) = scope {
            self.persist(scope, &reports).await;
        }
        RaceOutcome {
            winning_strategy,
            value,
            results: reports,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn persist(&self, scope: &RaceScope, reports: &[StrategyReport]) {
        let Some(store) = &self.store else {
            return;
        };
        let existing = self.history(Some(scope)).await;
        for report in reports {
            let mut stat = existing
                .iter()
                .find(|s| s.strategy_name == report.name)
                .cloned()
                .unwrap_or_else(|| RaceStat {
                    task_type: scope.task_type.clone(),
                    domain: scope.domain.clone(),
                    strategy_name: report.name.clone(),
                    runs: 0,
                    wins: 0,
                    last_won_at: None,
                });
            stat.runs = stat.runs.saturating_add(1);
            if report.status == StrategyStatus::Succeeded {
                stat.wins = stat.wins.saturating_add(1);
                stat.last_won_at = Some(Utc::now());
            }
            if let Err(e) = store.upsert_race_stat(stat).await {
                warn!(strategy = %report.name, error = %e, "could not persist race stat");
            }
        }
    }
}
