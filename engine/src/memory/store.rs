//! Learning datastore abstraction.
//!
//! Rows are statistical aggregates keyed by a natural key, so concurrent
//! same-key upserts from different tasks are last-writer-wins and no
//! cross-task locking is needed.
//!
//! - [`InMemoryLearningStore`]: process-local maps, used by tests and as the default.
//! - [`JsonFileLearningStore`]: the same maps snapshotted to a JSON file on every write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::failure_memory::{FailureKey, FailureRecord};
use super::verification_learning::{LearningKey, VerificationLearning};
use crate::racer::{RaceStat, RaceStatKey};
use crate::types::ActionType;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn get_failure(&self, key: &FailureKey) -> StoreResult<Option<FailureRecord>>;

    /// All rows for a domain and action type, any selector.
    async fn failures_for(&self, domain: &str, action_type: ActionType) -> StoreResult<Vec<FailureRecord>>;

    async fn upsert_failure(&self, record: FailureRecord) -> StoreResult<()>;

    async fn all_failures(&self) -> StoreResult<Vec<FailureRecord>>;

    async fn get_learning(&self, key: &LearningKey) -> StoreResult<Option<VerificationLearning>>;

    /// All rows for a task type, any domain.
    async fn learnings_for_task_type(&self, task_type: &str) -> StoreResult<Vec<VerificationLearning>>;

    async fn upsert_learning(&self, row: VerificationLearning) -> StoreResult<()>;

    async fn race_stats(&self, task_type: &str, domain: &str) -> StoreResult<Vec<RaceStat>>;

    async fn upsert_race_stat(&self, stat: RaceStat) -> StoreResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    failures: Vec<FailureRecord>,
    #[serde(default)]
    learnings: Vec<VerificationLearning>,
    #[serde(default)]
    race_stats: Vec<RaceStat>,
}

#[derive(Debug, Default)]
pub struct InMemoryLearningStore {
    failures: RwLock<HashMap<FailureKey, FailureRecord>>,
    learnings: RwLock<HashMap<LearningKey, VerificationLearning>>,
    race_stats: RwLock<HashMap<RaceStatKey, RaceStat>>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        {
            let mut failures = write(&store.failures);
            for r in snapshot.failures {
                failures.insert(r.key(), r);
            }
            let mut learnings = write(&store.learnings);
            for l in snapshot.learnings {
                learnings.insert(l.key(), l);
            }
            let mut stats = write(&store.race_stats);
            for s in snapshot.race_stats {
                stats.insert(s.key(), s);
            }
        }
        store
    }

    fn snapshot(&self) -> Snapshot {
        let mut failures: Vec<_> = read(&self.failures).values().cloned().collect();
        failures.sort_by(|a, b| {
            (&a.site_domain, a.action_type.as_str(), &a.original_selector)
                .cmp(&(&b.site_domain, b.action_type.as_str(), &b.original_selector))
        });
        let mut learnings: Vec<_> = read(&self.learnings).values().cloned().collect();
        learnings.sort_by(|a, b| {
            (&a.domain, &a.task_type, &a.correction_hint).cmp(&(&b.domain, &b.task_type, &b.correction_hint))
        });
        let mut race_stats: Vec<_> = read(&self.race_stats).values().cloned().collect();
        race_stats.sort_by(|a, b| {
            (&a.task_type, &a.domain, &a.strategy_name).cmp(&(&b.task_type, &b.domain, &b.strategy_name))
        });
        Snapshot {
            failures,
            learnings,
            race_stats,
        }
    }

    pub fn failure_count(&self) -> usize {
        read(&self.failures).len()
    }

    pub fn learning_count(&self) -> usize {
        read(&self.learnings).len()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LearningStore for InMemoryLearningStore {
    async fn get_failure(&self, key: &FailureKey) -> StoreResult<Option<FailureRecord>> {
        Ok(read(&self.failures).get(key).cloned())
    }

    async fn failures_for(&self, domain: &str, action_type: ActionType) -> StoreResult<Vec<FailureRecord>> {
        Ok(read(&self.failures)
            .values()
            .filter(|r| r.site_domain == domain && r.action_type == action_type)
            .cloned()
            .collect())
    }

    async fn upsert_failure(&self, record: FailureRecord) -> StoreResult<()> {
        write(&self.failures).insert(record.key(), record);
        Ok(())
    }

    async fn all_failures(&self) -> StoreResult<Vec<FailureRecord>> {
        Ok(self.snapshot().failures)
    }

    async fn get_learning(&self, key: &LearningKey) -> StoreResult<Option<VerificationLearning>> {
        Ok(read(&self.learnings).get(key).cloned())
    }

    async fn learnings_for_task_type(&self, task_type: &str) -> StoreResult<Vec<VerificationLearning>> {
        Ok(read(&self.learnings)
            .values()
            .filter(|l| l.task_type == task_type)
            .cloned()
            .collect())
    }

    async fn upsert_learning(&self, row: VerificationLearning) -> StoreResult<()> {
        write(&self.learnings).insert(row.key(), row);
        Ok(())
    }

    async fn race_stats(&self, task_type: &str, domain: &str) -> StoreResult<Vec<RaceStat>> {
        Ok(read(&self.race_stats)
            .values()
            .filter(|s| s.task_type == task_type && s.domain == domain)
            .cloned()
            .collect())
    }

    async fn upsert_race_stat(&self, stat: RaceStat) -> StoreResult<()> {
        write(&self.race_stats).insert(stat.key(), stat);
        Ok(())
    }
}

/// [`InMemoryLearningStore`] persisted as a JSON snapshot after every write.
///
/// Writes go to a sibling temp file and are renamed into place, so a crash
/// mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonFileLearningStore {
    path: PathBuf,
    inner: InMemoryLearningStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileLearningStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Snapshot::default(),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };
        debug!(
            path = %path.display(),
            failures = snapshot.failures.len(),
            learnings = snapshot.learnings.len(),
            "opened learning store"
        );
        Ok(Self {
            path,
            inner: InMemoryLearningStore::from_snapshot(snapshot),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_string_pretty(&self.inner.snapshot())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl LearningStore for JsonFileLearningStore {
    async fn get_failure(&self, key: &FailureKey) -> StoreResult<Option<FailureRecord>> {
        self.inner.get_failure(key).await
    }

    async fn failures_for(&self, domain: &str, action_type: ActionType) -> StoreResult<Vec<FailureRecord>> {
        self.inner.failures_for(domain, action_type).await
    }

    async fn upsert_failure(&self, record: FailureRecord) -> StoreResult<()> {
        self.inner.upsert_failure(record).await?;
        self.persist().await
    }

    async fn all_failures(&self) -> StoreResult<Vec<FailureRecord>> {
        self.inner.all_failures().await
    }

    async fn get_learning(&self, key: &LearningKey) -> StoreResult<Option<VerificationLearning>> {
        self.inner.get_learning(key).await
    }

    async fn learnings_for_task_type(&self, task_type: &str) -> StoreResult<Vec<VerificationLearning>> {
        self.inner.learnings_for_task_type(task_type).await
    }

    async fn upsert_learning(&self, row: VerificationLearning) -> StoreResult<()> {
        self.inner.upsert_learning(row).await?;
        self.persist().await
    }

    async fn race_stats(&self, task_type: &str, domain: &str) -> StoreResult<Vec<RaceStat>> {
        self.inner.race_stats(task_type, domain).await
    }

    async fn upsert_race_stat(&self, stat: RaceStat) -> StoreResult<()> {
        self.inner.upsert_race_stat(stat).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(domain: &str, selector: &str) -> FailureRecord {
        FailureRecord {
            site_domain: domain.to_string(),
            action_type: ActionType::Click,
            original_selector: Some(selector.to_string()),
            original_method: Some("click_css".to_string()),
            error_type: "not_found".to_string(),
            solution: None,
            success_rate: 0.0,
            times_used: 0,
            last_seen_at: Utc::now(),
            failure_count: 1,
        }
    }

    #[tokio::test]
    async fn test_in_memory_upsert_replaces_same_key() {
        let store = InMemoryLearningStore::new();
        store.upsert_failure(record("example.com", "#a")).await.unwrap();
        store.upsert_failure(record("example.com", "#a")).await.unwrap();
        store.upsert_failure(record("example.com", "#b")).await.unwrap();
        assert_eq!(store.failure_count(), 2);
        let rows = store.failures_for("example.com", ActionType::Click).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.failures_for("example.com", ActionType::Fill).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        {
            let store = JsonFileLearningStore::open(&path).unwrap();
            store.upsert_failure(record("shop.test", "#buy")).await.unwrap();
        }
        let reopened = JsonFileLearningStore::open(&path).unwrap();
        let key = FailureKey::new("shop.test", ActionType::Click, Some("#buy"));
        let row = reopened.get_failure(&key).await.unwrap().unwrap();
        assert_eq!(row.error_type, "not_found");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileLearningStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
