//! Access log retention.
//!
//! [`RetentionPruner`] deletes mirrored log entries older than the retention
//! window, one delete per entry. Entries without a timestamp are never
//! pruned. A failed delete is logged and the sweep moves on.
//!
//! The pruner remembers which ids it already deleted (or is deleting) and
//! skips them until the log mirror stops listing them, so two runs before
//! the deletion echo arrives still delete each entry once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{now_millis, Collection, CollectionPath, LogEntry};
use crate::store::RemoteStore;
use crate::sync::Mirrors;

/// Outcome of one prune run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Entries older than the cutoff that this run tried to delete
    pub selected: usize,
    /// Deletes that succeeded
    pub deleted: usize,
    /// Deletes that failed
    pub failed: usize,
}

/// Enforces the rolling retention window on the access log
pub struct RetentionPruner {
    store: Arc<dyn RemoteStore>,
    mirrors: Arc<Mirrors>,
    retention: Duration,
    pruned: Mutex<HashSet<String>>,
}

impl RetentionPruner {
    /// Create a pruner over the log mirror in `mirrors`
    pub fn new(store: Arc<dyn RemoteStore>, mirrors: Arc<Mirrors>, retention: Duration) -> Self {
        Self {
            store,
            mirrors,
            retention,
            pruned: Mutex::new(HashSet::new()),
        }
    }

    /// Retention window
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Delete every mirrored entry older than now minus the retention window.
    pub async fn prune_old_logs(&self) -> Result<PruneReport> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        self.prune_before(now_millis().saturating_sub(retention_ms))
            .await
    }

    /// Delete every mirrored entry with a timestamp strictly before `cutoff_ms`.
    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<PruneReport> {
        let principal = self.mirrors.principal().ok_or(Error::NoPrincipal)?;
        let path = CollectionPath::new(&principal, Collection::AccessLogs);
        let logs = self.mirrors.logs();

        let selected: Vec<String> = {
            let mut pruned = self.pruned.lock();
            // Forget ids the store has confirmed gone
            pruned.retain(|id| logs.iter().any(|entry| entry.id == *id));

            let selected: Vec<String> = logs
                .iter()
                .filter(|entry| is_expired(entry, cutoff_ms))
                .filter(|entry| !pruned.contains(&entry.id))
                .map(|entry| entry.id.clone())
                .collect();
            pruned.extend(selected.iter().cloned());
            selected
        };

        let mut report = PruneReport {
            selected: selected.len(),
            ..PruneReport::default()
        };

        for id in selected {
            match self.store.delete(&path, &id).await {
                Ok(()) => {
                    debug!(id = %id, "Pruned log entry");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to prune log entry");
                    self.pruned.lock().remove(&id);
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 {
            info!(deleted = report.deleted, failed = report.failed, "Pruned old access log entries");
        }
        Ok(report)
    }

    /// Forget every remembered deletion.
    pub fn reset(&self) {
        self.pruned.lock().clear();
    }
}

/// Whether `entry` falls outside the retention window ending at `cutoff_ms`
#[must_use]
pub fn is_expired(entry: &LogEntry, cutoff_ms: i64) -> bool {
    entry.timestamp.is_some_and(|ts| ts < cutoff_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogType, Principal};
    use crate::store::{Fault, FaultOp, MemoryStore};
    use crate::sync::Synchronizer;
    use serde_json::json;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn entry(timestamp: Option<i64>) -> LogEntry {
        LogEntry {
            id: "x".to_string(),
            kind: LogType::System,
            detail: String::new(),
            timestamp,
        }
    }

    #[test]
    fn test_expiry_predicate() {
        assert!(is_expired(&entry(Some(99)), 100));
        assert!(!is_expired(&entry(Some(100)), 100));
        assert!(!is_expired(&entry(None), 100));
    }

    async fn setup(timestamps: &[Option<i64>]) -> (Arc<MemoryStore>, Synchronizer, CollectionPath) {
        let store = Arc::new(MemoryStore::new());
        let principal = Principal::new("owner").unwrap();
        let path = CollectionPath::new(&principal, Collection::AccessLogs);
        for ts in timestamps {
            store
                .push(&path, json!({"type": "SYSTEM", "detail": "", "timestamp": ts}))
                .await
                .unwrap();
        }

        let sync = Synchronizer::new(store.clone());
        sync.attach(Some(&principal)).await;
        let mirrors = sync.mirrors();
        let mut changes = mirrors.changes();
        let expected = timestamps.len();
        tokio::time::timeout(Duration::from_secs(5), async {
            while mirrors.logs().len() != expected {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        (store, sync, path)
    }

    #[tokio::test]
    async fn test_prune_deletes_only_old_dated_entries() {
        let now = now_millis();
        let (store, sync, path) =
            setup(&[Some(now - 31 * DAY_MS), Some(now - DAY_MS), None, Some(now - 60 * DAY_MS)]).await;
        let pruner = RetentionPruner::new(store.clone(), sync.mirrors(), Duration::from_secs(30 * 86_400));

        let report = pruner.prune_old_logs().await.unwrap();
        assert_eq!(report, PruneReport { selected: 2, deleted: 2, failed: 0 });
        assert_eq!(store.snapshot(&path).len(), 2);
        assert_eq!(store.mutation_count(FaultOp::Delete, Collection::AccessLogs), 2);
    }

    #[tokio::test]
    async fn test_second_run_deletes_nothing() {
        let now = now_millis();
        let (store, sync, _) = setup(&[Some(now - 40 * DAY_MS), Some(now - 50 * DAY_MS)]).await;
        let pruner = RetentionPruner::new(store.clone(), sync.mirrors(), Duration::from_secs(30 * 86_400));

        assert_eq!(pruner.prune_old_logs().await.unwrap().deleted, 2);
        // Runs straight away, whether or not the echo has reached the mirror
        assert_eq!(pruner.prune_old_logs().await.unwrap().selected, 0);
        assert_eq!(store.mutation_count(FaultOp::Delete, Collection::AccessLogs), 2);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_abort_sweep() {
        let (store, sync, path) = setup(&[Some(1), Some(2), Some(3)]).await;
        let pruner = RetentionPruner::new(store.clone(), sync.mirrors(), Duration::ZERO);
        store.inject_fault(Fault::on(FaultOp::Delete, Collection::AccessLogs));

        let report = pruner.prune_before(10).await.unwrap();
        assert_eq!(report, PruneReport { selected: 3, deleted: 2, failed: 1 });
        assert_eq!(store.snapshot(&path).len(), 1);

        // The failed entry is retried on the next run
        let report = pruner.prune_before(10).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.snapshot(&path).is_empty());
    }

    #[tokio::test]
    async fn test_prune_requires_principal() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let pruner = RetentionPruner::new(store, sync.mirrors(), Duration::ZERO);
        assert!(matches!(pruner.prune_before(10).await, Err(Error::NoPrincipal)));
    }
}
