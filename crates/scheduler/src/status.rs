//! Read-only live view of queues and the GPU lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gpu_lock::{GpuLock, LockDiagnostics};
use crate::queue::GroupSnapshot;
use crate::registry::QueueRegistry;

/// Everything a poller needs to decide whether GPU-bound work is pending.
///
/// Serializes with `group_queues` at the top level, keyed by group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub group_queues: BTreeMap<String, GroupSnapshot>,
    pub lock: LockDiagnostics,
    pub captured_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// No group has waiting or in-flight work.
    pub fn is_drained(&self) -> bool {
        self.group_queues.values().all(GroupSnapshot::is_drained)
    }

    /// Tasks strictly waiting, across all groups.
    pub fn total_pending(&self) -> usize {
        self.group_queues.values().map(|g| g.size).sum()
    }

    /// Groups with a task in flight.
    pub fn processing_groups(&self) -> Vec<&str> {
        self.group_queues
            .iter()
            .filter(|(_, g)| g.currently_processing.is_some())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn active_workers(&self) -> usize {
        self.group_queues.values().filter(|g| g.worker_active).count()
    }
}

/// Snapshots registry and lock state without blocking scheduling.
#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<QueueRegistry>,
    lock: Arc<GpuLock>,
}

impl StatusReporter {
    pub fn new(registry: Arc<QueueRegistry>, lock: Arc<GpuLock>) -> Self {
        Self { registry, lock }
    }

    pub fn get_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            group_queues: self.registry.snapshot(),
            lock: self.lock.diagnostics(),
            captured_at: Utc::now(),
        }
    }

    pub fn lock_diagnostics(&self) -> LockDiagnostics {
        self.lock.diagnostics()
    }

    pub fn group(&self, group: &str) -> Option<GroupSnapshot> {
        self.registry.group(group)
    }

    pub fn is_drained(&self) -> bool {
        self.get_snapshot().is_drained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_lock::GpuLockOptions;
    use crate::task::Task;
    use std::time::Duration;

    fn reporter() -> (Arc<QueueRegistry>, StatusReporter) {
        let registry = Arc::new(QueueRegistry::new(5));
        let lock = Arc::new(GpuLock::new(GpuLockOptions::in_process(Duration::from_secs(60))));
        (Arc::clone(&registry), StatusReporter::new(registry, lock))
    }

    #[test]
    fn empty_scheduler_is_drained() {
        let (_, reporter) = reporter();
        let snap = reporter.get_snapshot();
        assert!(snap.group_queues.is_empty());
        assert!(!snap.lock.held);
        assert!(snap.is_drained());

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["group_queues"], serde_json::json!({}));
        assert_eq!(json["lock"]["held"], false);
        assert_eq!(json["lock"]["holderId"], serde_json::Value::Null);
    }

    #[test]
    fn pending_work_is_reported() {
        let (registry, reporter) = reporter();
        registry.enqueue(Task::new("g1", "episode-1", || async { Ok(()) }));
        registry.enqueue(Task::new("g1", "episode-2", || async { Ok(()) }));
        registry.enqueue(Task::new("g2", "episode-3", || async { Ok(()) }));

        let snap = reporter.get_snapshot();
        assert_eq!(snap.total_pending(), 3);
        assert_eq!(snap.group_queues["g1"].items, vec!["episode-1", "episode-2"]);
        assert!(!snap.is_drained());
        assert!(snap.processing_groups().is_empty());

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["group_queues"]["g1"]["size"], 2);
        assert_eq!(json["group_queues"]["g2"]["worker_active"], false);
    }
}
