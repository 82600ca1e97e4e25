//! Group key -> queue mapping behind a single synchronization boundary.
//!
//! Queue contents, the in-flight slot and the worker-active flag for every
//! group are guarded by one mutex, so a snapshot can never see a worker flag
//! that disagrees with its queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::queue::{GroupQueue, GroupSnapshot, WorkerId};
use crate::task::{Task, TaskRecord};

/// A worker touched a group it does not own. Two consumers for one key
/// breaks per-group ordering, so callers treat this as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("group '{group}' is owned by worker {owner:?}, not worker {caller}")]
pub struct RegistryRace {
    pub group: String,
    pub owner: Option<WorkerId>,
    pub caller: WorkerId,
}

/// Result of asking for the next task.
pub enum Dequeue {
    /// Head task, now in flight.
    Task(Task),
    /// Queue is empty; await the notifier before asking again.
    Empty(Arc<Notify>),
}

pub struct QueueRegistry {
    groups: Mutex<HashMap<String, GroupQueue>>,
    history_limit: usize,
    next_worker_id: AtomicU64,
}

impl QueueRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            history_limit,
            next_worker_id: AtomicU64::new(1),
        }
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, GroupQueue>> {
        // Critical sections never panic midway; recover the data if one did.
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `task` to its group's queue, creating the group on first use.
    /// Returns the 1-based position including any in-flight task. Never blocks
    /// beyond the registry mutex.
    pub fn enqueue(&self, task: Task) -> usize {
        let key = task.group_key().to_string();
        let mut groups = self.groups();
        let queue = groups
            .entry(key.clone())
            .or_insert_with(|| GroupQueue::new(key.clone(), self.history_limit));
        let position = queue.push(task);
        debug!(group = %key, position, "task enqueued");
        position
    }

    /// Single-flight worker claim. Returns a fresh worker id only when the
    /// group had no active worker; concurrent callers get exactly one `Some`.
    pub fn claim_worker(&self, group: &str) -> Option<WorkerId> {
        let mut groups = self.groups();
        let queue = groups
            .entry(group.to_string())
            .or_insert_with(|| GroupQueue::new(group, self.history_limit));
        if queue.worker_active() {
            return None;
        }
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        queue.set_worker(Some(id));
        Some(id)
    }

    /// Pop the head of `group` for its owning worker.
    pub fn next_task(&self, group: &str, worker: WorkerId) -> Result<Dequeue, RegistryRace> {
        let mut groups = self.groups();
        let queue = Self::owned(&mut groups, group, worker)?;
        Ok(match queue.begin_next() {
            Some(task) => Dequeue::Task(task),
            None => Dequeue::Empty(queue.notifier()),
        })
    }

    /// Publish a status change of the in-flight task.
    pub fn update_current(&self, group: &str, record: &TaskRecord) {
        if let Some(queue) = self.groups().get_mut(group) {
            queue.update_current(record);
        }
    }

    /// File the terminal record and free the in-flight slot.
    pub fn complete(
        &self,
        group: &str,
        worker: WorkerId,
        record: TaskRecord,
    ) -> Result<(), RegistryRace> {
        let mut groups = self.groups();
        let queue = Self::owned(&mut groups, group, worker)?;
        queue.complete(record);
        Ok(())
    }

    /// Active -> Idle, but only if nothing arrived in the meantime. Done under
    /// the same lock as `enqueue`, so a concurrent producer either lands before
    /// (and the worker keeps going) or sees the group idle and respawns.
    pub fn release_if_idle(&self, group: &str, worker: WorkerId) -> Result<bool, RegistryRace> {
        let mut groups = self.groups();
        let queue = Self::owned(&mut groups, group, worker)?;
        if !queue.is_empty() || queue.current().is_some() {
            return Ok(false);
        }
        queue.set_worker(None);
        Ok(true)
    }

    /// Unconditionally hand the group back (shutdown path).
    pub fn release_worker(&self, group: &str, worker: WorkerId) {
        if let Some(queue) = self.groups().get_mut(group) {
            if queue.worker() == Some(worker) && queue.current().is_none() {
                queue.set_worker(None);
            }
        }
    }

    /// Consistent copy of every group, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, GroupSnapshot> {
        self.groups()
            .iter()
            .map(|(key, queue)| (key.clone(), queue.snapshot()))
            .collect()
    }

    pub fn group(&self, group: &str) -> Option<GroupSnapshot> {
        self.groups().get(group).map(GroupQueue::snapshot)
    }

    /// Groups that currently have pending work but no worker.
    pub fn orphaned_groups(&self) -> Vec<String> {
        self.groups()
            .values()
            .filter(|q| !q.worker_active() && !q.is_empty())
            .map(|q| q.group_key().to_string())
            .collect()
    }

    fn owned<'a>(
        groups: &'a mut HashMap<String, GroupQueue>,
        group: &str,
        worker: WorkerId,
    ) -> Result<&'a mut GroupQueue, RegistryRace> {
        match groups.get_mut(group) {
            Some(queue) if queue.worker() == Some(worker) => Ok(queue),
            other => Err(RegistryRace {
                group: group.to_string(),
                owner: other.and_then(|q| q.worker()),
                caller: worker,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOutcome;

    fn task(group: &str, name: &str) -> Task {
        Task::new(group, name, || async { Ok(()) })
    }

    #[test]
    fn groups_created_lazily() {
        let registry = QueueRegistry::new(10);
        assert!(registry.snapshot().is_empty());

        assert_eq!(registry.enqueue(task("g1", "a")), 1);
        assert_eq!(registry.enqueue(task("g2", "b")), 1);
        assert_eq!(registry.enqueue(task("g1", "c")), 2);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["g1"].size, 2);
        assert_eq!(snap["g2"].size, 1);
        assert!(!snap["g1"].worker_active);
    }

    #[test]
    fn claim_is_single_flight() {
        let registry = QueueRegistry::new(10);
        let first = registry.claim_worker("g");
        assert!(first.is_some());
        assert!(registry.claim_worker("g").is_none());
        assert!(registry.claim_worker("other").is_some());
    }

    #[test]
    fn concurrent_claims_yield_one_worker() {
        let registry = Arc::new(QueueRegistry::new(10));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.claim_worker("hot").is_some())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn foreign_worker_is_rejected() {
        let registry = QueueRegistry::new(10);
        registry.enqueue(task("g", "a"));
        let owner = registry.claim_worker("g").unwrap();

        let err = match registry.next_task("g", owner + 100) {
            Err(e) => e,
            Ok(_) => panic!("foreign worker must not dequeue"),
        };
        assert_eq!(err.owner, Some(owner));
        assert_eq!(err.caller, owner + 100);
    }

    #[test]
    fn dequeue_complete_cycle() {
        let registry = QueueRegistry::new(10);
        registry.enqueue(task("g", "a"));
        let worker = registry.claim_worker("g").unwrap();

        let mut a = match registry.next_task("g", worker).unwrap() {
            Dequeue::Task(t) => t,
            Dequeue::Empty(_) => panic!("expected a task"),
        };
        a.mark_processing().unwrap();
        registry.update_current("g", a.record());
        let snap = registry.group("g").unwrap();
        assert_eq!(snap.size, 0);
        assert_eq!(snap.currently_processing, Some(a.id()));

        // Not idle while a task is in flight.
        assert!(!registry.release_if_idle("g", worker).unwrap());

        let record = a.finish(&TaskOutcome::Succeeded).unwrap();
        registry.complete("g", worker, record).unwrap();
        assert!(matches!(registry.next_task("g", worker), Ok(Dequeue::Empty(_))));
        assert!(registry.release_if_idle("g", worker).unwrap());
        assert!(!registry.group("g").unwrap().worker_active);
    }

    #[test]
    fn release_if_idle_refuses_when_work_arrived() {
        let registry = QueueRegistry::new(10);
        let worker = registry.claim_worker("g").unwrap();
        registry.enqueue(task("g", "late"));
        assert!(!registry.release_if_idle("g", worker).unwrap());
        assert!(registry.group("g").unwrap().worker_active);
    }

    #[test]
    fn orphaned_groups_listed() {
        let registry = QueueRegistry::new(10);
        registry.enqueue(task("lonely", "a"));
        assert_eq!(registry.orphaned_groups(), vec!["lonely".to_string()]);
        registry.claim_worker("lonely");
        assert!(registry.orphaned_groups().is_empty());
    }
}
