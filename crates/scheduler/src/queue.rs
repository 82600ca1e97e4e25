//! Per-group FIFO of pending tasks.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::task::{Task, TaskId, TaskRecord, TaskStatus};

/// Identifier handed to a worker when it claims a group.
pub type WorkerId = u64;

/// Per-group lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounters {
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Point-in-time view of one group, as served by the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    /// Tasks strictly waiting. Excludes the one being processed.
    pub size: usize,
    pub worker_active: bool,
    pub currently_processing: Option<TaskId>,
    pub currently_processing_name: Option<String>,
    /// Names of waiting tasks, head first.
    pub items: Vec<String>,
    pub last_error: Option<String>,
    pub counters: GroupCounters,
    /// Most recent terminal tasks, newest last.
    pub recent: Vec<TaskRecord>,
}

impl GroupSnapshot {
    /// Nothing waiting and nothing running.
    pub fn is_drained(&self) -> bool {
        self.size == 0 && self.currently_processing.is_none()
    }
}

/// Ordered queue for one partition key.
///
/// A task lives in exactly one of `pending` or `current`. `current` is only
/// set while a worker owns the group.
#[derive(Debug)]
pub struct GroupQueue {
    group_key: String,
    pending: VecDeque<Task>,
    current: Option<TaskRecord>,
    worker: Option<WorkerId>,
    last_error: Option<String>,
    history: VecDeque<TaskRecord>,
    history_limit: usize,
    counters: GroupCounters,
    notify: Arc<Notify>,
}

impl GroupQueue {
    pub fn new(group_key: impl Into<String>, history_limit: usize) -> Self {
        Self {
            group_key: group_key.into(),
            pending: VecDeque::new(),
            current: None,
            worker: None,
            last_error: None,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            counters: GroupCounters::default(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Append a task. Returns its 1-based position counting the task in flight.
    pub fn push(&mut self, task: Task) -> usize {
        self.pending.push_back(task);
        self.counters.enqueued += 1;
        // Stores a permit if the worker is not parked yet, so no wakeup is lost.
        self.notify.notify_one();
        self.pending.len() + usize::from(self.current.is_some())
    }

    /// Pop the head task and mark it in flight. The caller must own the group.
    pub fn begin_next(&mut self) -> Option<Task> {
        debug_assert!(self.worker.is_some(), "dequeue without an active worker");
        debug_assert!(self.current.is_none(), "dequeue while a task is in flight");
        let task = self.pending.pop_front()?;
        self.current = Some(task.record().clone());
        Some(task)
    }

    /// Refresh the in-flight record (e.g. after it moved to Processing).
    pub fn update_current(&mut self, record: &TaskRecord) {
        if let Some(current) = self.current.as_mut() {
            if current.id == record.id {
                *current = record.clone();
            }
        }
    }

    /// Clear the in-flight slot and file the terminal record.
    pub fn complete(&mut self, record: TaskRecord) {
        if self.current.as_ref().map(|c| c.id) == Some(record.id) {
            self.current = None;
        }
        match record.status {
            TaskStatus::Succeeded => self.counters.succeeded += 1,
            TaskStatus::Failed => self.counters.failed += 1,
            TaskStatus::TimedOut => self.counters.timed_out += 1,
            TaskStatus::Queued | TaskStatus::Processing => {}
        }
        if let Some(err) = &record.error {
            self.last_error = Some(format!("{}: {}", record.name, err));
        }
        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn current(&self) -> Option<&TaskRecord> {
        self.current.as_ref()
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    pub fn worker_active(&self) -> bool {
        self.worker.is_some()
    }

    pub(crate) fn set_worker(&mut self, worker: Option<WorkerId>) {
        debug_assert!(
            worker.is_some() || self.current.is_none(),
            "worker released with a task in flight"
        );
        self.worker = worker;
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            size: self.pending.len(),
            worker_active: self.worker.is_some(),
            currently_processing: self.current.as_ref().map(|r| r.id),
            currently_processing_name: self.current.as_ref().map(|r| r.name.clone()),
            items: self.pending.iter().map(|t| t.name().to_string()).collect(),
            last_error: self.last_error.clone(),
            counters: self.counters,
            recent: self.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOutcome;

    fn task(name: &str) -> Task {
        Task::new("default", name, || async { Ok(()) })
    }

    #[test]
    fn positions_count_in_flight_task() {
        let mut q = GroupQueue::new("default", 5);
        q.set_worker(Some(1));
        assert_eq!(q.push(task("a")), 1);
        assert_eq!(q.push(task("b")), 2);

        let a = q.begin_next().unwrap();
        assert_eq!(a.name(), "a");
        // a in flight + b waiting -> c lands at 3
        assert_eq!(q.push(task("c")), 3);
        assert_eq!(q.pending_count(), 2);
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = GroupQueue::new("default", 5);
        q.set_worker(Some(1));
        for name in ["a", "b", "c"] {
            q.push(task(name));
        }
        let mut order = Vec::new();
        while let Some(mut t) = q.begin_next() {
            order.push(t.name().to_string());
            t.mark_processing().unwrap();
            let record = t.finish(&TaskOutcome::Succeeded).unwrap();
            q.complete(record);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(q.snapshot().counters.succeeded, 3);
    }

    #[test]
    fn task_never_both_pending_and_current() {
        let mut q = GroupQueue::new("g", 5);
        q.set_worker(Some(7));
        q.push(task("a"));
        q.push(task("b"));
        let a = q.begin_next().unwrap();

        let snap = q.snapshot();
        assert_eq!(snap.size, 1);
        assert_eq!(snap.items, vec!["b"]);
        assert_eq!(snap.currently_processing, Some(a.id()));
        assert_eq!(snap.currently_processing_name.as_deref(), Some("a"));
        assert!(!snap.is_drained());
    }

    #[test]
    fn failure_sets_last_error_and_history_is_bounded() {
        let mut q = GroupQueue::new("g", 2);
        q.set_worker(Some(1));
        for (name, outcome) in [
            ("a", TaskOutcome::Succeeded),
            ("b", TaskOutcome::Failed("graph write failed".into())),
            ("c", TaskOutcome::TimedOut("exceeded 1s".into())),
        ] {
            q.push(task(name));
            let mut t = q.begin_next().unwrap();
            t.mark_processing().unwrap();
            q.complete(t.finish(&outcome).unwrap());
        }

        let snap = q.snapshot();
        assert_eq!(snap.recent.len(), 2);
        assert_eq!(snap.recent[0].name, "b");
        assert_eq!(snap.recent[1].name, "c");
        assert_eq!(snap.last_error.as_deref(), Some("c: exceeded 1s"));
        assert_eq!(snap.counters.failed, 1);
        assert_eq!(snap.counters.timed_out, 1);
        assert!(snap.is_drained());
    }

    #[test]
    fn empty_queue_snapshot() {
        let q = GroupQueue::new("g", 1);
        let snap = q.snapshot();
        assert_eq!(snap.size, 0);
        assert!(!snap.worker_active);
        assert!(snap.currently_processing.is_none());
        assert!(snap.is_drained());
    }
}
