//! Task model: one unit of graph-mutating work and its lifecycle.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::TaskError;

/// Unique task identifier.
pub type TaskId = Uuid;

/// Future produced by a task callback.
pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

/// The external work behind a task. Called at most once, by the worker.
pub type TaskPayload = Box<dyn FnOnce() -> TaskFuture + Send>;

/// Task lifecycle state.
///
/// Transitions are strictly `Queued -> Processing -> {Succeeded | Failed | TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Processing) => true,
            (Self::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Serializable view of a task: everything except the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub group_key: String,
    /// Human-readable episode name, used in status output and logs.
    pub name: String,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskRecord {
    fn new(group_key: String, name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_key,
            name,
            status: TaskStatus::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Move to `next`, stamping `started_at` / `finished_at` as reached.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        let now = Utc::now();
        if next == TaskStatus::Processing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Wall time spent processing, once finished.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Outcome of running one task, as decided by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
    TimedOut(String),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded => TaskStatus::Succeeded,
            Self::Failed(_) => TaskStatus::Failed,
            Self::TimedOut(_) => TaskStatus::TimedOut,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Failed(e) | Self::TimedOut(e) => Some(e),
        }
    }
}

/// A queued unit of work: its record, callback and completion channel.
pub struct Task {
    record: TaskRecord,
    payload: Option<TaskPayload>,
    completion: Option<oneshot::Sender<TaskRecord>>,
}

impl Task {
    /// Create a task whose work is the future returned by `work`.
    pub fn new<F, Fut>(group_key: impl Into<String>, name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            record: TaskRecord::new(group_key.into(), name.into()),
            payload: Some(Box::new(move || work().boxed())),
            completion: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn group_key(&self) -> &str {
        &self.record.group_key
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn status(&self) -> TaskStatus {
        self.record.status
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Register interest in the terminal record. Replaces any earlier listener.
    pub(crate) fn completion_channel(&mut self) -> oneshot::Receiver<TaskRecord> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Detach the listener so it can be notified after bookkeeping is done.
    pub(crate) fn take_completion(&mut self) -> Option<oneshot::Sender<TaskRecord>> {
        self.completion.take()
    }

    pub(crate) fn mark_processing(&mut self) -> Result<(), InvalidTransition> {
        self.record.transition(TaskStatus::Processing)
    }

    pub(crate) fn take_payload(&mut self) -> Option<TaskPayload> {
        self.payload.take()
    }

    /// Apply the terminal outcome and notify any listener.
    pub(crate) fn finish(mut self, outcome: &TaskOutcome) -> Result<TaskRecord, InvalidTransition> {
        self.record.transition(outcome.status())?;
        self.record.error = outcome.error().map(str::to_string);
        if let Some(tx) = self.completion.take() {
            // Listener may have stopped caring; that is fine.
            let _ = tx.send(self.record.clone());
        }
        Ok(self.record)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("record", &self.record)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(group: &str, name: &str) -> Task {
        Task::new(group, name, || async { Ok(()) })
    }

    #[test]
    fn new_task_is_queued() {
        let task = noop("default", "a");
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.group_key(), "default");
        assert_eq!(task.name(), "a");
        assert!(task.record().started_at.is_none());
        assert!(task.record().finished_at.is_none());
    }

    #[test]
    fn transitions_never_regress() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Succeeded));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(TimedOut));

        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Processing.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!TimedOut.can_transition_to(Queued));
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut task = noop("g", "t");
        task.mark_processing().unwrap();
        assert!(task.record().started_at.is_some());
        assert!(task.mark_processing().is_err(), "second start must be rejected");

        let record = task.finish(&TaskOutcome::Failed("boom".into())).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.finished_at.is_some());
        assert!(record.processing_time().is_some());
    }

    #[test]
    fn finish_without_start_is_rejected() {
        let task = noop("g", "t");
        let err = task.finish(&TaskOutcome::Succeeded).unwrap_err();
        assert_eq!(err.from, TaskStatus::Queued);
        assert_eq!(err.to, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn finish_notifies_listener() {
        let mut task = noop("g", "t");
        let rx = task.completion_channel();
        task.mark_processing().unwrap();
        task.finish(&TaskOutcome::TimedOut("exceeded 1s".into())).unwrap();

        let record = rx.await.unwrap();
        assert_eq!(record.status, TaskStatus::TimedOut);
        assert_eq!(record.error.as_deref(), Some("exceeded 1s"));
    }

    #[tokio::test]
    async fn payload_runs_once() {
        let mut task = Task::new("g", "t", || async { Err(TaskError::from("nope")) });
        let payload = task.take_payload().unwrap();
        assert!(task.take_payload().is_none());
        assert_eq!(payload().await, Err(TaskError::Failed("nope".into())));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
