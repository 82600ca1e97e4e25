//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the scheduler, the GPU lock and status sources.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("GPU lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("GPU lock file error: {0}")]
    LockIo(#[from] std::io::Error),

    #[error("GPU lock file corrupt: {0}")]
    LockCorrupt(String),

    #[error("scheduler is shutting down")]
    Shutdown,

    #[error("scheduler must be created inside a tokio runtime")]
    NoRuntime,

    #[error("invalid scheduler options: {0}")]
    InvalidOptions(String),

    #[error("status unavailable: {0}")]
    Status(String),

    #[error("gatekeeper gave up after {0:?} with work still queued")]
    GateTimeout(Duration),
}

/// Error returned by a task callback, or recorded when one misbehaves.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", err))
    }
}

impl From<String> for TaskError {
    fn from(msg: String) -> Self {
        TaskError::Failed(msg)
    }
}

impl From<&str> for TaskError {
    fn from(msg: &str) -> Self {
        TaskError::Failed(msg.to_string())
    }
}
