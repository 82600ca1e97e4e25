use std::future::Future;
use std::sync::Arc;

use episodic_core::Config;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::info;

use crate::error::{SchedulerError, TaskError};
use crate::gpu_lock::{GpuLock, GpuLockOptions};
use crate::registry::QueueRegistry;
use crate::status::{StatusReporter, StatusSnapshot};
use crate::supervisor::{WorkerOptions, WorkerSupervisor};
use crate::task::{Task, TaskId, TaskRecord};

/// Producer-facing entry point: owns the registry, the supervisor and the
/// GPU lock, and hands out status reporters.
pub struct Scheduler {
    registry: Arc<QueueRegistry>,
    lock: Arc<GpuLock>,
    supervisor: Arc<WorkerSupervisor>,
}

impl Scheduler {
    /// Build from configuration. Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self, SchedulerError> {
        Self::with_options(
            GpuLockOptions::from(&config.lock),
            WorkerOptions::from(&config.scheduler),
            config.scheduler.history_limit,
        )
    }

    pub fn with_options(
        lock: GpuLockOptions,
        workers: WorkerOptions,
        history_limit: usize,
    ) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        info!(
            ttl_secs = lock.ttl.as_secs(),
            lock_file = ?lock.lease_file,
            task_timeout_secs = workers.task_timeout.as_secs(),
            "scheduler starting"
        );
        Self::with_lock(Arc::new(GpuLock::new(lock)), workers, history_limit, runtime)
    }

    /// Share an existing lock, e.g. between two schedulers in one process.
    /// The lock TTL must exceed the task timeout, or a healthy long task
    /// would be force-released as stale.
    pub fn with_lock(
        lock: Arc<GpuLock>,
        workers: WorkerOptions,
        history_limit: usize,
        runtime: Handle,
    ) -> Result<Self, SchedulerError> {
        let ttl = lock.options().ttl;
        if ttl <= workers.task_timeout {
            return Err(SchedulerError::InvalidOptions(format!(
                "lock TTL ({:?}) must exceed the task timeout ({:?})",
                ttl, workers.task_timeout
            )));
        }
        if history_limit == 0 {
            return Err(SchedulerError::InvalidOptions(
                "history limit must be at least 1".into(),
            ));
        }
        let registry = Arc::new(QueueRegistry::new(history_limit));
        let supervisor = Arc::new(WorkerSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&lock),
            workers,
            runtime,
        ));
        Ok(Self { registry, lock, supervisor })
    }

    /// Queue `work` behind everything already submitted to `group` and make
    /// sure a worker is consuming it.
    pub fn enqueue<F, Fut>(
        &self,
        group: impl Into<String>,
        name: impl Into<String>,
        work: F,
    ) -> Result<EnqueueReceipt, SchedulerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if self.supervisor.is_shutting_down() {
            return Err(SchedulerError::Shutdown);
        }
        let mut task = Task::new(group, name, work);
        let completion = task.completion_channel();
        let task_id = task.id();
        let group_key = task.group_key().to_string();
        let position = self.registry.enqueue(task);
        self.supervisor.ensure_worker(&group_key);
        info!(group = %group_key, %task_id, position, "episode queued");
        Ok(EnqueueReceipt {
            task_id,
            group_key,
            position,
            completion,
        })
    }

    pub fn status(&self) -> StatusReporter {
        StatusReporter::new(Arc::clone(&self.registry), Arc::clone(&self.lock))
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status().get_snapshot()
    }

    pub fn lock(&self) -> &Arc<GpuLock> {
        &self.lock
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Reject new work and wait for workers to finish their current task.
    /// Tasks still queued stay queued and their receipts resolve to
    /// `SchedulerError::Shutdown` once the scheduler is dropped.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        let orphaned = self.registry.orphaned_groups();
        if !orphaned.is_empty() {
            info!(groups = ?orphaned, "shut down with work still queued");
        }
    }
}

/// Returned by [`Scheduler::enqueue`].
#[derive(Debug)]
pub struct EnqueueReceipt {
    pub task_id: TaskId,
    pub group_key: String,
    /// 1-based, counting the task currently being processed.
    pub position: usize,
    completion: oneshot::Receiver<TaskRecord>,
}

impl EnqueueReceipt {
    /// Resolve to the terminal record once the worker is done with the task.
    pub async fn wait(self) -> Result<TaskRecord, SchedulerError> {
        self.completion.await.map_err(|_| SchedulerError::Shutdown)
    }
}
