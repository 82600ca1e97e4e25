//! One consuming loop per active group key.
//!
//! A worker owns its group from `claim_worker` until it idles out or the
//! supervisor shuts down. Each iteration pops the head task, waits for the
//! GPU lock, runs the callback under a deadline and files the result.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use episodic_core::SchedulerConfig;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, TaskError};
use crate::gpu_lock::{GpuLock, GpuLockGuard};
use crate::queue::WorkerId;
use crate::registry::{Dequeue, QueueRegistry, RegistryRace};
use crate::task::{Task, TaskId, TaskOutcome};

/// Timing knobs for worker loops.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Deadline for one task callback.
    pub task_timeout: Duration,
    /// `None` waits for the GPU lock indefinitely.
    pub lock_wait_timeout: Option<Duration>,
    /// How often a worker blocked on the GPU lock says so.
    pub liveness_log_interval: Duration,
    /// `None` keeps workers alive for the life of the process.
    pub idle_timeout: Option<Duration>,
    /// Pause after a failed or timed-out task.
    pub failure_cooldown: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            lock_wait_timeout: None,
            liveness_log_interval: Duration::from_secs(30),
            idle_timeout: None,
            failure_cooldown: Duration::ZERO,
        }
    }
}

impl From<&SchedulerConfig> for WorkerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            lock_wait_timeout: config.lock_wait_timeout(),
            liveness_log_interval: config.lock_liveness_log_interval(),
            idle_timeout: config.idle_timeout(),
            failure_cooldown: config.failure_cooldown(),
        }
    }
}

pub struct WorkerSupervisor {
    registry: Arc<QueueRegistry>,
    lock: Arc<GpuLock>,
    options: WorkerOptions,
    runtime: Handle,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        registry: Arc<QueueRegistry>,
        lock: Arc<GpuLock>,
        options: WorkerOptions,
        runtime: Handle,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            lock,
            options,
            runtime,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start a worker for `group` unless one is already running. Returns
    /// whether this call spawned it.
    pub fn ensure_worker(self: &Arc<Self>, group: &str) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let Some(worker) = self.registry.claim_worker(group) else {
            return false;
        };
        let this = Arc::clone(self);
        let key = group.to_string();
        let handle = self.runtime.spawn(async move { this.run_worker(key, worker).await });

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        true
    }

    /// Number of worker loops still running.
    pub fn live_workers(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.iter().filter(|h| !h.is_finished()).count()
    }

    /// Ask every worker to stop after its current task and wait for them.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        info!(workers = handles.len(), "stopping workers");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("all workers stopped");
    }

    async fn run_worker(self: Arc<Self>, group: String, worker: WorkerId) {
        info!(group = %group, worker, "worker started");
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                self.registry.release_worker(&group, worker);
                info!(group = %group, worker, "worker stopped for shutdown");
                return;
            }

            let next = match self.registry.next_task(&group, worker) {
                Ok(next) => next,
                Err(race) => abort_on_race(race),
            };

            let notify = match next {
                Dequeue::Task(task) => {
                    self.process(&group, worker, task).await;
                    continue;
                }
                Dequeue::Empty(notify) => notify,
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = shutdown.wait_for(|stop| *stop) => {}
                _ = sleep_opt(self.options.idle_timeout) => {
                    match self.registry.release_if_idle(&group, worker) {
                        Ok(true) => {
                            info!(group = %group, worker, "worker idle, exiting");
                            return;
                        }
                        // Work landed while we were deciding.
                        Ok(false) => {}
                        Err(race) => abort_on_race(race),
                    }
                }
            }
        }
    }

    async fn process(&self, group: &str, worker: WorkerId, mut task: Task) {
        let task_id = task.id();
        let name = task.name().to_string();
        if let Err(e) = task.mark_processing() {
            error!(group, %task_id, error = %e, "dequeued task was not queued; aborting");
            std::process::abort();
        }
        self.registry.update_current(group, task.record());
        info!(group, %task_id, task = %name, "processing task");

        let outcome = match self.acquire_gpu(group, &name, task_id).await {
            Ok(guard) => {
                let outcome = self.execute(group, &mut task).await;
                drop(guard);
                outcome
            }
            Err(SchedulerError::LockTimeout(waited)) => {
                TaskOutcome::TimedOut(format!("GPU lock not acquired within {:?}", waited))
            }
            Err(e) => TaskOutcome::Failed(format!("GPU lock unavailable: {}", e)),
        };

        match &outcome {
            TaskOutcome::Succeeded => {}
            TaskOutcome::Failed(reason) => {
                warn!(group, %task_id, task = %name, error = %reason, "task failed")
            }
            TaskOutcome::TimedOut(reason) => {
                warn!(group, %task_id, task = %name, error = %reason, "task timed out")
            }
        }

        let listener = task.take_completion();
        let record = match task.finish(&outcome) {
            Ok(record) => record,
            Err(e) => {
                error!(group, %task_id, error = %e, "task left processing out of order; aborting");
                std::process::abort();
            }
        };
        info!(
            group,
            %task_id,
            task = %name,
            status = %record.status,
            elapsed_ms = record.processing_time().map(|d| d.num_milliseconds()).unwrap_or(0),
            "task finished"
        );
        if let Err(race) = self.registry.complete(group, worker, record.clone()) {
            abort_on_race(race);
        }
        if let Some(tx) = listener {
            let _ = tx.send(record);
        }

        if outcome != TaskOutcome::Succeeded && !self.options.failure_cooldown.is_zero() {
            debug!(group, cooldown_ms = self.options.failure_cooldown.as_millis() as u64, "cooling down after failure");
            tokio::time::sleep(self.options.failure_cooldown).await;
        }
    }

    /// Wait for the GPU lock, logging periodically while blocked. The lock
    /// owner is `{group}/{name}#{task_id}`.
    async fn acquire_gpu(
        &self,
        group: &str,
        name: &str,
        task_id: TaskId,
    ) -> Result<GpuLockGuard, SchedulerError> {
        let owner = format!("{}/{}#{}", group, name, task_id);
        let acquire = self.lock.acquire(&owner, self.options.lock_wait_timeout);
        tokio::pin!(acquire);

        let started = Instant::now();
        let every = self.options.liveness_log_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(started + every, every);
        loop {
            tokio::select! {
                res = &mut acquire => return res,
                _ = ticker.tick() => {
                    let diag = self.lock.diagnostics();
                    info!(
                        group,
                        task = name,
                        waited_secs = started.elapsed().as_secs(),
                        holder = diag.holder_id.as_deref().unwrap_or("-"),
                        queued = diag.waiting,
                        "still waiting for GPU lock"
                    );
                }
            }
        }
    }

    /// Run the callback on its own tokio task so a panic or a blown deadline
    /// cannot take the worker down with it.
    async fn execute(&self, group: &str, task: &mut Task) -> TaskOutcome {
        let Some(payload) = task.take_payload() else {
            return TaskOutcome::Failed("task has no work attached".into());
        };
        let mut handle = self.runtime.spawn(async move { payload().await });

        match tokio::time::timeout(self.options.task_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => TaskOutcome::Succeeded,
            Ok(Ok(Err(e))) => TaskOutcome::Failed(e.to_string()),
            Ok(Err(join)) if join.is_panic() => {
                let err = TaskError::Panicked(panic_message(join.into_panic()));
                TaskOutcome::Failed(err.to_string())
            }
            Ok(Err(_)) => TaskOutcome::Failed(TaskError::Cancelled.to_string()),
            Err(_) => {
                // Best effort; work that never yields keeps running detached.
                handle.abort();
                warn!(group, task_id = %task.id(), "abandoning callback past its deadline");
                TaskOutcome::TimedOut(format!("exceeded task timeout of {:?}", self.options.task_timeout))
            }
        }
    }
}

fn abort_on_race(race: RegistryRace) -> ! {
    error!(error = %race, "two workers claimed one group; aborting");
    std::process::abort()
}

async fn sleep_opt(after: Option<Duration>) {
    match after {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
