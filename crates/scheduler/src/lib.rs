//! Per-group sequential episode scheduling behind a system-wide GPU lock.
//!
//! - [`Scheduler`] accepts work for a group key and returns a receipt.
//! - [`WorkerSupervisor`] keeps exactly one worker per active group.
//! - [`GpuLock`] serializes GPU-bound work across groups and processes.
//! - [`StatusReporter`] and [`Gatekeeper`] expose queue state to pollers.

pub mod error;
pub mod gatekeeper;
pub mod gpu_lock;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod supervisor;
pub mod task;

pub use error::{SchedulerError, TaskError};
pub use gatekeeper::{Gatekeeper, StatusSource};
pub use gpu_lock::{GpuLock, GpuLockGuard, GpuLockOptions, LockBackend, LockDiagnostics, StaleLockEvent};
pub use queue::{GroupCounters, GroupQueue, GroupSnapshot, WorkerId};
pub use registry::{Dequeue, QueueRegistry, RegistryRace};
pub use scheduler::{EnqueueReceipt, Scheduler};
pub use status::{StatusReporter, StatusSnapshot};
pub use supervisor::{WorkerOptions, WorkerSupervisor};
pub use task::{Task, TaskId, TaskOutcome, TaskRecord, TaskStatus};
