//! Wait-for-drain protocol for producers that run GPU work outside the
//! scheduler: poll the status, start only once no group has queued or
//! in-flight work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use episodic_core::config::MAX_GATEKEEPER_POLL_SECS;
use episodic_core::MonitorConfig;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::status::{StatusReporter, StatusSnapshot};

/// Anything that can produce a [`StatusSnapshot`].
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> Result<StatusSnapshot, SchedulerError>;
}

#[async_trait]
impl StatusSource for StatusReporter {
    async fn fetch_status(&self) -> Result<StatusSnapshot, SchedulerError> {
        Ok(self.get_snapshot())
    }
}

#[async_trait]
impl<T: StatusSource + ?Sized> StatusSource for Arc<T> {
    async fn fetch_status(&self) -> Result<StatusSnapshot, SchedulerError> {
        (**self).fetch_status().await
    }
}

pub struct Gatekeeper<S> {
    source: S,
    poll_interval: Duration,
}

impl<S: StatusSource> Gatekeeper<S> {
    /// Intervals above ten seconds are clamped down.
    pub fn new(source: S, poll_interval: Duration) -> Self {
        let max = Duration::from_secs(MAX_GATEKEEPER_POLL_SECS);
        Self {
            source,
            poll_interval: poll_interval.clamp(Duration::from_millis(1), max),
        }
    }

    pub fn from_config(source: S, config: &MonitorConfig) -> Self {
        Self::new(source, config.poll_interval())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One poll. `Ok(true)` when nothing is queued or running.
    pub async fn is_drained(&self) -> Result<bool, SchedulerError> {
        Ok(self.source.fetch_status().await?.is_drained())
    }

    /// Poll until every group is drained, or give up after `timeout`
    /// (`None` = wait forever). Status errors are retried.
    pub async fn wait_until_drained(
        &self,
        timeout: Option<Duration>,
    ) -> Result<StatusSnapshot, SchedulerError> {
        let started = Instant::now();
        loop {
            match self.source.fetch_status().await {
                Ok(snapshot) if snapshot.is_drained() => {
                    info!(
                        waited_secs = started.elapsed().as_secs(),
                        "queues drained, clear to start GPU work"
                    );
                    return Ok(snapshot);
                }
                Ok(snapshot) => {
                    let busy: Vec<String> = snapshot
                        .group_queues
                        .iter()
                        .filter(|(_, g)| !g.is_drained())
                        .map(|(key, g)| {
                            let running = if g.currently_processing.is_some() { 1 } else { 0 };
                            format!("{}={}", key, g.size + running)
                        })
                        .collect();
                    info!(
                        pending = snapshot.total_pending(),
                        processing = snapshot.processing_groups().len(),
                        groups = %busy.join(","),
                        waited_secs = started.elapsed().as_secs(),
                        "waiting for queues to drain"
                    );
                }
                Err(e) => warn!(error = %e, "status poll failed, retrying"),
            }

            if let Some(limit) = timeout {
                if started.elapsed() + self.poll_interval > limit {
                    // One last look right at the deadline.
                    tokio::time::sleep(limit.saturating_sub(started.elapsed())).await;
                    return match self.source.fetch_status().await {
                        Ok(snapshot) if snapshot.is_drained() => Ok(snapshot),
                        Ok(_) => Err(SchedulerError::GateTimeout(limit)),
                        Err(e) => {
                            warn!(error = %e, "status poll failed at deadline");
                            Err(SchedulerError::GateTimeout(limit))
                        }
                    };
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_lock::{GpuLock, GpuLockOptions, LockBackend, LockDiagnostics};
    use crate::queue::{GroupCounters, GroupSnapshot};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports `busy_polls` busy snapshots, then drained ones.
    struct Scripted {
        busy_polls: usize,
        calls: AtomicUsize,
    }

    fn snapshot(busy: bool) -> StatusSnapshot {
        let mut group_queues = BTreeMap::new();
        group_queues.insert(
            "default".to_string(),
            GroupSnapshot {
                size: usize::from(busy),
                worker_active: busy,
                currently_processing: None,
                currently_processing_name: None,
                items: Vec::new(),
                last_error: None,
                counters: GroupCounters::default(),
                recent: Vec::new(),
            },
        );
        StatusSnapshot {
            group_queues,
            lock: LockDiagnostics {
                held: false,
                holder_id: None,
                held_since_seconds: 0.0,
                held_since: None,
                waiting: 0,
                awaiting_peer: false,
                stale_recoveries: 0,
                last_stale: None,
                backend: LockBackend::InProcess,
                ttl_seconds: 900.0,
            },
            captured_at: chrono::Utc::now(),
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch_status(&self) -> Result<StatusSnapshot, SchedulerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(SchedulerError::Status("connection refused".into()));
            }
            Ok(snapshot(n <= self.busy_polls))
        }
    }

    #[test]
    fn interval_is_clamped() {
        let reporter = StatusReporter::new(
            Arc::new(crate::registry::QueueRegistry::new(1)),
            Arc::new(GpuLock::new(GpuLockOptions::in_process(Duration::from_secs(1)))),
        );
        let gate = Gatekeeper::new(reporter, Duration::from_secs(60));
        assert_eq!(gate.poll_interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn waits_through_errors_and_busy_polls() {
        let source = Arc::new(Scripted { busy_polls: 2, calls: AtomicUsize::new(0) });
        let gate = Gatekeeper::new(Arc::clone(&source), Duration::from_millis(5));
        let snap = gate.wait_until_drained(Some(Duration::from_secs(2))).await.unwrap();
        assert!(snap.is_drained());
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_at_timeout() {
        let source = Scripted { busy_polls: usize::MAX, calls: AtomicUsize::new(0) };
        let gate = Gatekeeper::new(source, Duration::from_millis(10));
        let err = gate
            .wait_until_drained(Some(Duration::from_millis(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::GateTimeout(_)));
    }
}
