//! System-wide GPU exclusivity lock.
//!
//! Two layers:
//! - an in-process gate that grants the lock in request-arrival order across
//!   every group, and force-releases a holder that outlives the TTL;
//! - an optional [`LeaseFile`] that extends exclusivity to every process
//!   pointing at the same path.
//!
//! A caller holds the lock for as long as it keeps the [`GpuLockGuard`].

mod lease_file;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use episodic_core::LockConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;

pub use lease_file::{Claim, LeaseFile, LeaseRecord};

type LeaseId = u64;

#[derive(Debug, Clone)]
pub struct GpuLockOptions {
    /// Hold duration after which the holder is presumed crashed.
    pub ttl: Duration,
    /// Cross-process lease file. `None` keeps the lock process-local.
    pub lease_file: Option<PathBuf>,
    pub file_poll_interval: Duration,
    /// Prefix for holder ids written to the lease file.
    pub instance_id: String,
}

impl GpuLockOptions {
    pub fn in_process(ttl: Duration) -> Self {
        Self {
            ttl,
            lease_file: None,
            file_poll_interval: Duration::from_millis(250),
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl From<&LockConfig> for GpuLockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: config.ttl(),
            lease_file: config.lock_file.clone(),
            file_poll_interval: config.file_poll_interval(),
            instance_id: config
                .instance_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    InProcess,
    File,
}

/// Record of a forced release of an abandoned holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleLockEvent {
    pub holder_id: String,
    pub held_for_seconds: f64,
    pub recovered_at: DateTime<Utc>,
}

/// Read-only view served to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDiagnostics {
    pub held: bool,
    pub holder_id: Option<String>,
    pub held_since_seconds: f64,
    pub held_since: Option<DateTime<Utc>>,
    /// Requesters queued behind the holder.
    pub waiting: usize,
    /// A local requester has its turn but a peer process holds the lease file.
    pub awaiting_peer: bool,
    pub stale_recoveries: u64,
    pub last_stale: Option<StaleLockEvent>,
    pub backend: LockBackend,
    pub ttl_seconds: f64,
}

#[derive(Debug)]
struct Holder {
    lease: LeaseId,
    owner: String,
    since: Instant,
    since_utc: DateTime<Utc>,
    /// False while a file-backed holder is still waiting for the lease file.
    confirmed: bool,
}

impl Holder {
    fn new(lease: LeaseId, owner: String, confirmed: bool) -> Self {
        Self {
            lease,
            owner,
            since: Instant::now(),
            since_utc: Utc::now(),
            confirmed,
        }
    }
}

struct Waiter {
    ticket: u64,
    owner: String,
    grant: oneshot::Sender<LeaseId>,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
    next_id: u64,
    stale_recoveries: u64,
    last_stale: Option<StaleLockEvent>,
}

impl LockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn grant(&mut self, owner: String, confirmed: bool) -> LeaseId {
        let lease = self.next_id();
        self.holder = Some(Holder::new(lease, owner, confirmed));
        lease
    }

    /// Pass the lock to the longest-waiting requester that is still listening.
    fn hand_over(&mut self, confirmed: bool) {
        self.holder = None;
        while let Some(waiter) = self.waiters.pop_front() {
            let lease = self.next_id();
            if waiter.grant.send(lease).is_ok() {
                debug!(owner = %waiter.owner, "GPU lock handed over");
                self.holder = Some(Holder::new(lease, waiter.owner, confirmed));
                return;
            }
        }
    }
}

pub struct GpuLock {
    options: GpuLockOptions,
    lease_file: Option<LeaseFile>,
    state: Mutex<LockState>,
}

impl GpuLock {
    pub fn new(options: GpuLockOptions) -> Self {
        let lease_file = options.lease_file.as_ref().map(LeaseFile::new);
        Self {
            options,
            lease_file,
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn options(&self) -> &GpuLockOptions {
        &self.options
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_only(&self) -> bool {
        self.lease_file.is_none()
    }

    fn holder_id(&self, owner: &str, lease: LeaseId) -> String {
        format!("{}:{}:{}", self.options.instance_id, owner, lease)
    }

    /// Wait until the lock is ours or `max_wait` elapses (`None` = forever).
    /// Requesters are served first-come-first-served regardless of group.
    pub async fn acquire(
        self: &Arc<Self>,
        owner: &str,
        max_wait: Option<Duration>,
    ) -> Result<GpuLockGuard, SchedulerError> {
        let deadline = max_wait.map(|d| Instant::now() + d);
        let lease = self.acquire_local(owner, deadline, max_wait).await?;
        // From here on, dropping the guard (error or cancellation) frees the turn.
        let guard = GpuLockGuard {
            lock: Arc::clone(self),
            lease,
            owner: owner.to_string(),
        };
        self.claim_lease_file(lease, owner, deadline, max_wait).await?;
        info!(owner, "GPU lock acquired");
        Ok(guard)
    }

    /// Non-blocking attempt. `None` if anyone holds or is queued for the lock.
    pub fn try_acquire(self: &Arc<Self>, owner: &str) -> Result<Option<GpuLockGuard>, SchedulerError> {
        let lease = {
            let mut st = self.state();
            self.expire_stale(&mut st);
            if st.holder.is_some() || !st.waiters.is_empty() {
                return Ok(None);
            }
            st.grant(owner.to_string(), self.local_only())
        };
        let guard = GpuLockGuard {
            lock: Arc::clone(self),
            lease,
            owner: owner.to_string(),
        };
        if let Some(file) = &self.lease_file {
            match file.try_claim(&self.holder_id(owner, lease), self.options.ttl)? {
                Claim::Acquired { recovered } => self.confirm(lease, owner, recovered)?,
                Claim::Busy(_) => return Ok(None),
            }
        }
        Ok(Some(guard))
    }

    /// Release the lock held by `owner`. Releasing a lock someone else holds
    /// (or nobody holds) is a logged no-op.
    pub fn release(&self, owner: &str) -> bool {
        let mut st = self.state();
        let lease = match st.holder.as_ref() {
            Some(h) if h.owner == owner => h.lease,
            Some(h) => {
                warn!(owner, holder = %h.owner, "GPU lock release by non-holder ignored");
                return false;
            }
            None => {
                warn!(owner, "GPU lock release while not held ignored");
                return false;
            }
        };
        self.release_locked(&mut st, lease)
    }

    /// True if the current holder has outlived the TTL.
    pub fn is_stale(&self) -> bool {
        let st = self.state();
        st.holder
            .as_ref()
            .is_some_and(|h| h.confirmed && h.since.elapsed() > self.options.ttl)
    }

    pub fn holder(&self) -> Option<String> {
        let st = self.state();
        st.holder.as_ref().filter(|h| h.confirmed).map(|h| h.owner.clone())
    }

    /// Lock state as seen from this process. With a lease file, a lease
    /// owned by another process counts as held and names that holder.
    pub fn diagnostics(&self) -> LockDiagnostics {
        let mut diag = {
            let st = self.state();
            let confirmed = st.holder.as_ref().filter(|h| h.confirmed);
            let awaiting_peer = st.holder.as_ref().is_some_and(|h| !h.confirmed);
            LockDiagnostics {
                held: confirmed.is_some(),
                holder_id: confirmed.map(|h| h.owner.clone()),
                held_since_seconds: confirmed.map(|h| h.since.elapsed().as_secs_f64()).unwrap_or(0.0),
                held_since: confirmed.map(|h| h.since_utc),
                waiting: st.waiters.len() + usize::from(awaiting_peer),
                awaiting_peer,
                stale_recoveries: st.stale_recoveries,
                last_stale: st.last_stale.clone(),
                backend: if self.local_only() { LockBackend::InProcess } else { LockBackend::File },
                ttl_seconds: self.options.ttl.as_secs_f64(),
            }
        };
        if !diag.held {
            if let Some(peer) = self.peer_lease() {
                diag.held = true;
                diag.held_since_seconds = peer.age().as_secs_f64();
                diag.held_since = DateTime::from_timestamp_millis(peer.acquired_at_ms as i64);
                diag.holder_id = Some(peer.holder_id);
            }
        }
        diag
    }

    /// Lease currently on disk, read without touching it.
    fn peer_lease(&self) -> Option<LeaseRecord> {
        let file = self.lease_file.as_ref()?;
        match file.read() {
            Ok(record) => record,
            Err(e) => {
                debug!(path = %file.path().display(), error = %e, "GPU lease unreadable");
                None
            }
        }
    }

    async fn acquire_local(
        &self,
        owner: &str,
        deadline: Option<Instant>,
        max_wait: Option<Duration>,
    ) -> Result<LeaseId, SchedulerError> {
        let mut wait = {
            let mut st = self.state();
            self.expire_stale(&mut st);
            if st.holder.is_none() && st.waiters.is_empty() {
                return Ok(st.grant(owner.to_string(), self.local_only()));
            }
            let (tx, rx) = oneshot::channel();
            let ticket = st.next_id();
            st.waiters.push_back(Waiter {
                ticket,
                owner: owner.to_string(),
                grant: tx,
            });
            debug!(owner, position = st.waiters.len(), "queued for GPU lock");
            PendingWait {
                lock: self,
                ticket,
                rx,
                armed: true,
            }
        };

        loop {
            // Wake for our deadline or for the moment the holder turns stale.
            let stale_at = {
                let st = self.state();
                st.holder
                    .as_ref()
                    .filter(|h| h.confirmed)
                    .map(|h| h.since + self.options.ttl + Duration::from_millis(1))
            };
            let wake = match (deadline, stale_at) {
                (Some(d), Some(s)) => Some(d.min(s)),
                (d, s) => d.or(s),
            };

            tokio::select! {
                granted = &mut wait.rx => {
                    wait.armed = false;
                    return granted.map_err(|_| SchedulerError::Shutdown);
                }
                _ = sleep_until(wake) => {
                    let mut st = self.state();
                    if self.expire_stale(&mut st) {
                        continue;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        if let Some(pos) = st.waiters.iter().position(|w| w.ticket == wait.ticket) {
                            st.waiters.remove(pos);
                            wait.armed = false;
                            return Err(SchedulerError::LockTimeout(max_wait.unwrap_or_default()));
                        }
                        // Granted just now; the receiver is ready.
                    }
                }
            }
        }
    }

    async fn claim_lease_file(
        &self,
        lease: LeaseId,
        owner: &str,
        deadline: Option<Instant>,
        max_wait: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        let Some(file) = &self.lease_file else {
            return Ok(());
        };
        let holder_id = self.holder_id(owner, lease);
        let mut logged_busy = false;
        loop {
            match file.try_claim(&holder_id, self.options.ttl)? {
                Claim::Acquired { recovered } => return self.confirm(lease, owner, recovered),
                Claim::Busy(peer) if !logged_busy => {
                    info!(
                        owner,
                        peer = %peer.holder_id,
                        peer_pid = peer.pid,
                        "GPU lock held by another process, waiting"
                    );
                    logged_busy = true;
                }
                Claim::Busy(_) => {}
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(SchedulerError::LockTimeout(max_wait.unwrap_or_default()));
            }
            tokio::time::sleep(self.options.file_poll_interval).await;
        }
    }

    /// Mark a file-backed holder as owning the lease file.
    fn confirm(
        &self,
        lease: LeaseId,
        owner: &str,
        recovered: Option<LeaseRecord>,
    ) -> Result<(), SchedulerError> {
        let mut st = self.state();
        if let Some(stale) = recovered {
            st.stale_recoveries += 1;
            st.last_stale = Some(StaleLockEvent {
                holder_id: stale.holder_id.clone(),
                held_for_seconds: stale.age().as_secs_f64(),
                recovered_at: Utc::now(),
            });
        }
        let confirmed = match st.holder.as_mut() {
            Some(h) if h.lease == lease => {
                h.confirmed = true;
                h.since = Instant::now();
                h.since_utc = Utc::now();
                true
            }
            _ => false,
        };
        drop(st);
        if confirmed {
            return Ok(());
        }
        if let Some(file) = &self.lease_file {
            file.release(&self.holder_id(owner, lease))?;
        }
        Err(SchedulerError::LockCorrupt(
            "local turn lost while claiming the lease file".into(),
        ))
    }

    /// Force-release a holder that outlived the TTL. Returns true if it did.
    fn expire_stale(&self, st: &mut LockState) -> bool {
        let (lease, owner, held_for) = match st.holder.as_ref() {
            Some(h) if h.confirmed && h.since.elapsed() > self.options.ttl => {
                (h.lease, h.owner.clone(), h.since.elapsed())
            }
            _ => return false,
        };
        warn!(
            holder = %owner,
            held_for_secs = held_for.as_secs_f64(),
            ttl_secs = self.options.ttl.as_secs_f64(),
            "GPU lock holder exceeded TTL, force-releasing"
        );
        st.stale_recoveries += 1;
        st.last_stale = Some(StaleLockEvent {
            holder_id: owner,
            held_for_seconds: held_for.as_secs_f64(),
            recovered_at: Utc::now(),
        });
        self.release_locked(st, lease)
    }

    fn release_lease(&self, lease: LeaseId) -> bool {
        let mut st = self.state();
        self.release_locked(&mut st, lease)
    }

    fn release_locked(&self, st: &mut LockState, lease: LeaseId) -> bool {
        let holder = match st.holder.as_ref() {
            Some(h) if h.lease == lease => h,
            _ => return false,
        };
        if holder.confirmed {
            if let Some(file) = &self.lease_file {
                let holder_id = self.holder_id(&holder.owner, lease);
                if let Err(e) = file.release(&holder_id) {
                    warn!(error = %e, "failed to remove GPU lease file");
                }
            }
        }
        debug!(owner = %holder.owner, held_for_ms = holder.since.elapsed().as_millis() as u64, "GPU lock released");
        st.hand_over(self.local_only());
        true
    }
}

/// Holds the GPU lock until dropped.
pub struct GpuLockGuard {
    lock: Arc<GpuLock>,
    lease: LeaseId,
    owner: String,
}

impl GpuLockGuard {
    /// Whether this guard still owns the lock (false after a stale force-release).
    pub fn is_current(&self) -> bool {
        let st = self.lock.state();
        st.holder.as_ref().is_some_and(|h| h.lease == self.lease)
    }
}

impl Drop for GpuLockGuard {
    fn drop(&mut self) {
        if !self.lock.release_lease(self.lease) {
            // Released explicitly, or force-released past the TTL.
            warn!(owner = %self.owner, "GPU lock no longer held by this guard");
        }
    }
}

/// A queued request. Dropping it before it resolves withdraws the request
/// and returns any lease granted in the meantime.
struct PendingWait<'a> {
    lock: &'a GpuLock,
    ticket: u64,
    rx: oneshot::Receiver<LeaseId>,
    armed: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.lock.state();
        if let Some(pos) = st.waiters.iter().position(|w| w.ticket == self.ticket) {
            st.waiters.remove(pos);
        } else if let Ok(lease) = self.rx.try_recv() {
            self.lock.release_locked(&mut st, lease);
        }
    }
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
