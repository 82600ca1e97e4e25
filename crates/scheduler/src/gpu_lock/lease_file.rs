//! Lease file shared by every process that competes for the GPU.
//!
//! The lease is a small JSON document published with `hard_link`, which fails
//! if the target exists, so a reader never sees a half-written lease and two
//! processes cannot both create it. A lease older than the TTL (or one that
//! cannot be parsed) belongs to a crashed holder and is evicted.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Contents of the lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub pid: u32,
    pub hostname: String,
    /// Unix timestamp, milliseconds.
    pub acquired_at_ms: u64,
}

impl LeaseRecord {
    pub fn current(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at_ms: now_ms(),
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.acquired_at_ms))
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// We own the lease. `recovered` is the abandoned lease we evicted, if any.
    Acquired { recovered: Option<LeaseRecord> },
    /// A live peer owns it.
    Busy(LeaseRecord),
}

#[derive(Debug, Clone)]
pub struct LeaseFile {
    path: PathBuf,
}

impl LeaseFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lease, `None` when the file is absent.
    pub fn read(&self) -> Result<Option<LeaseRecord>, SchedulerError> {
        read_record(&self.path)
    }

    /// Try once (plus one retry after an eviction) to take the lease.
    pub fn try_claim(&self, holder_id: &str, ttl: Duration) -> Result<Claim, SchedulerError> {
        let mut recovered = None;
        for _ in 0..3 {
            if self.publish(&LeaseRecord::current(holder_id))? {
                debug!(path = %self.path.display(), holder_id, "GPU lease file acquired");
                return Ok(Claim::Acquired { recovered });
            }
            match read_record(&self.path) {
                // Released between our publish and read; try again.
                Ok(None) => continue,
                Ok(Some(existing)) if !existing.is_stale(ttl) => return Ok(Claim::Busy(existing)),
                Ok(Some(existing)) => {
                    warn!(
                        path = %self.path.display(),
                        holder_id = %existing.holder_id,
                        pid = existing.pid,
                        age_ms = existing.age().as_millis() as u64,
                        "Recovering stale GPU lease (holder exceeded TTL)"
                    );
                    if self.evict(Some(&existing))? {
                        recovered = Some(existing);
                    }
                }
                Err(SchedulerError::LockCorrupt(reason)) => {
                    warn!(path = %self.path.display(), %reason, "Evicting unreadable GPU lease");
                    self.evict(None)?;
                }
                Err(e) => return Err(e),
            }
        }
        match read_record(&self.path)? {
            Some(existing) => Ok(Claim::Busy(existing)),
            None => Err(SchedulerError::LockCorrupt(format!(
                "lease at {} kept changing during claim",
                self.path.display()
            ))),
        }
    }

    /// Remove the lease if `holder_id` owns it. Returns whether it did.
    pub fn release(&self, holder_id: &str) -> Result<bool, SchedulerError> {
        match read_record(&self.path) {
            Ok(Some(existing)) if existing.holder_id == holder_id => {
                remove_if_exists(&self.path)?;
                Ok(true)
            }
            Ok(Some(existing)) => {
                warn!(
                    path = %self.path.display(),
                    holder_id,
                    owner = %existing.holder_id,
                    "GPU lease owned by someone else; not releasing"
                );
                Ok(false)
            }
            Ok(None) => {
                // A peer checking for staleness may have our lease moved aside.
                if !self.remove_moved_aside(holder_id)? {
                    return Ok(false);
                }
                warn!(
                    path = %self.path.display(),
                    holder_id,
                    "GPU lease released while a peer was checking it for staleness"
                );
                if let Ok(Some(existing)) = read_record(&self.path) {
                    if existing.holder_id == holder_id {
                        remove_if_exists(&self.path)?;
                    }
                }
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete eviction tombstones that still carry `holder_id`'s lease, so a
    /// peer cannot restore it after we let go.
    fn remove_moved_aside(&self, holder_id: &str) -> Result<bool, SchedulerError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let prefix = format!(".{}.stale-", self.file_name());
        let mut removed = false;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            if let Ok(Some(record)) = read_record(&entry.path()) {
                if record.holder_id == holder_id {
                    remove_if_exists(&entry.path())?;
                    removed = true;
                }
            }
        }
        Ok(removed)
    }

    /// Atomically create the lease file with `record`. `false` if it exists.
    fn publish(&self, record: &LeaseRecord) -> Result<bool, SchedulerError> {
        let tmp = self.sibling("tmp");
        let json = serde_json::to_vec(record)
            .map_err(|e| SchedulerError::LockCorrupt(e.to_string()))?;
        fs::write(&tmp, json)?;
        let linked = fs::hard_link(&tmp, &self.path);
        remove_if_exists(&tmp)?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the current lease aside and delete it, provided it is still the
    /// one we judged abandoned. If a peer replaced it in between, put theirs back.
    fn evict(&self, expected: Option<&LeaseRecord>) -> Result<bool, SchedulerError> {
        let tombstone = self.sibling("stale");
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let moved = read_record(&tombstone).ok().flatten();
        let same = match (expected, moved.as_ref()) {
            (Some(expected), Some(moved)) => expected == moved,
            (None, None) => true,
            _ => false,
        };
        if !same {
            // Not ours to delete. Restore unless yet another peer got in first.
            if let Err(e) = fs::hard_link(&tombstone, &self.path) {
                warn!(path = %self.path.display(), error = %e, "Could not restore live GPU lease");
            }
        }
        remove_if_exists(&tombstone)?;
        Ok(same)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gpu.lock".to_string())
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        self.path.with_file_name(format!(
            ".{}.{}-{}",
            self.file_name(),
            tag,
            Uuid::new_v4().simple()
        ))
    }
}

fn read_record(path: &Path) -> Result<Option<LeaseRecord>, SchedulerError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| SchedulerError::LockCorrupt(format!("{}: {}", path.display(), e)))
}

fn remove_if_exists(path: &Path) -> Result<(), SchedulerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn claim_then_busy_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let lease = LeaseFile::new(dir.path().join("gpu.lock"));

        assert_eq!(
            lease.try_claim("proc-a", TTL).unwrap(),
            Claim::Acquired { recovered: None }
        );
        match lease.try_claim("proc-b", TTL).unwrap() {
            Claim::Busy(holder) => {
                assert_eq!(holder.holder_id, "proc-a");
                assert_eq!(holder.pid, std::process::id());
            }
            other => panic!("expected Busy, got {:?}", other),
        }

        assert!(!lease.release("proc-b").unwrap(), "non-holder release is a no-op");
        assert!(lease.read().unwrap().is_some());
        assert!(lease.release("proc-a").unwrap());
        assert!(lease.read().unwrap().is_none());
    }

    #[test]
    fn stale_lease_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let lease = LeaseFile::new(dir.path().join("gpu.lock"));
        lease.try_claim("crashed", TTL).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        match lease.try_claim("survivor", Duration::from_millis(5)).unwrap() {
            Claim::Acquired { recovered: Some(old) } => assert_eq!(old.holder_id, "crashed"),
            other => panic!("expected recovery, got {:?}", other),
        }
        assert_eq!(lease.read().unwrap().unwrap().holder_id, "survivor");
    }

    #[test]
    fn corrupt_lease_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        fs::write(&path, b"not json").unwrap();
        let lease = LeaseFile::new(&path);

        assert!(matches!(lease.read(), Err(SchedulerError::LockCorrupt(_))));
        assert_eq!(
            lease.try_claim("fresh", TTL).unwrap(),
            Claim::Acquired { recovered: None }
        );
    }

    #[test]
    fn release_during_peer_eviction_check_is_not_undone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        let lease = LeaseFile::new(&path);
        lease.try_claim("owner", TTL).unwrap();

        // A peer has moved the live lease aside to inspect it.
        let tombstone = dir.path().join(".gpu.lock.stale-peer");
        fs::rename(&path, &tombstone).unwrap();

        assert!(lease.release("owner").unwrap());
        assert!(!tombstone.exists());
        // The peer's restore now finds nothing to put back.
        assert!(fs::hard_link(&tombstone, &path).is_err());
        assert!(lease.read().unwrap().is_none());
        assert_eq!(
            lease.try_claim("next", TTL).unwrap(),
            Claim::Acquired { recovered: None }
        );
    }

    #[test]
    fn release_ignores_tombstones_of_other_holders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        let lease = LeaseFile::new(&path);
        lease.try_claim("someone-else", TTL).unwrap();
        let tombstone = dir.path().join(".gpu.lock.stale-peer");
        fs::rename(&path, &tombstone).unwrap();

        assert!(!lease.release("owner").unwrap());
        assert!(tombstone.exists());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let lease = LeaseFile::new(dir.path().join("gpu.lock"));
        lease.try_claim("a", TTL).unwrap();
        lease.try_claim("b", TTL).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["gpu.lock".to_string()]);
    }
}
