//! Singleton lease lock with a liveness-checked owner record.
//!
//! The lock is a JSON owner record (holder id, pid, host, heartbeat) at a
//! well-known path. It is created with an atomic hard link, so the record is
//! either absent or complete. A held lock is refreshed by a heartbeat task.
//! A record is stale when its heartbeat is older than `stale_after` or when
//! it names a process on this host that no longer exists; stale records are
//! taken over without operator action.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by pid {} on {} (heartbeat {})", .holder.pid, .holder.host, .holder.heartbeat_at)]
    Contended { path: PathBuf, holder: LeaseOwner },
    #[error("lock io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt lock record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOwner {
    pub holder_id: Uuid,
    pub pid: u32,
    pub host: String,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseOwner {
    fn current(holder_id: Uuid, purpose: &str) -> Self {
        let now = Utc::now();
        Self {
            holder_id,
            pid: std::process::id(),
            host: local_host(),
            purpose: purpose.to_string(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        let silent_for = now.signed_duration_since(self.heartbeat_at);
        let limit = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        if silent_for > limit {
            return true;
        }
        self.host == local_host() && !process_alive(self.pid)
    }
}

fn local_host() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

#[derive(Debug, Clone)]
pub struct LeaseLock {
    path: PathBuf,
    stale_after: Duration,
    purpose: String,
}

impl LeaseLock {
    pub fn new(
        path: impl Into<PathBuf>,
        stale_after: Duration,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            stale_after,
            purpose: purpose.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_owner(path: &Path) -> Result<Option<LeaseOwner>, LockError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| LockError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Fails fast with [`LockError::Contended`] when a live holder exists.
    pub fn try_acquire(&self) -> Result<LeaseGuard, LockError> {
        let holder_id = Uuid::new_v4();
        let owner = LeaseOwner::current(holder_id, &self.purpose);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if self.link_new(&owner)? {
            return Ok(self.guard(holder_id));
        }

        let existing = match Self::read_owner(&self.path) {
            Ok(Some(existing)) => existing,
            // Released between our attempt and the read.
            Ok(None) => {
                return if self.link_new(&owner)? {
                    Ok(self.guard(holder_id))
                } else {
                    Err(self.contended()?)
                };
            }
            Err(LockError::Corrupt { .. }) => {
                warn!(path = %self.path.display(), "removing unreadable lock record");
                self.remove_if(|_| true)?;
                return if self.link_new(&owner)? {
                    Ok(self.guard(holder_id))
                } else {
                    Err(self.contended()?)
                };
            }
            Err(err) => return Err(err),
        };

        if !existing.is_stale(self.stale_after, Utc::now()) {
            return Err(LockError::Contended {
                path: self.path.clone(),
                holder: existing,
            });
        }

        warn!(
            path = %self.path.display(),
            stale_pid = existing.pid,
            stale_host = %existing.host,
            heartbeat_at = %existing.heartbeat_at,
            "reclaiming stale lock"
        );
        self.take_over(&existing)?;
        if self.link_new(&owner)? {
            Ok(self.guard(holder_id))
        } else {
            Err(self.contended()?)
        }
    }

    fn contended(&self) -> Result<LockError, LockError> {
        let holder = Self::read_owner(&self.path)?
            .unwrap_or_else(|| LeaseOwner::current(Uuid::nil(), "unknown"));
        Ok(LockError::Contended {
            path: self.path.clone(),
            holder,
        })
    }

    /// Creates the lock record if absent. Returns false when it already exists.
    fn link_new(&self, owner: &LeaseOwner) -> Result<bool, LockError> {
        let tmp = self.write_temp(owner)?;
        let linked = std::fs::hard_link(&tmp, &self.path);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Moves the stale record aside; if another process replaced it in the
    /// meantime, puts theirs back.
    fn take_over(&self, stale: &LeaseOwner) -> Result<(), LockError> {
        let tomb = self.sibling(&format!("stale-{}", Uuid::new_v4()));
        match std::fs::rename(&self.path, &tomb) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        let moved = Self::read_owner(&tomb).ok().flatten();
        if moved.as_ref().map(|o| o.holder_id) != Some(stale.holder_id) {
            let _ = std::fs::hard_link(&tomb, &self.path);
        }
        let _ = std::fs::remove_file(&tomb);
        Ok(())
    }

    fn remove_if(
        &self,
        pred: impl FnOnce(Option<&LeaseOwner>) -> bool,
    ) -> Result<(), LockError> {
        let owner = Self::read_owner(&self.path).ok().flatten();
        if pred(owner.as_ref()) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "lease".to_string());
        self.path.with_file_name(format!(".{name}.{suffix}"))
    }

    fn write_temp(&self, owner: &LeaseOwner) -> Result<PathBuf, LockError> {
        let tmp = self.sibling(&format!("{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(owner).map_err(|source| LockError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        std::fs::write(&tmp, bytes).map_err(|source| LockError::Io {
            path: tmp.clone(),
            source,
        })?;
        Ok(tmp)
    }

    fn guard(&self, holder_id: Uuid) -> LeaseGuard {
        info!(path = %self.path.display(), %holder_id, purpose = %self.purpose, "lock acquired");
        let heartbeat = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let lock = self.clone();
            let every = (self.stale_after / 3).max(Duration::from_millis(100));
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match lock.beat(holder_id) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(
                                path = %lock.path.display(),
                                %holder_id,
                                "lock lost, heartbeat stopped"
                            );
                            break;
                        }
                        Err(err) => warn!(error = %err, "lock heartbeat failed"),
                    }
                }
            })
        });
        LeaseGuard {
            lock: self.clone(),
            holder_id,
            heartbeat,
            released: false,
        }
    }

    /// Refreshes the heartbeat while the record still belongs to `holder_id`.
    /// Returns false once the lease is lost: the record is gone, names another
    /// holder, or has already gone stale and may be mid-takeover.
    fn beat(&self, holder_id: Uuid) -> Result<bool, LockError> {
        let Some(mut owner) = Self::read_owner(&self.path)? else {
            return Ok(false);
        };
        let now = Utc::now();
        if owner.holder_id != holder_id || owner.is_stale(self.stale_after, now) {
            return Ok(false);
        }
        owner.heartbeat_at = now;
        let tmp = self.write_temp(&owner)?;
        let still_ours = Self::read_owner(&self.path)
            .ok()
            .flatten()
            .is_some_and(|current| current.holder_id == holder_id);
        if !still_ours {
            let _ = std::fs::remove_file(&tmp);
            return Ok(false);
        }
        std::fs::rename(&tmp, &self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(true)
    }
}

/// Held lock. Dropping it stops the heartbeat and removes the owner record,
/// on every exit path including panics and signal-driven shutdown.
#[derive(Debug)]
pub struct LeaseGuard {
    lock: LeaseLock,
    holder_id: Uuid,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl LeaseGuard {
    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        let holder_id = self.holder_id;
        self.lock
            .remove_if(|owner| owner.map(|o| o.holder_id) == Some(holder_id))?;
        info!(path = %self.lock.path.display(), %holder_id, "lock released");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_holder_sees_contention() {
        let dir = tempdir().expect("tempdir");
        let lock = LeaseLock::new(dir.path().join("sync.lock"), Duration::from_secs(60), "sync");

        let guard = lock.try_acquire().expect("first acquire");
        let err = lock.try_acquire().expect_err("contended");
        match err {
            LockError::Contended { holder, .. } => {
                assert_eq!(holder.holder_id, guard.holder_id());
                assert_eq!(holder.pid, std::process::id());
            }
            other => panic!("unexpected error {other}"),
        }

        drop(guard);
        assert!(!dir.path().join("sync.lock").exists());
        lock.try_acquire().expect("free again after release");
    }

    #[tokio::test]
    async fn stale_heartbeat_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync.lock");
        let stale = LeaseOwner {
            holder_id: Uuid::new_v4(),
            pid: std::process::id(),
            host: "elsewhere".to_string(),
            purpose: "sync".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
            heartbeat_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = LeaseLock::new(&path, Duration::from_secs(60), "sync");
        let guard = lock.try_acquire().expect("stale lock reclaimed");
        let owner = LeaseLock::read_owner(&path).unwrap().unwrap();
        assert_eq!(owner.holder_id, guard.holder_id());
    }

    #[tokio::test]
    async fn fresh_foreign_holder_is_respected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync.lock");
        let live = LeaseOwner {
            holder_id: Uuid::new_v4(),
            pid: 1,
            host: "another-host".to_string(),
            purpose: "sync".to_string(),
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_vec(&live).unwrap()).unwrap();

        let lock = LeaseLock::new(&path, Duration::from_secs(60), "sync");
        assert!(matches!(lock.try_acquire(), Err(LockError::Contended { .. })));
        assert_eq!(LeaseLock::read_owner(&path).unwrap().unwrap(), live);
    }

    #[test]
    fn release_leaves_foreign_record_alone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync.lock");
        let lock = LeaseLock::new(&path, Duration::from_secs(60), "sync");
        let guard = lock.try_acquire().expect("acquire");

        let intruder = LeaseOwner::current(Uuid::new_v4(), "sync");
        std::fs::write(&path, serde_json::to_vec(&intruder).unwrap()).unwrap();
        guard.release().expect("release");

        let owner = LeaseLock::read_owner(&path).unwrap().unwrap();
        assert_eq!(owner.holder_id, intruder.holder_id);
    }

    #[test]
    fn heartbeat_never_overwrites_another_holder() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync.lock");
        let lock = LeaseLock::new(&path, Duration::from_secs(60), "sync");
        let guard = lock.try_acquire().expect("acquire");
        assert!(lock.beat(guard.holder_id()).unwrap());

        let successor = LeaseOwner::current(Uuid::new_v4(), "sync");
        std::fs::write(&path, serde_json::to_vec(&successor).unwrap()).unwrap();

        assert!(!lock.beat(guard.holder_id()).unwrap());
        assert_eq!(LeaseLock::read_owner(&path).unwrap().unwrap(), successor);
    }

    #[test]
    fn lapsed_heartbeat_is_not_revived() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync.lock");
        let lock = LeaseLock::new(&path, Duration::from_secs(60), "sync");
        let guard = lock.try_acquire().expect("acquire");

        let mut lapsed = LeaseLock::read_owner(&path).unwrap().unwrap();
        lapsed.heartbeat_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_vec(&lapsed).unwrap()).unwrap();

        assert!(!lock.beat(guard.holder_id()).unwrap());
        assert_eq!(LeaseLock::read_owner(&path).unwrap().unwrap(), lapsed);
    }
}
