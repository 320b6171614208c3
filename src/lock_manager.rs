//! Device/Medium Lock Manager (spec §4.1). Acquires and releases
//! cluster-wide, `(host, pid)`-stamped locks through the `Dss` trait.
//!
//! The teacher's `core::lock::ResourceLockManager` protects in-process
//! resources with `futures::lock::Mutex` guards; here the lock lives in
//! DSS and survives a process restart, so acquisition is a DSS
//! transaction rather than a local mutex. The acquire/release/stale-reclaim
//! shape is kept the same: acquire returns a guard-like result, and a
//! crashed daemon's locks are reclaimed explicitly rather than dropped.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::dss::{Dss, LockableKind};
use crate::error::{ErrorKind, LrsError, LrsResult};
use crate::model::{Identity, LockRecord, ResourceId};

/// Cluster-wide lock manager, backed by whichever `Dss` implementation the
/// daemon was started with.
pub struct LockManager {
    dss: Arc<dyn Dss>,
    identity: Identity,
}

impl LockManager {
    pub fn new(dss: Arc<dyn Dss>, identity: Identity) -> Self {
        Self { dss, identity }
    }

    /// Acquire a lock on `id`. Idempotent if this `(host, pid)` already
    /// owns it; fails with `Busy` if a different owner holds it. A lock
    /// left behind by a crashed instance of this same daemon on this same
    /// host is reclaimed transparently before surfacing any failure — the
    /// startup `clean_stale_locks` pass only catches devices known at
    /// startup, so a device added later via `Notify(DeviceAdd)` still needs
    /// this path.
    pub fn acquire(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<()> {
        match self.dss.lock_acquire(kind, id, &self.identity) {
            Err(err) if matches!(err.kind(), ErrorKind::Busy | ErrorKind::AlreadyLocked) => {
                if self.renew_if_stale(kind, id)? {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    /// Release a lock this identity owns. `force` bypasses ownership
    /// checks (used during `clean_stale_locks`).
    pub fn release(&self, kind: LockableKind, id: &ResourceId, force: bool) -> LrsResult<()> {
        self.dss.lock_release(kind, id, &self.identity, force)
    }

    pub fn status(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>> {
        self.dss.lock_status(kind, id)
    }

    /// Reclaim a lock that appears to be held by a previous instance of
    /// this daemon on the same host (i.e. the pid stamped on it is our
    /// own, left behind by a crash before release). Foreign-host locks are
    /// left untouched — only a DSS admin or the owning host can clear
    /// those.
    pub fn renew_if_stale(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<bool> {
        match self.dss.lock_status(kind, id)? {
            Some(lock) if lock.host == self.identity.host && lock.pid != self.identity.pid => {
                warn!(resource = %id, old_pid = lock.pid, "reclaiming stale lock from a previous instance");
                self.dss.lock_release(kind, id, &self.identity, true)?;
                self.dss.lock_acquire(kind, id, &self.identity)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Startup pass (spec §4.1 "the startup `clean_stale_locks` pass"):
    /// unlock everything this host's *previous* process instance left
    /// locked, identified by `(host, pid)` no longer matching our own pid.
    pub fn clean_stale_locks(&self, kind: LockableKind) -> LrsResult<Vec<ResourceId>> {
        self.dss.lock_clean(kind, &self.identity.host, self.identity.pid)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// A lock acquired for the lifetime of the guard; releasing happens on
/// drop, matching the teacher's `ResourceLockGuard` RAII shape even though
/// the underlying lock is remote.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    kind: LockableKind,
    id: ResourceId,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(manager: &'a LockManager, kind: LockableKind, id: ResourceId) -> LrsResult<Self> {
        manager.acquire(kind, &id)?;
        Ok(Self { manager, kind, id, released: false })
    }

    /// Release early and consume the guard so `Drop` does not attempt it
    /// again.
    pub fn release_now(mut self) -> LrsResult<()> {
        self.released = true;
        self.manager.release(self.kind, &self.id, false)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.manager.release(self.kind, &self.id, false) {
                warn!(resource = %self.id, error = %err, "failed to release lock on drop");
            }
        }
    }
}

/// Whether an acquire failure should be retried transparently by the I/O
/// scheduler (spec §7: `Busy` is retryable, `AlreadyLocked` is surfaced).
pub fn is_retryable_lock_error(err: &LrsError) -> bool {
    err.kind().is_retryable()
}

pub const DEFAULT_STALE_LOCK_GRACE: Duration = Duration::from_secs(30);
