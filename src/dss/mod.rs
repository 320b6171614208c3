//! DSS — the external transactional metadata store the LRS consumes
//! (spec §6 "DSS interface (consumed)"). Modelled as a narrow trait so the
//! real backend can be an etcd-style transactional store (`dss::etcd`)
//! while tests use an in-memory double (`dss::memory`), the same split the
//! teacher draws between `PersistentStore`/`Etcd` and a test fixture.

pub mod etcd;
pub mod memory;

use std::collections::BTreeSet;

use crate::error::LrsResult;
use crate::model::{AdminStatus, DeviceRecord, FsStatus, Identity, LockRecord, MediumRecord, ResourceFamily, ResourceId};

/// Which kind of resource a lock operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockableKind {
    Device,
    Medium,
}

/// Filter for `media.get` (spec §4.3 "Query filter").
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    pub id: Option<ResourceId>,
    pub family: Option<ResourceFamily>,
    pub admin_status: Option<AdminStatus>,
    pub put: Option<bool>,
    pub exclude_fs_status: BTreeSet<FsStatus>,
    pub tags: BTreeSet<String>,
}

impl MediaFilter {
    pub fn matches(&self, medium: &MediumRecord) -> bool {
        if let Some(id) = &self.id {
            if &medium.id != id {
                return false;
            }
        }
        if let Some(family) = self.family {
            if medium.id.family != family {
                return false;
            }
        }
        if let Some(status) = self.admin_status {
            if medium.admin_status != status {
                return false;
            }
        }
        if let Some(put) = self.put {
            if medium.put != put {
                return false;
            }
        }
        if self.exclude_fs_status.contains(&medium.fs_status) {
            return false;
        }
        medium.has_tags(&self.tags)
    }
}

/// Filter for `device.get`.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub id: Option<ResourceId>,
    pub family: Option<ResourceFamily>,
    pub host: Option<String>,
    pub admin_status: Option<AdminStatus>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceRecord) -> bool {
        if let Some(id) = &self.id {
            if &device.id != id {
                return false;
            }
        }
        if let Some(family) = self.family {
            if device.id.family != family {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if &device.host != host {
                return false;
            }
        }
        if let Some(status) = self.admin_status {
            if device.admin_status != status {
                return false;
            }
        }
        true
    }
}

/// The DSS contract consumed by the LRS. All operations are synchronous
/// from the caller's perspective (backed, for the real implementation, by
/// a dedicated I/O thread — see `dss::etcd`).
pub trait Dss: Send + Sync {
    fn get_media(&self, filter: &MediaFilter) -> LrsResult<Vec<MediumRecord>>;
    fn update_medium(&self, medium: &MediumRecord) -> LrsResult<()>;
    fn set_medium(&self, medium: &MediumRecord) -> LrsResult<()>;

    fn get_devices(&self, filter: &DeviceFilter) -> LrsResult<Vec<DeviceRecord>>;
    fn update_device_admin_status(&self, id: &ResourceId, status: AdminStatus) -> LrsResult<()>;

    /// Acquire a cluster-wide lock, failing with `Busy` if another
    /// (host, pid) already owns it (spec §4.1).
    fn lock_acquire(&self, kind: LockableKind, id: &ResourceId, owner: &Identity) -> LrsResult<()>;
    /// Release a lock. `force` bypasses ownership checks (used when a
    /// previous daemon instance on this host crashed, spec §4.1
    /// `renew_if_stale`).
    fn lock_release(&self, kind: LockableKind, id: &ResourceId, owner: &Identity, force: bool) -> LrsResult<()>;
    fn lock_status(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>>;
    /// Unlock every resource of `kind` held by `(host, pid)`, returning the
    /// ids that were unlocked (spec §4.1 `clean_stale_locks`).
    fn lock_clean(&self, kind: LockableKind, host: &str, pid: u32) -> LrsResult<Vec<ResourceId>>;
}
