//! Shared data model: resource identifiers and the persistent records
//! mirrored from DSS (see spec §3 DATA MODEL).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A closed enumeration of resource families. A daemon instance is bound
/// to exactly one family for its entire lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceFamily {
    Tape,
    Directory,
    RadosPool,
}

/// Globally unique resource identifier: family, name and owning library.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub family: ResourceFamily,
    pub name: String,
    pub library: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.family, self.library, self.name)
    }
}

impl ResourceId {
    pub fn new(family: ResourceFamily, library: impl Into<String>, name: impl Into<String>) -> Self {
        Self { family, name: name.into(), library: library.into() }
    }
}

/// Filesystem type used to encode a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Posix,
    Ltfs,
    Rados,
}

/// Filesystem-level status of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FsStatus {
    Blank,
    Empty,
    Used,
    Full,
}

/// Administrative status shared by media and devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdminStatus {
    Unlocked,
    Locked,
    Failed,
}

/// A DSS lock record: the (host, pid) pair that currently owns a resource,
/// plus the timestamp of acquisition/renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub host: String,
    pub pid: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl LockRecord {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self { host: host.into(), pid, timestamp: chrono::Utc::now() }
    }

    /// Whether this lock belongs to `(host, pid)`.
    pub fn owned_by(&self, host: &str, pid: u32) -> bool {
        self.host == host && self.pid == pid
    }
}

/// Persistent record for a medium, as mirrored from DSS (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumRecord {
    pub id: ResourceId,
    pub model: String,
    pub phys_spc_free: u64,
    pub phys_spc_used: u64,
    pub logical_spc_written: u64,
    pub obj_count: u64,
    pub fs_type: FsType,
    pub fs_status: FsStatus,
    pub admin_status: AdminStatus,
    pub get: bool,
    pub put: bool,
    pub tags: BTreeSet<String>,
    pub lock: Option<LockRecord>,
}

impl MediumRecord {
    pub fn is_locked_foreign(&self, host: &str) -> bool {
        matches!(&self.lock, Some(lock) if lock.host != host)
    }

    pub fn is_usable_for_write(&self) -> bool {
        self.admin_status == AdminStatus::Unlocked
            && self.put
            && !matches!(self.fs_status, FsStatus::Blank | FsStatus::Full)
    }

    pub fn has_tags(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

/// Persistent record for a device (drive), as mirrored from DSS (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: ResourceId,
    pub model: String,
    pub host: String,
    pub admin_status: AdminStatus,
    pub lock: Option<LockRecord>,
}

/// Identifies the caller's own (host, pid) for lock ownership purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub host: String,
    pub pid: u32,
}

impl Identity {
    pub fn current(host: impl Into<String>) -> Self {
        Self { host: host.into(), pid: std::process::id() }
    }
}
