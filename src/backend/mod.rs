//! Device/FS/Library back-ends consumed by the LRS (spec §6
//! "Device/FS/Library back-ends"). These three traits are the only surface
//! the core touches for actual hardware or filesystem access; the teacher
//! draws the same boundary with `PoolOps`/`ReplicaOps`/`Share` against
//! `io-engine`'s bdev layer. Real implementations live behind each family's
//! crate at startup; `mock` provides test doubles.

pub mod mock;

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use snafu::Snafu;

use crate::model::{FsType, ResourceFamily};

/// The device/library/filesystem thread runs synchronously (spec §5
/// mandates a literal OS thread per device), but adapter implementations
/// are async (network calls to a library controller, etc). This shared
/// runtime bridges the two the same way `dss::etcd` bridges `Dss` calls,
/// except here there is no need to preserve cross-call ordering so a
/// plain `block_on` against a shared multi-thread runtime is enough.
static BACKEND_RUNTIME: Lazy<tokio::runtime::Runtime> =
    Lazy::new(|| tokio::runtime::Runtime::new().expect("failed to start backend runtime"));

pub fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    BACKEND_RUNTIME.block_on(fut)
}

#[derive(Debug, Snafu)]
pub enum BackendError {
    #[snafu(display("device '{}' not found by adapter", serial))]
    DeviceNotFound { serial: String },
    #[snafu(display("medium '{}' not found in library", label))]
    MediumNotFound { label: String },
    /// A library-level move the caller asked for is not currently possible
    /// (destination slot occupied, drive-to-drive move disallowed, ...).
    /// Distinct from `Io`: spec.md's `lib_scsi_move` contract is "a
    /// prohibited move returns `Busy` and is retried later; any other
    /// library error fails the device" (spec §4.2 "Load"), so the caller
    /// must be able to tell the two apart.
    #[snafu(display("move from '{}' to '{}' rejected by library", src, dst))]
    MoveProhibited { src: String, dst: String },
    #[snafu(display("no free slot available in library"))]
    NoFreeSlot,
    #[snafu(display("back-end I/O failure: {}", details))]
    Io { details: String },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Identifying information for a device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub family: ResourceFamily,
    pub model: String,
    pub serial: String,
}

/// A drive slot address inside a library, and the medium it currently
/// holds, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSlot {
    pub address: String,
    pub loaded_medium: Option<String>,
}

/// *Device adapter*: resolves a device's kernel path and identity, and
/// optionally drives ejection for families where that is meaningful.
#[async_trait::async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Resolve a device's kernel device node from its serial number.
    async fn lookup(&self, serial: &str) -> BackendResult<PathBuf>;
    /// Query identity information for a device path.
    async fn query(&self, path: &Path) -> BackendResult<DeviceInfo>;
    /// Load a medium into the device, where the family needs an explicit
    /// step beyond the library's own `media_move` (e.g. directory/rados
    /// families that have no physical load step return `Ok(())`).
    async fn load(&self, _path: &Path) -> BackendResult<()> {
        Ok(())
    }
    /// Eject whatever medium is currently in the device.
    async fn eject(&self, _path: &Path) -> BackendResult<()> {
        Ok(())
    }
}

/// *Library adapter*: the robotic or virtual library that moves media
/// between slots and drives (tape changers; a no-op for directory/rados
/// families where "library" is a trivial identity mapping).
#[async_trait::async_trait]
pub trait LibraryAdapter: Send + Sync {
    async fn open(&self, device: &DeviceInfo) -> BackendResult<()>;
    async fn close(&self, device: &DeviceInfo) -> BackendResult<()>;
    /// Look up a drive's current address and loaded medium, if any.
    async fn drive_lookup(&self, serial: &str) -> BackendResult<DriveSlot>;
    /// Look up the library slot address of a medium by its label.
    async fn media_lookup(&self, label: &str) -> BackendResult<String>;
    /// Physically move a medium from one address to another (e.g.
    /// slot-to-drive or drive-to-slot). Fails with `BackendError::
    /// MoveProhibited` if the destination cannot currently accept the
    /// medium (occupied, disallowed pairing), which the caller retries
    /// later rather than treating as a device failure.
    async fn media_move(&self, src: &str, dst: &str) -> BackendResult<()>;
    /// Find any currently empty slot, used as the `lib_scsi_move` fallback
    /// destination when a move to a specific slot is rejected.
    async fn find_free_slot(&self) -> BackendResult<String>;
    /// Enumerate the library's full slot/drive contents, opaque to the
    /// core beyond being logged and surfaced to operators.
    async fn scan(&self) -> BackendResult<serde_json::Value>;
}

/// Free/used space as reported by a filesystem adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceReport {
    pub free_bytes: u64,
    pub used_bytes: u64,
}

/// *Filesystem adapter*: mounts, formats and queries the filesystem that
/// sits on top of a loaded medium.
#[async_trait::async_trait]
pub trait FilesystemAdapter: Send + Sync {
    async fn mount(&self, device: &Path, mount_point: &Path, fs: FsType) -> BackendResult<()>;
    async fn umount(&self, mount_point: &Path) -> BackendResult<()>;
    /// Returns the mount point a device path is currently mounted at, if
    /// any.
    async fn mounted(&self, device: &Path) -> BackendResult<Option<PathBuf>>;
    async fn format(&self, device: &Path, label: &str, fs: FsType) -> BackendResult<SpaceReport>;
    async fn df(&self, mount_point: &Path) -> BackendResult<SpaceReport>;
    async fn get_label(&self, mount_point: &Path) -> BackendResult<String>;
    async fn sync(&self, mount_point: &Path) -> BackendResult<()>;
}

/// The three adapters a single family's back-end must supply at startup.
/// Held as `Arc`s since every device thread for this family shares the
/// same adapter instances.
pub struct FamilyBackend {
    pub device: std::sync::Arc<dyn DeviceAdapter>,
    pub library: std::sync::Arc<dyn LibraryAdapter>,
    pub filesystem: std::sync::Arc<dyn FilesystemAdapter>,
}
