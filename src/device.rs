//! Device state and device thread (spec §4.2). Each managed device owns a
//! mutex-protected single-sub-request slot, a condvar for wake-ups, and the
//! per-device operational state from §3. One OS thread per device walks
//! the state machine `empty -> loaded -> mounted -> (I/O ready | umount) ->
//! empty`, with `failed` as a terminal sink.
//!
//! Grounded on the teacher's `core/wrapper.rs` pool/replica wrapper (a
//! DSS-mirrored record plus in-memory operational state) and on
//! `persistent_store.rs`'s single-worker-thread-with-mutex-slot shape,
//! generalized here to a literal OS thread rather than a tokio task since
//! §5 mandates "parallel OS threads: ... one thread per device".

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{error, info, warn};

use crate::backend;
use crate::backend::{DeviceAdapter, FilesystemAdapter, LibraryAdapter};
use crate::config::{Config, SyncThresholds};
use crate::dss::{Dss, LockableKind};
use crate::error::LrsError;
use crate::lock_manager::LockManager;
use crate::model::{AdminStatus, DeviceRecord, FsStatus, FsType, ResourceId};
use crate::protocol::{MediaGrant, Response};
use crate::request::{RequestContainer, SubRequestOutcome};

/// Operational state of a device (spec §4.2 state machine). `Failed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalState {
    Empty,
    Loaded,
    Mounted,
    Failed,
}

/// A release entry queued for eventual sync, owned by the device that
/// holds the medium it targets (spec §4.7).
pub struct SyncEntry {
    pub container: Arc<RequestContainer>,
    pub medium_index: usize,
    pub size_written: u64,
    pub enqueued_at: Instant,
}

/// Work handed to a device thread through its single slot: either an
/// allocate step (ensure the named medium is loaded and mounted, then
/// report back a grant) or a format.
pub enum DeviceWork {
    Allocate {
        container: Arc<RequestContainer>,
        medium_index: usize,
        medium_id: ResourceId,
        size_hint: Option<u64>,
    },
    Format {
        container: Arc<RequestContainer>,
        medium_index: usize,
        medium_id: ResourceId,
        fs: FsType,
        unlock: bool,
        force: bool,
    },
}

struct Inner {
    state: OperationalState,
    loaded_medium: Option<ResourceId>,
    /// The library slot address the currently-loaded medium was moved from,
    /// so `unload` can move it back to the same slot rather than an
    /// arbitrary one (spec §4.2 "Unload").
    home_slot: Option<String>,
    mount_path: Option<PathBuf>,
    ongoing_io: bool,
    /// Set by the scheduler thread while it is mid-pairing, so a second
    /// scheduler pass does not also consider this device free (spec §4.2
    /// "Scheduler code sets `ongoing-scheduled` while pairing").
    ongoing_scheduled: bool,
    slot: Option<DeviceWork>,
    sync_queue: VecDeque<SyncEntry>,
    pending_bytes: u64,
    needs_sync: bool,
    shutdown: bool,
}

/// A single managed device and its dedicated OS thread.
pub struct Device {
    pub id: ResourceId,
    pub model: String,
    pub host: String,
    dss: Arc<dyn Dss>,
    lock_manager: Arc<LockManager>,
    device_adapter: Arc<dyn DeviceAdapter>,
    library_adapter: Arc<dyn LibraryAdapter>,
    fs_adapter: Arc<dyn FilesystemAdapter>,
    config: Arc<Config>,
    outgoing: Sender<SubRequestOutcome>,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record: DeviceRecord,
        initial_state: OperationalState,
        initial_medium: Option<ResourceId>,
        initial_mount: Option<PathBuf>,
        dss: Arc<dyn Dss>,
        lock_manager: Arc<LockManager>,
        device_adapter: Arc<dyn DeviceAdapter>,
        library_adapter: Arc<dyn LibraryAdapter>,
        fs_adapter: Arc<dyn FilesystemAdapter>,
        config: Arc<Config>,
        outgoing: Sender<SubRequestOutcome>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            model: record.model,
            host: record.host,
            dss,
            lock_manager,
            device_adapter,
            library_adapter,
            fs_adapter,
            config,
            outgoing,
            inner: Mutex::new(Inner {
                state: initial_state,
                loaded_medium: initial_medium,
                home_slot: None,
                mount_path: initial_mount,
                ongoing_io: false,
                ongoing_scheduled: false,
                slot: None,
                sync_queue: VecDeque::new(),
                pending_bytes: 0,
                needs_sync: false,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        })
    }

    pub fn state(&self) -> OperationalState {
        self.inner.lock().unwrap().state
    }

    pub fn loaded_medium(&self) -> Option<ResourceId> {
        self.inner.lock().unwrap().loaded_medium.clone()
    }

    pub fn mount_path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().mount_path.clone()
    }

    /// Whether this device can accept a new sub-request right now (spec
    /// §4.2 "Single-sub-request rule").
    pub fn is_free(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state != OperationalState::Failed
            && inner.slot.is_none()
            && !inner.ongoing_io
            && !inner.ongoing_scheduled
    }

    /// Whether this device is currently serving another request or has
    /// pending sync work (spec §4.3 "Exclusions": media loaded in a busy
    /// device are skipped by the selector).
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.ongoing_io || inner.needs_sync || !inner.sync_queue.is_empty()
    }

    /// Marks this device reserved by the scheduler while it finishes
    /// pairing a request to it, per the single-sub-request rule.
    pub fn mark_scheduled(&self) {
        self.inner.lock().unwrap().ongoing_scheduled = true;
    }

    pub fn clear_scheduled(&self) {
        self.inner.lock().unwrap().ongoing_scheduled = false;
    }

    /// Publish a sub-request into the device's slot and wake its thread.
    pub fn publish(&self, work: DeviceWork) {
        let mut inner = self.inner.lock().unwrap();
        inner.slot = Some(work);
        inner.ongoing_scheduled = false;
        inner.ongoing_io = true;
        self.condvar.notify_all();
    }

    /// Append a release entry to this device's sync queue (spec §4.7).
    pub fn enqueue_sync(&self, container: Arc<RequestContainer>, medium_index: usize, size_written: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.sync_queue.push_back(SyncEntry { container, medium_index, size_written, enqueued_at: Instant::now() });
        inner.pending_bytes += size_written;
        self.evaluate_sync_trigger(&mut inner);
        self.condvar.notify_all();
    }

    /// Lower `ongoing_io` once the client has released the medium (spec
    /// §4.7 "the coordinator adjusts the device's `ongoing-io` flag").
    pub fn clear_ongoing_io(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ongoing_io = false;
        self.condvar.notify_all();
    }

    pub fn request_shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        self.condvar.notify_all();
    }

    /// Blocks until the device thread has no sub-request in flight (slot
    /// empty, `ongoing_io` cleared). Used by notify's `DeviceLock` (spec
    /// §4.6) to wait for in-flight work to drain before the device is torn
    /// down, instead of removing it out from under the thread still
    /// servicing it.
    pub fn wait_drained(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.slot.is_some() || inner.ongoing_io || inner.ongoing_scheduled {
            let (guard, _timeout) = self.condvar.wait_timeout(inner, Duration::from_millis(100)).unwrap();
            inner = guard;
        }
    }

    fn evaluate_sync_trigger(&self, inner: &mut Inner) {
        let thresholds = self.sync_thresholds();
        let oldest_age = inner.sync_queue.front().map(|e| e.enqueued_at.elapsed()).unwrap_or_default();
        inner.needs_sync = inner.sync_queue.len() as u64 >= thresholds.entries
            || inner.pending_bytes >= thresholds.bytes
            || oldest_age >= thresholds.age;
    }

    fn sync_thresholds(&self) -> SyncThresholds {
        self.config.sync.clone()
    }

    /// Runs the device thread's main loop. Intended to be spawned via
    /// `std::thread::spawn(move || device.run())`.
    pub fn run(self: Arc<Self>) {
        loop {
            let work = {
                let mut inner = self.inner.lock().unwrap();
                loop {
                    if inner.shutdown && inner.slot.is_none() {
                        return;
                    }
                    if inner.slot.is_some() {
                        break inner.slot.take();
                    }
                    if inner.needs_sync && !inner.ongoing_io {
                        break None;
                    }
                    let (guard, _timeout) =
                        self.condvar.wait_timeout(inner, Duration::from_millis(100)).unwrap();
                    inner = guard;
                }
            };

            match work {
                Some(DeviceWork::Allocate { container, medium_index, medium_id, size_hint }) => {
                    self.handle_allocate(container, medium_index, medium_id, size_hint);
                }
                Some(DeviceWork::Format { container, medium_index, medium_id, fs, unlock, force }) => {
                    self.handle_format(container, medium_index, medium_id, fs, unlock, force);
                }
                None => {}
            }

            self.maybe_flush_sync();
        }
    }

    fn handle_allocate(
        self: &Arc<Self>,
        container: Arc<RequestContainer>,
        medium_index: usize,
        medium_id: ResourceId,
        size_hint: Option<u64>,
    ) {
        let result = self.ensure_ready(&medium_id, size_hint);
        match result {
            Ok(grant) => {
                let response = Response::WriteAllocated { media: vec![grant] };
                container.record(medium_index, Ok(response.clone()));
                let _ = self.outgoing.send(SubRequestOutcome { container, medium_index, result: Ok(response) });
            }
            Err(err) => {
                container.record(medium_index, Err(err.clone()));
                let _ = self.outgoing.send(SubRequestOutcome { container, medium_index, result: Err(err) });
            }
        }
        // I/O stays "ongoing" until the client releases the medium (spec
        // §4.7); allocation alone does not clear it unless the device just
        // failed, in which case there is nothing left to release.
        self.inner.lock().unwrap().ongoing_io = self.state() != OperationalState::Failed;
        self.condvar.notify_all();
    }

    fn handle_format(
        self: &Arc<Self>,
        container: Arc<RequestContainer>,
        medium_index: usize,
        medium_id: ResourceId,
        fs: FsType,
        unlock: bool,
        force: bool,
    ) {
        let result = self.do_format(&medium_id, fs, unlock, force);
        match result {
            Ok(free_space) => {
                container.record(medium_index, Ok(Response::Formatted { free_space }));
                let _ = self.outgoing.send(SubRequestOutcome {
                    container,
                    medium_index,
                    result: Ok(Response::Formatted { free_space }),
                });
            }
            Err(err) => {
                container.record(medium_index, Err(err.clone()));
                let _ = self.outgoing.send(SubRequestOutcome { container, medium_index, result: Err(err) });
            }
        }
        self.inner.lock().unwrap().ongoing_io = false;
        self.condvar.notify_all();
    }

    /// Ensures the named medium is loaded and mounted, loading/mounting it
    /// first if necessary, then returns a grant describing the mount.
    fn ensure_ready(self: &Arc<Self>, medium_id: &ResourceId, size_hint: Option<u64>) -> Result<MediaGrant, LrsError> {
        if self.loaded_medium().as_ref() != Some(medium_id) {
            self.load(medium_id)?;
        }
        let mount_path = match self.mount_path() {
            Some(path) => path,
            None => self.mount(medium_id, size_hint)?,
        };

        let medium = self
            .dss
            .get_media(&crate::dss::MediaFilter { id: Some(medium_id.clone()), ..Default::default() })?
            .into_iter()
            .next()
            .ok_or_else(|| LrsError::MediumNotFound { id: medium_id.clone() })?;

        Ok(MediaGrant {
            id: medium_id.clone(),
            mount_path,
            fs_type: medium.fs_type,
            address_format: address_format_for(medium.fs_type),
            free_space: Some(medium.phys_spc_free),
        })
    }

    /// Load preconditions: state = empty, `loaded_medium` = null, medium
    /// already locked by self (spec §4.2 "Load").
    fn load(self: &Arc<Self>, medium_id: &ResourceId) -> Result<(), LrsError> {
        if self.state() != OperationalState::Empty {
            return Err(LrsError::InvalidState { id: medium_id.clone() });
        }

        self.lock_manager.acquire(LockableKind::Medium, medium_id)?;

        let device_path = self.device_adapter_lookup()?;
        let slot = backend::block_on(self.library_adapter.media_lookup(&medium_id.name))
            .map_err(|err| self.into_io_error(medium_id, err))?;
        let drive = backend::block_on(self.library_adapter.drive_lookup(&self.id.name))
            .map_err(|err| self.into_io_error(medium_id, err))?;

        match backend::block_on(self.library_adapter.media_move(&slot, &drive.address)) {
            Ok(()) => {}
            // spec §4.2 "Load": a drive-to-drive move prohibited by the
            // library is retried later, not a device failure.
            Err(err @ backend::BackendError::MoveProhibited { .. }) => {
                warn!(device = %self.id, medium = %medium_id, error = %err, "load move rejected by library, will retry");
                return Err(LrsError::Busy { resource: medium_id.clone() });
            }
            Err(err) => {
                self.fail(medium_id, format!("media move failed during load: {err}"));
                return Err(LrsError::IoError { resource: medium_id.clone(), details: err.to_string() });
            }
        }

        if let Err(err) = backend::block_on(self.device_adapter.load(&device_path)) {
            self.fail(medium_id, format!("device load failed: {err}"));
            return Err(LrsError::IoError { resource: medium_id.clone(), details: err.to_string() });
        }

        let mut inner = self.inner.lock().unwrap();
        inner.state = OperationalState::Loaded;
        inner.loaded_medium = Some(medium_id.clone());
        inner.home_slot = Some(slot);
        Ok(())
    }

    /// Unload (spec §4.2 "Unload"): precondition state = loaded. Mirrors
    /// `lib_scsi_move`'s preserved fallback (spec's Open Question on
    /// `media_move`): move back to the medium's home slot, and if the
    /// library rejects that move, retry once against any currently free
    /// slot instead of failing the device outright.
    pub fn unload(self: &Arc<Self>) -> Result<(), LrsError> {
        let medium_id = self.loaded_medium().ok_or_else(|| LrsError::InvalidState { id: self.id.clone() })?;
        if self.state() != OperationalState::Loaded {
            return Err(LrsError::InvalidState { id: medium_id.clone() });
        }

        let drive = backend::block_on(self.library_adapter.drive_lookup(&self.id.name))
            .map_err(|err| self.into_io_error(&medium_id, err))?;
        let home_slot = self.inner.lock().unwrap().home_slot.clone();

        let target = match home_slot {
            Some(slot) => slot,
            None => backend::block_on(self.library_adapter.find_free_slot())
                .map_err(|err| self.into_io_error(&medium_id, err))?,
        };

        match backend::block_on(self.library_adapter.media_move(&drive.address, &target)) {
            Ok(()) => {}
            Err(backend::BackendError::MoveProhibited { .. }) => {
                warn!(device = %self.id, medium = %medium_id, target = %target, "unload move rejected by library, retrying to any free slot");
                let free = backend::block_on(self.library_adapter.find_free_slot())
                    .map_err(|err| self.into_io_error(&medium_id, err))?;
                backend::block_on(self.library_adapter.media_move(&drive.address, &free))
                    .map_err(|err| self.into_io_error(&medium_id, err))?;
            }
            Err(err) => {
                self.fail(&medium_id, format!("media move failed during unload: {err}"));
                return Err(LrsError::IoError { resource: medium_id.clone(), details: err.to_string() });
            }
        }

        self.lock_manager.release(LockableKind::Medium, &medium_id, false)?;

        let mut inner = self.inner.lock().unwrap();
        inner.state = OperationalState::Empty;
        inner.loaded_medium = None;
        inner.home_slot = None;
        Ok(())
    }

    /// Mount (spec §4.2 "Mount"). Handles the LTFS read-only-mount-on-almost-full
    /// case by marking the medium `full` and surfacing `InvalidState` so
    /// the caller retries with another medium.
    fn mount(self: &Arc<Self>, medium_id: &ResourceId, _size_hint: Option<u64>) -> Result<PathBuf, LrsError> {
        if self.state() != OperationalState::Loaded {
            return Err(LrsError::InvalidState { id: medium_id.clone() });
        }
        let device_path = self.device_adapter_lookup()?;
        let mount_point = self.config.mount_prefix.join(self.id.name.replace('/', "_"));

        let medium = self
            .dss
            .get_media(&crate::dss::MediaFilter { id: Some(medium_id.clone()), ..Default::default() })?
            .into_iter()
            .next()
            .ok_or_else(|| LrsError::MediumNotFound { id: medium_id.clone() })?;

        backend::block_on(self.fs_adapter.mount(&device_path, &mount_point, medium.fs_type))
            .map_err(|err| self.into_io_error(medium_id, err))?;

        let report =
            backend::block_on(self.fs_adapter.df(&mount_point)).map_err(|err| self.into_io_error(medium_id, err))?;
        if report.free_bytes == 0 && medium.fs_type == FsType::Ltfs {
            let mut full_medium = medium.clone();
            full_medium.fs_status = FsStatus::Full;
            let _ = self.dss.update_medium(&full_medium);
            return Err(LrsError::InvalidState { id: medium_id.clone() });
        }

        let mut inner = self.inner.lock().unwrap();
        inner.state = OperationalState::Mounted;
        inner.mount_path = Some(mount_point.clone());
        Ok(mount_point)
    }

    /// Umount (spec §4.2 "Umount"). Precondition: mounted, no pending sync
    /// commitments.
    pub fn umount(self: &Arc<Self>) -> Result<(), LrsError> {
        let medium_id = self.loaded_medium().ok_or_else(|| LrsError::InvalidState { id: self.id.clone() })?;
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != OperationalState::Mounted || !inner.sync_queue.is_empty() || inner.needs_sync {
                return Err(LrsError::InvalidState { id: medium_id.clone() });
            }
        }
        let mount_path = self.mount_path().ok_or_else(|| LrsError::InvalidState { id: medium_id.clone() })?;
        backend::block_on(self.fs_adapter.umount(&mount_path)).map_err(|err| self.into_io_error(&medium_id, err))?;

        let mut inner = self.inner.lock().unwrap();
        inner.state = OperationalState::Loaded;
        inner.mount_path = None;
        Ok(())
    }

    /// Format (spec §4.2 "Format").
    fn do_format(self: &Arc<Self>, medium_id: &ResourceId, fs: FsType, unlock: bool, force: bool) -> Result<u64, LrsError> {
        let medium = self
            .dss
            .get_media(&crate::dss::MediaFilter { id: Some(medium_id.clone()), ..Default::default() })?
            .into_iter()
            .next()
            .ok_or_else(|| LrsError::MediumNotFound { id: medium_id.clone() })?;

        let allow = medium.fs_status == FsStatus::Blank || (force && medium_id.family == crate::model::ResourceFamily::Tape);
        if !allow {
            return Err(LrsError::InvalidState { id: medium_id.clone() });
        }

        if self.loaded_medium().as_ref() != Some(medium_id) {
            self.load(medium_id)?;
        }
        let device_path = self.device_adapter_lookup()?;

        let report = backend::block_on(self.fs_adapter.format(&device_path, &medium_id.name, fs))
            .map_err(|err| self.into_io_error(medium_id, err))?;

        let mut updated = medium.clone();
        updated.fs_status = FsStatus::Empty;
        updated.fs_type = fs;
        updated.phys_spc_free = report.free_bytes;
        updated.phys_spc_used = report.used_bytes;
        if unlock {
            updated.admin_status = AdminStatus::Unlocked;
        }
        self.dss.update_medium(&updated)?;

        Ok(report.free_bytes)
    }

    fn maybe_flush_sync(self: &Arc<Self>) {
        let should_flush = {
            let inner = self.inner.lock().unwrap();
            inner.needs_sync && !inner.ongoing_io
        };
        if !should_flush {
            return;
        }

        let medium_id = match self.loaded_medium() {
            Some(id) => id,
            None => return,
        };
        let mount_path = match self.mount_path() {
            Some(path) => path,
            None => return,
        };

        match backend::block_on(self.fs_adapter.sync(&mount_path)) {
            Ok(()) => self.complete_sync(&medium_id),
            Err(err) => self.fail_sync(&medium_id, err.to_string()),
        }
    }

    fn complete_sync(self: &Arc<Self>, medium_id: &ResourceId) {
        let entries: Vec<SyncEntry> = {
            let mut inner = self.inner.lock().unwrap();
            let drained: Vec<SyncEntry> = inner.sync_queue.drain(..).collect();
            inner.pending_bytes = 0;
            inner.needs_sync = false;
            drained
        };

        let total_written: u64 = entries.iter().map(|e| e.size_written).sum();
        if total_written > 0 {
            if let Ok(Some(mut medium)) = self
                .dss
                .get_media(&crate::dss::MediaFilter { id: Some(medium_id.clone()), ..Default::default() })
                .map(|v| v.into_iter().next())
            {
                medium.logical_spc_written += total_written;
                medium.obj_count += entries.len() as u64;
                medium.phys_spc_free = medium.phys_spc_free.saturating_sub(total_written);
                medium.phys_spc_used += total_written;
                // spec §8 boundary behaviour: a write that consumes the last
                // byte of free space transitions the medium to full so the
                // selector stops offering it.
                if medium.phys_spc_free == 0 {
                    medium.fs_status = FsStatus::Full;
                }
                let _ = self.dss.update_medium(&medium);
            }
        }

        for entry in entries {
            // An entry whose request already failed elsewhere is dropped
            // silently (spec §4.7 "Cancellation").
            if entry.container.is_failed() {
                continue;
            }
            entry.container.record(entry.medium_index, Ok(Response::Released));
            let _ = self.outgoing.send(SubRequestOutcome {
                container: entry.container,
                medium_index: entry.medium_index,
                result: Ok(Response::Released),
            });
        }
    }

    fn fail_sync(self: &Arc<Self>, medium_id: &ResourceId, details: String) {
        let entries: Vec<SyncEntry> = {
            let mut inner = self.inner.lock().unwrap();
            inner.sync_queue.drain(..).collect()
        };
        for entry in entries {
            if entry.container.is_failed() {
                continue;
            }
            entry.container.mark_failed();
            let err = LrsError::IoError { resource: medium_id.clone(), details: details.clone() };
            entry.container.record(entry.medium_index, Err(err.clone()));
            let _ = self.outgoing.send(SubRequestOutcome { container: entry.container, medium_index: entry.medium_index, result: Err(err) });
        }
        self.fail(medium_id, details);
    }

    fn device_adapter_lookup(self: &Arc<Self>) -> Result<PathBuf, LrsError> {
        backend::block_on(self.device_adapter.lookup(&self.id.name)).map_err(|err| LrsError::IoError {
            resource: self.id.clone(),
            details: err.to_string(),
        })
    }

    fn into_io_error(&self, id: &ResourceId, err: crate::backend::BackendError) -> LrsError {
        LrsError::IoError { resource: id.clone(), details: err.to_string() }
    }

    /// Failure propagation (spec §4.2 "Failure propagation"): releases the
    /// device and medium locks and marks both failed/admin-locked in DSS.
    fn fail(self: &Arc<Self>, medium_id: &ResourceId, details: String) {
        error!(device = %self.id, medium = %medium_id, %details, "device failed");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = OperationalState::Failed;
        }
        let _ = self.lock_manager.release(LockableKind::Medium, medium_id, false);
        let _ = self.lock_manager.release(LockableKind::Device, &self.id, false);
        let _ = self.dss.update_device_admin_status(&self.id, AdminStatus::Failed);
        info!(device = %self.id, "device marked failed, skipped by all pickers from now on");
    }
}

fn address_format_for(fs: FsType) -> String {
    match fs {
        FsType::Posix => "posix-path".into(),
        FsType::Ltfs => "ltfs-path".into(),
        FsType::Rados => "rados-object-key".into(),
    }
}

