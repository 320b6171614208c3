//! End-to-end scenario tests driving a `Registry` through its public
//! `RequestHandler` surface against `MemoryDss` and the mock backend
//! adapters, the way the teacher's `deployer`-driven integration tests
//! drive a `core-agent` through its gRPC surface against a `composer`
//! cluster. These exercise the real scheduler/device threads, not mocks of
//! them; each test seeds just enough DSS/backend state for one drive (or
//! two, where the scenario needs it) and blocks on `Registry::handle`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use phobos_lrs::backend::mock::{MockDeviceAdapter, MockFilesystemAdapter, MockLibraryAdapter};
use phobos_lrs::backend::{FamilyBackend, SpaceReport};
use phobos_lrs::comm::RequestHandler;
use phobos_lrs::config::{Config, SyncThresholds};
use phobos_lrs::dss::memory::MemoryDss;
use phobos_lrs::dss::Dss;
use phobos_lrs::error::{ErrorKind, LrsError};
use phobos_lrs::io_scheduler::PairingPolicy;
use phobos_lrs::model::{
    AdminStatus, DeviceRecord, FsStatus, FsType, LockRecord, MediumRecord, ResourceFamily, ResourceId,
};
use phobos_lrs::protocol::{NotifyOp, ReleaseEntry, Request, Response, WriteMediaSpec};
use phobos_lrs::registry::Registry;

const HOST: &str = "host-a";

fn quick_sync() -> SyncThresholds {
    // Trigger a flush on the very first release so tests don't need to
    // wait out the real age threshold.
    SyncThresholds { entries: 1, bytes: 1, age: Duration::from_secs(0) }
}

fn test_config(mount_prefix: PathBuf, family: ResourceFamily, sync: SyncThresholds) -> Config {
    Config {
        host: HOST.to_owned(),
        family,
        socket_path: mount_prefix.join("lrs.sock"),
        lock_file: mount_prefix.join("lrs.lock"),
        mount_prefix,
        policy: PairingPolicy::BestFit,
        sync,
        drive_compat: Default::default(),
        dss_endpoint: None,
    }
}

fn device_record(name: &str, model: &str, family: ResourceFamily) -> DeviceRecord {
    DeviceRecord {
        id: ResourceId::new(family, "lib0", name),
        model: model.to_owned(),
        host: HOST.to_owned(),
        admin_status: AdminStatus::Unlocked,
        lock: None,
    }
}

fn medium_record(name: &str, family: ResourceFamily, model: &str, free: u64, fs_status: FsStatus) -> MediumRecord {
    MediumRecord {
        id: ResourceId::new(family, "lib0", name),
        model: model.to_owned(),
        phys_spc_free: free,
        phys_spc_used: 0,
        logical_spc_written: 0,
        obj_count: 0,
        fs_type: FsType::Posix,
        fs_status,
        admin_status: AdminStatus::Unlocked,
        get: true,
        put: true,
        tags: BTreeSet::new(),
        lock: None,
    }
}

/// One drive wired up end to end: a device record in DSS, its kernel path
/// registered with the device adapter, a drive slot and medium slot in the
/// library adapter, and (optionally) free space seeded for the fs adapter.
struct Fixture {
    dss: Arc<MemoryDss>,
    library: Arc<MockLibraryAdapter>,
    registry: Arc<Registry>,
    family: ResourceFamily,
    #[allow(dead_code)]
    tmp: tempfile::TempDir,
}

impl Fixture {
    fn single_drive(family: ResourceFamily, sync: SyncThresholds) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dss = Arc::new(MemoryDss::new());
        dss.seed_device(device_record("D1", "LTO-drive", family));

        let mut device_adapter = MockDeviceAdapter::new();
        device_adapter.register("D1", "/dev/mock/d1", family, "LTO-drive");

        let library_adapter = Arc::new(MockLibraryAdapter::new());
        library_adapter.place_drive("D1", "slot-drive-1");

        let fs_adapter = MockFilesystemAdapter::new();
        fs_adapter.seed_space(
            std::path::Path::new("/dev/mock/d1"),
            SpaceReport { free_bytes: 1_000_000, used_bytes: 0 },
        );

        let backend = FamilyBackend {
            device: Arc::new(device_adapter),
            library: library_adapter.clone(),
            filesystem: Arc::new(fs_adapter),
        };

        let config = Arc::new(test_config(tmp.path().to_owned(), family, sync));
        let registry = Registry::new(config, dss.clone(), backend);
        registry.bootstrap().expect("bootstrap should succeed with no stale locks");

        Self { dss, library: library_adapter, registry, family, tmp }
    }

    /// Seeds a medium both in DSS and in its library slot (every medium
    /// must be reachable by `media_lookup` before a device thread can load
    /// it, the same way a real library only knows about media it was told
    /// to track).
    fn seed_medium(&self, name: &str, model: &str, free: u64, fs_status: FsStatus) -> ResourceId {
        let medium = medium_record(name, self.family, model, free, fs_status);
        let id = medium.id.clone();
        self.library.place_medium(name, &format!("slot-{name}"));
        self.dss.seed_medium(medium);
        id
    }

    fn medium(&self, id: &ResourceId) -> MediumRecord {
        self.dss
            .get_media(&phobos_lrs::dss::MediaFilter { id: Some(id.clone()), ..Default::default() })
            .unwrap()
            .into_iter()
            .next()
            .expect("medium must exist")
    }

    /// Two drives, both reachable from bootstrap. Which physical device
    /// ends up holding which medium is left to the scheduler; tests that
    /// need a fixed add-order (to pin down "first in iteration order")
    /// build the registry by hand instead, the way
    /// `notify_device_add_starts_a_new_drive` already does.
    fn two_drives(family: ResourceFamily, sync: SyncThresholds) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dss = Arc::new(MemoryDss::new());
        dss.seed_device(device_record("D1", "LTO-drive", family));
        dss.seed_device(device_record("D2", "LTO-drive", family));

        let mut device_adapter = MockDeviceAdapter::new();
        device_adapter.register("D1", "/dev/mock/d1", family, "LTO-drive");
        device_adapter.register("D2", "/dev/mock/d2", family, "LTO-drive");

        let library_adapter = Arc::new(MockLibraryAdapter::new());
        library_adapter.place_drive("D1", "slot-drive-1");
        library_adapter.place_drive("D2", "slot-drive-2");

        let fs_adapter = MockFilesystemAdapter::new();
        fs_adapter.seed_space(std::path::Path::new("/dev/mock/d1"), SpaceReport { free_bytes: 1_000_000, used_bytes: 0 });
        fs_adapter.seed_space(std::path::Path::new("/dev/mock/d2"), SpaceReport { free_bytes: 1_000_000, used_bytes: 0 });

        let backend = FamilyBackend {
            device: Arc::new(device_adapter),
            library: library_adapter.clone(),
            filesystem: Arc::new(fs_adapter),
        };

        let config = Arc::new(test_config(tmp.path().to_owned(), family, sync));
        let registry = Registry::new(config, dss.clone(), backend);
        registry.bootstrap().expect("bootstrap should succeed with no stale locks");

        Self { dss, library: library_adapter, registry, family, tmp }
    }
}

#[test]
fn ping_returns_pong() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let response = fixture.registry.handle(Request::Ping).unwrap();
    assert!(matches!(response, Response::Pong));
}

/// S1: a blank medium formatted with `unlock=true` comes back `ok` and DSS
/// reflects `fs_status=empty`, `admin_status=unlocked`.
#[test]
fn format_blank_medium_unlocks_it() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let id = fixture.seed_medium("M1", "LTO-8", 0, FsStatus::Blank);
    // Formatting a locked, never-yet-written medium (admin_status starts
    // unlocked here since DSS doesn't model a separate "newly imported"
    // state; `unlock` simply re-affirms it, matching a fresh import that
    // already reports unlocked).
    let response = fixture
        .registry
        .handle(Request::Format { id: id.clone(), fs: FsType::Posix, unlock: true, force: false })
        .unwrap();
    assert!(matches!(response, Response::Formatted { .. }));

    let medium = fixture.medium(&id);
    assert_eq!(medium.fs_status, FsStatus::Empty);
    assert_eq!(medium.admin_status, AdminStatus::Unlocked);
}

/// A second `Format{unlock=true}` on an already-formatted medium is no
/// longer blank and must be rejected without side effects.
#[test]
fn repeated_format_without_force_is_rejected() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let id = fixture.seed_medium("M1", "LTO-8", 0, FsStatus::Blank);
    fixture
        .registry
        .handle(Request::Format { id: id.clone(), fs: FsType::Posix, unlock: true, force: false })
        .unwrap();

    let err = fixture
        .registry
        .handle(Request::Format { id: id.clone(), fs: FsType::Posix, unlock: true, force: false })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

/// Write-allocate against a single empty drive: the only candidate medium
/// is selected, loaded and mounted, and the grant carries its mount path.
/// Releasing with `size_written == phys_spc_free` then drives the medium
/// to `full` (spec §8 boundary behaviour).
#[test]
fn write_allocate_fills_medium_to_capacity_then_releases_full() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let id = fixture.seed_medium("M1", "LTO-8", 100, FsStatus::Empty);

    let response = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 100, tags: vec![] }] })
        .unwrap();
    let grants = match response {
        Response::WriteAllocated { media } => media,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].id, id);

    let response = fixture
        .registry
        .handle(Request::Release { media: vec![ReleaseEntry { id: id.clone(), size_written: 100, rc: 0, to_sync: true }] })
        .unwrap();
    assert!(matches!(response, Response::Released));

    let medium = fixture.medium(&id);
    assert_eq!(medium.phys_spc_free, 0);
    assert_eq!(medium.fs_status, FsStatus::Full);
}

/// A write sized to exactly 0 bytes still allocates a medium and succeeds,
/// leaving free space unchanged (spec §8 boundary behaviour).
#[test]
fn zero_byte_write_allocates_without_changing_free_space() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let id = fixture.seed_medium("M1", "LTO-8", 500, FsStatus::Empty);

    let response = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 0, tags: vec![] }] })
        .unwrap();
    assert!(matches!(response, Response::WriteAllocated { .. }));

    fixture
        .registry
        .handle(Request::Release { media: vec![ReleaseEntry { id: id.clone(), size_written: 0, rc: 0, to_sync: false }] })
        .unwrap();

    assert_eq!(fixture.medium(&id).phys_spc_free, 500);
}

/// S2 (adapted to this implementation's synchronous client model): a
/// single drive with one writable medium serves one write at a time. A
/// second write issued while the first is still unreleased stays pending
/// rather than failing, and completes with the same medium once the first
/// caller releases it.
#[test]
fn second_write_waits_for_first_release_then_reuses_medium() {
    let fixture = Arc::new(Fixture::single_drive(ResourceFamily::Tape, quick_sync()));
    let id = fixture.seed_medium("M1", "LTO-8", 1_000, FsStatus::Empty);

    let first = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 1, tags: vec![] }] })
        .unwrap();
    assert!(matches!(first, Response::WriteAllocated { .. }));

    let (tx, rx) = mpsc::channel();
    let second_fixture = fixture.clone();
    std::thread::spawn(move || {
        let response = second_fixture
            .registry
            .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 1, tags: vec![] }] });
        tx.send(response).unwrap();
    });

    // The only drive is still busy with the first allocation; the second
    // request must not have resolved yet.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    fixture
        .registry
        .handle(Request::Release { media: vec![ReleaseEntry { id: id.clone(), size_written: 1, rc: 0, to_sync: true }] })
        .unwrap();

    let second = rx.recv_timeout(Duration::from_secs(5)).expect("second write should complete after release").unwrap();
    match second {
        Response::WriteAllocated { media } => assert_eq!(media[0].id, id),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// S5: a medium locked by a foreign `(host, pid)` is skipped by the
/// selector in favour of another writable medium.
#[test]
fn foreign_locked_medium_is_skipped_for_another() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    // Give the foreign-locked medium more free space than the legitimate one
    // so "whole fit" tie-breaking (which prefers the smaller fitting
    // candidate) can't accidentally land on it regardless of map iteration
    // order; the test only needs the selector to never return M1 at all.
    let mut foreign = medium_record("M1", fixture.family, "LTO-8", 10_000, FsStatus::Empty);
    foreign.lock = Some(LockRecord::new("host-b", 42));
    fixture.dss.seed_medium(foreign.clone());
    let other_id = fixture.seed_medium("M2", "LTO-8", 200, FsStatus::Empty);

    let response = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 10, tags: vec![] }] })
        .unwrap();
    match response {
        Response::WriteAllocated { media } => assert_eq!(media[0].id, other_id),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Read-allocate with `n_required = 1` out of two candidates succeeds as
/// soon as either medium is ready, without requiring the other.
#[test]
fn read_allocate_succeeds_with_first_of_n_required() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let present = fixture.seed_medium("M1", "LTO-8", 1_000, FsStatus::Used);
    let absent = ResourceId::new(fixture.family, "lib0", "M-does-not-exist");

    let response = fixture
        .registry
        .handle(Request::ReadAllocate { media: vec![present.clone(), absent], n_required: 1 })
        .unwrap();
    match response {
        Response::ReadAllocated { media } => {
            assert_eq!(media.len(), 1);
            assert_eq!(media[0].id, present);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

/// `Notify(DeviceAdd)` brings a drive the daemon didn't start with into the
/// live registry, after which it can serve a write.
#[test]
fn notify_device_add_starts_a_new_drive() {
    let tmp = tempfile::tempdir().unwrap();
    let dss = Arc::new(MemoryDss::new());
    let family = ResourceFamily::Directory;
    dss.seed_device(device_record("D1", "dir-backend", family));

    let mut device_adapter = MockDeviceAdapter::new();
    device_adapter.register("D1", "/dev/mock/d1", family, "dir-backend");
    let library_adapter = MockLibraryAdapter::new();
    library_adapter.place_drive("D1", "slot-drive-1");
    library_adapter.place_medium("M1", "slot-m1");
    let fs_adapter = MockFilesystemAdapter::new();
    fs_adapter.seed_space(std::path::Path::new("/dev/mock/d1"), SpaceReport { free_bytes: 1_000, used_bytes: 0 });

    let backend = FamilyBackend { device: Arc::new(device_adapter), library: Arc::new(library_adapter), filesystem: Arc::new(fs_adapter) };
    let config = Arc::new(test_config(tmp.path().to_owned(), family, quick_sync()));
    let registry = Registry::new(config, dss.clone(), backend);
    // No bootstrap call: the drive is unknown to the live registry until
    // notified, even though it is already unlocked in DSS.
    let id = ResourceId::new(family, "lib0", "M1");
    dss.seed_medium(medium_record("M1", family, "dir-backend", 1_000, FsStatus::Empty));

    let err = registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 10, tags: vec![] }] })
        .unwrap_err();
    assert!(matches!(err, LrsError::NoDevice));

    registry
        .handle(Request::Notify { op: NotifyOp::DeviceAdd, resource_id: ResourceId::new(family, "lib0", "D1"), wait: false })
        .unwrap();

    let response = registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 10, tags: vec![] }] })
        .unwrap();
    match response {
        Response::WriteAllocated { media } => assert_eq!(media[0].id, id),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// `Notify(DeviceLock)` removes a drive from the live registry and marks it
/// locked in DSS.
#[test]
fn notify_device_lock_removes_drive_from_registry() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let device_id = ResourceId::new(fixture.family, "lib0", "D1");

    fixture
        .registry
        .handle(Request::Notify { op: NotifyOp::DeviceLock, resource_id: device_id.clone(), wait: false })
        .unwrap();

    let record = fixture
        .dss
        .get_devices(&phobos_lrs::dss::DeviceFilter { id: Some(device_id.clone()), ..Default::default() })
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(record.admin_status, AdminStatus::Locked);

    // With its only drive locked away, a write can no longer be served.
    let err = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 1, tags: vec![] }] })
        .unwrap_err();
    assert!(matches!(err, LrsError::NoDevice));
}

#[test]
fn configure_is_acknowledged_as_a_no_op() {
    let fixture = Fixture::single_drive(ResourceFamily::Tape, quick_sync());
    let response = fixture.registry.handle(Request::Configure { op: "noop".into(), json: serde_json::json!({}) }).unwrap();
    assert!(matches!(response, Response::Configured));
}

/// S6: once a medium is driven to `full` by a release that exhausts its
/// free space, the next `WriteAllocate` selects the other writable medium
/// instead of the same one.
#[test]
fn second_write_allocate_selects_other_medium_once_first_is_full() {
    let fixture = Fixture::two_drives(ResourceFamily::Tape, quick_sync());
    let full_id = fixture.seed_medium("M1", "LTO-8", 100, FsStatus::Empty);
    let other_id = fixture.seed_medium("M2", "LTO-8", 500, FsStatus::Empty);

    let first = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 100, tags: vec![] }] })
        .unwrap();
    let first_id = match first {
        Response::WriteAllocated { media } => media[0].id.clone(),
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(first_id, full_id);

    fixture
        .registry
        .handle(Request::Release { media: vec![ReleaseEntry { id: full_id.clone(), size_written: 100, rc: 0, to_sync: true }] })
        .unwrap();
    assert_eq!(fixture.medium(&full_id).fs_status, FsStatus::Full);

    let second = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 100, tags: vec![] }] })
        .unwrap();
    match second {
        Response::WriteAllocated { media } => assert_eq!(media[0].id, other_id),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// S4: `Notify(DeviceLock)` on a device mid-write waits for the in-flight
/// sub-request to drain before removing the device and releasing its lock
/// (invariant 3: a locked device is never torn down out from under
/// in-flight I/O).
#[test]
fn notify_device_lock_waits_for_in_flight_write_to_drain() {
    let fixture = Arc::new(Fixture::single_drive(ResourceFamily::Tape, quick_sync()));
    let id = fixture.seed_medium("M1", "LTO-8", 1_000, FsStatus::Empty);
    let device_id = ResourceId::new(fixture.family, "lib0", "D1");

    let write = fixture
        .registry
        .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 1, tags: vec![] }] })
        .unwrap();
    assert!(matches!(write, Response::WriteAllocated { .. }));

    let (tx, rx) = mpsc::channel();
    let lock_fixture = fixture.clone();
    let lock_device_id = device_id.clone();
    std::thread::spawn(move || {
        let response = lock_fixture
            .registry
            .handle(Request::Notify { op: NotifyOp::DeviceLock, resource_id: lock_device_id, wait: false });
        tx.send(response).unwrap();
    });

    // The grant is still outstanding; the lock notify must wait rather than
    // tear the device down out from under it.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    fixture
        .registry
        .handle(Request::Release { media: vec![ReleaseEntry { id: id.clone(), size_written: 1, rc: 0, to_sync: true }] })
        .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).expect("device lock should complete once the write drains").unwrap();

    assert!(fixture
        .registry
        .lock_manager()
        .status(phobos_lrs::dss::LockableKind::Device, &device_id)
        .unwrap()
        .is_none());
}

/// S3: with two mounted media of adequate size, `PairingPolicy::BestFit`
/// prefers the medium whose free space most closely matches the request
/// while `PairingPolicy::FirstFit` takes whichever qualifying device was
/// added first, regardless of fit — the two policies must actually
/// diverge on the same layout.
#[test]
fn pairing_policy_best_fit_vs_first_fit_diverge() {
    fn medium_chosen_by(policy: PairingPolicy) -> ResourceId {
        let tmp = tempfile::tempdir().unwrap();
        let dss = Arc::new(MemoryDss::new());
        let family = ResourceFamily::Tape;
        dss.seed_device(device_record("D1", "LTO-drive", family));
        dss.seed_device(device_record("D2", "LTO-drive", family));

        let mut device_adapter = MockDeviceAdapter::new();
        device_adapter.register("D1", "/dev/mock/d1", family, "LTO-drive");
        device_adapter.register("D2", "/dev/mock/d2", family, "LTO-drive");

        let library_adapter = Arc::new(MockLibraryAdapter::new());
        library_adapter.place_drive("D1", "slot-drive-1");
        library_adapter.place_drive("D2", "slot-drive-2");

        let fs_adapter = MockFilesystemAdapter::new();
        fs_adapter.seed_space(std::path::Path::new("/dev/mock/d1"), SpaceReport { free_bytes: 1_000_000, used_bytes: 0 });
        fs_adapter.seed_space(std::path::Path::new("/dev/mock/d2"), SpaceReport { free_bytes: 1_000_000, used_bytes: 0 });

        let backend = FamilyBackend {
            device: Arc::new(device_adapter),
            library: library_adapter.clone(),
            filesystem: Arc::new(fs_adapter),
        };
        let mut config = test_config(tmp.path().to_owned(), family, quick_sync());
        config.policy = policy;
        let registry = Registry::new(Arc::new(config), dss.clone(), backend);

        // Add the two drives to the live registry in a fixed order (D1
        // first) so "first in iteration order" is deterministic regardless
        // of the DSS's own storage order.
        registry
            .handle(Request::Notify { op: NotifyOp::DeviceAdd, resource_id: ResourceId::new(family, "lib0", "D1"), wait: false })
            .unwrap();
        registry
            .handle(Request::Notify { op: NotifyOp::DeviceAdd, resource_id: ResourceId::new(family, "lib0", "D2"), wait: false })
            .unwrap();

        // One request with two media: the scheduler pairs the first
        // sub-request before the second, so by the time the second is
        // paired the first device is already busy and the two land on
        // different drives. Sizes are chosen so medium selection is
        // unambiguous regardless of map iteration order: 500 only "loose"
        // (free=600) can satisfy, 40 only "tight" (free=50) whole-fits.
        library_adapter.place_medium("loose", "slot-loose");
        library_adapter.place_medium("tight", "slot-tight");
        dss.seed_medium(medium_record("loose", family, "LTO-drive", 600, FsStatus::Empty));
        dss.seed_medium(medium_record("tight", family, "LTO-drive", 50, FsStatus::Empty));

        registry
            .handle(Request::WriteAllocate {
                media: vec![WriteMediaSpec { size: 500, tags: vec![] }, WriteMediaSpec { size: 40, tags: vec![] }],
            })
            .unwrap();

        let loose_id = ResourceId::new(family, "lib0", "loose");
        let tight_id = ResourceId::new(family, "lib0", "tight");
        registry
            .handle(Request::Release {
                media: vec![
                    ReleaseEntry { id: loose_id.clone(), size_written: 0, rc: 0, to_sync: false },
                    ReleaseEntry { id: tight_id.clone(), size_written: 0, rc: 0, to_sync: false },
                ],
            })
            .unwrap();

        // D1 (added first) now mounts "loose" (free=600), D2 mounts
        // "tight" (free=50). A write of 40 fits both.
        let response = registry
            .handle(Request::WriteAllocate { media: vec![WriteMediaSpec { size: 40, tags: vec![] }] })
            .unwrap();
        match response {
            Response::WriteAllocated { media } => media[0].id.clone(),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    let tight_id = ResourceId::new(ResourceFamily::Tape, "lib0", "tight");
    let loose_id = ResourceId::new(ResourceFamily::Tape, "lib0", "loose");

    assert_eq!(medium_chosen_by(PairingPolicy::BestFit), tight_id);
    assert_eq!(medium_chosen_by(PairingPolicy::FirstFit), loose_id);
}
