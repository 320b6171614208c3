//! Top-level orchestration (spec §4.5 step 2, §6 startup sequence). Owns
//! the DSS handle, the lock manager, the per-family backend, the scheduler
//! thread (`Dispatcher`) and the live device set, and translates decoded
//! `Request`s into either an inline reply or a `RequestContainer` fed to
//! the scheduler's incoming queue.
//!
//! Grounded on the teacher's `core::registry::Registry` (the single struct
//! a `node-agent`/`core-agent` binary builds at startup and hands to every
//! gRPC service), generalized here to own a crossbeam-channel incoming
//! queue instead of a tonic server.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::backend;
use crate::backend::FamilyBackend;
use crate::comm::RequestHandler;
use crate::config::Config;
use crate::device::{Device, OperationalState};
use crate::dispatcher::{Dispatcher, WakeSignal};
use crate::dss::{DeviceFilter, Dss, LockableKind};
use crate::error::{LrsError, LrsResult};
use crate::io_scheduler::{IoScheduler, PendingSubRequest, SubRequestKind};
use crate::lock_manager::LockManager;
use crate::model::{AdminStatus, DeviceRecord, Identity, ResourceId};
use crate::notify::{DeviceBuilder, NotifyContext};
use crate::protocol::{MediaGrant, NotifyOp, ReleaseEntry, Request, Response, WriteMediaSpec};
use crate::release;
use crate::request::{RequestContainer, SubRequest, SubRequestOutcome};

/// One unit handed from a comm-thread (or the startup code) to the
/// scheduler thread's incoming queue (spec §4.5 step 2/step 3).
pub enum IncomingItem {
    SubRequest(Box<PendingSubRequest>),
    /// A closure run inline on the scheduler thread, used for operations
    /// that must be serialized with pairing (device add/lock/unlock).
    Inline(Box<dyn FnOnce() + Send>),
}

struct PendingWaiter {
    n_required: Option<usize>,
    notify: Sender<()>,
}

/// Everything a single-family daemon instance needs to serve requests.
pub struct Registry {
    dss: Arc<dyn Dss>,
    lock_manager: Arc<LockManager>,
    dispatcher: Arc<Dispatcher>,
    wake: Arc<WakeSignal>,
    config: Arc<Config>,
    backend: FamilyBackend,
    incoming_tx: Sender<IncomingItem>,
    outgoing_tx: Sender<SubRequestOutcome>,
    socket_counter: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, PendingWaiter>>>,
}

impl Registry {
    /// Builds a `Registry` with no devices yet attached; call `bootstrap`
    /// to reclaim stale locks and start every already-known device, and
    /// the `Notify` request kind to add devices discovered afterwards.
    pub fn new(config: Arc<Config>, dss: Arc<dyn Dss>, backend: FamilyBackend) -> Arc<Self> {
        let identity = Identity::current(config.host.clone());
        let lock_manager = Arc::new(LockManager::new(dss.clone(), identity));
        let scheduler = Arc::new(IoScheduler::new(config.family, config.clone(), dss.clone()));
        let wake = Arc::new(WakeSignal::default());
        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::unbounded();

        let dispatcher = Arc::new(Dispatcher::new(
            Vec::new(),
            scheduler.clone(),
            dss.clone(),
            incoming_rx,
            outgoing_tx.clone(),
            wake.clone(),
            config.host.clone(),
        ));

        let pending = Arc::new(Mutex::new(HashMap::new()));
        spawn_completion_collector(outgoing_rx, pending.clone());

        let registry = Arc::new(Self {
            dss,
            lock_manager,
            dispatcher,
            wake,
            config,
            backend,
            incoming_tx,
            outgoing_tx,
            socket_counter: AtomicU64::new(1),
            pending,
        });

        let dispatcher_for_thread = registry.dispatcher.clone();
        std::thread::Builder::new()
            .name("phobos-scheduler".into())
            .spawn(move || dispatcher_for_thread.run())
            .expect("failed to start scheduler thread");

        registry
    }

    pub fn dss(&self) -> &Arc<dyn Dss> {
        &self.dss
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn request_shutdown(&self) {
        self.dispatcher.request_shutdown();
    }

    fn next_socket_id(&self) -> u64 {
        self.socket_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Startup sequence (spec §6 "Persistent state layout" / §4.1 "the
    /// startup `clean_stale_locks` pass"): reclaim stale locks left by a
    /// previous crashed instance of this daemon, then build and start a
    /// thread for every device already marked unlocked for this host.
    pub fn bootstrap(self: &Arc<Self>) -> LrsResult<()> {
        for kind in [LockableKind::Device, LockableKind::Medium] {
            let cleaned = self.lock_manager.clean_stale_locks(kind)?;
            if !cleaned.is_empty() {
                warn!(count = cleaned.len(), ?kind, "cleaned stale locks from a previous instance");
            }
        }

        let filter = DeviceFilter {
            id: None,
            family: Some(self.config.family),
            host: Some(self.config.host.clone()),
            admin_status: Some(AdminStatus::Unlocked),
        };
        for record in self.dss.get_devices(&filter)? {
            if let Err(err) = self.start_device(record) {
                warn!(error = %err, "failed to start device at startup, leaving it unmanaged");
            }
        }
        Ok(())
    }

    fn start_device(self: &Arc<Self>, record: DeviceRecord) -> LrsResult<()> {
        self.lock_manager.acquire(LockableKind::Device, &record.id)?;
        let (state, medium, mount_path) = self.discover_initial_state(&record);
        let device = Device::new(
            record,
            state,
            medium,
            mount_path,
            self.dss.clone(),
            self.lock_manager.clone(),
            self.backend.device.clone(),
            self.backend.library.clone(),
            self.backend.filesystem.clone(),
            self.config.clone(),
            self.outgoing_tx.clone(),
        );
        let device_for_thread = device.clone();
        std::thread::Builder::new()
            .name(format!("phobos-device-{}", device.id.name))
            .spawn(move || device_for_thread.run())
            .map_err(|err| LrsError::IoError { resource: device.id.clone(), details: err.to_string() })?;
        info!(device = %device.id, "device started");
        self.dispatcher.add_device(device);
        Ok(())
    }

    fn notify_context(&self) -> NotifyContext<'_> {
        NotifyContext {
            dss: &self.dss,
            lock_manager: &self.lock_manager,
            dispatcher: &self.dispatcher,
            family: self.config.family,
            host: self.config.host.clone(),
        }
    }

    /// Builds a `Device` for a record discovered via `Notify(DeviceAdd)`,
    /// sharing this registry's backend adapters.
    fn build_device(&self, record: DeviceRecord) -> Arc<Device> {
        let (state, medium, mount_path) = self.discover_initial_state(&record);
        Device::new(
            record,
            state,
            medium,
            mount_path,
            self.dss.clone(),
            self.lock_manager.clone(),
            self.backend.device.clone(),
            self.backend.library.clone(),
            self.backend.filesystem.clone(),
            self.config.clone(),
            self.outgoing_tx.clone(),
        )
    }

    /// Refreshes physical state from the library/filesystem back-ends at
    /// device-add time (spec §3 lifecycle: "refresh physical state from the
    /// back-end at startup" rather than always assuming empty, since a
    /// daemon restart leaves tapes physically loaded/mounted in drives).
    /// Falls back to `Empty`/`None`/`None` on any lookup failure, since an
    /// adapter that cannot answer is equivalent to "unknown, start cold".
    fn discover_initial_state(&self, record: &DeviceRecord) -> (OperationalState, Option<ResourceId>, Option<PathBuf>) {
        let empty = (OperationalState::Empty, None, None);

        let drive = match backend::block_on(self.backend.library.drive_lookup(&record.id.name)) {
            Ok(drive) => drive,
            Err(_) => return empty,
        };
        let Some(label) = drive.loaded_medium else {
            return empty;
        };

        let media = match self.dss.get_media(&crate::dss::MediaFilter { family: Some(self.config.family), ..Default::default() }) {
            Ok(media) => media,
            Err(_) => return empty,
        };
        let Some(medium_id) = media.into_iter().find(|m| m.id.name == label).map(|m| m.id) else {
            warn!(device = %record.id, medium = %label, "library reports a loaded medium with no matching DSS record, starting empty");
            return empty;
        };

        let device_path = match backend::block_on(self.backend.device.lookup(&record.id.name)) {
            Ok(path) => path,
            Err(_) => return (OperationalState::Loaded, Some(medium_id), None),
        };
        match backend::block_on(self.backend.filesystem.mounted(&device_path)) {
            Ok(Some(mount_path)) => {
                info!(device = %record.id, medium = %medium_id, "recovered already-mounted medium at startup");
                (OperationalState::Mounted, Some(medium_id), Some(mount_path))
            }
            _ => {
                info!(device = %record.id, medium = %medium_id, "recovered already-loaded medium at startup");
                (OperationalState::Loaded, Some(medium_id), None)
            }
        }
    }

    fn register_waiter(&self, container_id: u64, n_required: Option<usize>) -> Receiver<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pending.lock().unwrap().insert(container_id, PendingWaiter { n_required, notify: tx });
        rx
    }

    fn forget_waiter(&self, container_id: u64) {
        self.pending.lock().unwrap().remove(&container_id);
    }

    fn handle_write_allocate(&self, media: Vec<WriteMediaSpec>) -> LrsResult<Response> {
        let socket_id = self.next_socket_id();
        let placeholder_ids: Vec<ResourceId> = (0..media.len())
            .map(|i| ResourceId::new(self.config.family, "", format!("pending-write-{i}")))
            .collect();
        let container = Arc::new(RequestContainer::new(
            socket_id,
            Request::WriteAllocate { media: media.clone() },
            placeholder_ids,
        ));

        let rx = self.register_waiter(container.id, None);
        for (i, spec) in media.iter().enumerate() {
            let pending = PendingSubRequest {
                container: container.clone(),
                sub_request: SubRequest::new(container.id, i),
                resource_id: None,
                size_hint: Some(spec.size),
                tags: spec.tags.iter().cloned().collect::<BTreeSet<_>>(),
                n_required: None,
                kind: SubRequestKind::Allocate,
            };
            let _ = self.incoming_tx.send(IncomingItem::SubRequest(Box::new(pending)));
        }
        self.wake.wake();

        rx.recv().map_err(|_| LrsError::Shutdown)?;
        self.assemble_response(&container, None, |grants| Response::WriteAllocated { media: grants })
    }

    fn handle_read_allocate(&self, media: Vec<ResourceId>, n_required: usize) -> LrsResult<Response> {
        if n_required == 0 || n_required > media.len() {
            return Err(LrsError::InvalidArgument {
                details: format!("n_required {n_required} out of range for {} candidates", media.len()),
            });
        }

        let socket_id = self.next_socket_id();
        let container = Arc::new(RequestContainer::new(
            socket_id,
            Request::ReadAllocate { media: media.clone(), n_required },
            media.clone(),
        ));

        let rx = self.register_waiter(container.id, Some(n_required));
        for (i, medium_id) in media.iter().enumerate() {
            let pending = PendingSubRequest {
                container: container.clone(),
                sub_request: SubRequest::new(container.id, i),
                resource_id: Some(medium_id.clone()),
                size_hint: None,
                tags: BTreeSet::new(),
                n_required: Some(n_required),
                kind: SubRequestKind::Allocate,
            };
            let _ = self.incoming_tx.send(IncomingItem::SubRequest(Box::new(pending)));
        }
        self.wake.wake();

        rx.recv().map_err(|_| LrsError::Shutdown)?;
        self.assemble_response(&container, Some(n_required), |grants| Response::ReadAllocated { media: grants })
    }

    fn handle_format(&self, id: ResourceId, fs: crate::model::FsType, unlock: bool, force: bool) -> LrsResult<Response> {
        let socket_id = self.next_socket_id();
        let container = Arc::new(RequestContainer::new(
            socket_id,
            Request::Format { id: id.clone(), fs, unlock, force },
            vec![id.clone()],
        ));

        let rx = self.register_waiter(container.id, None);
        let pending = PendingSubRequest {
            container: container.clone(),
            sub_request: SubRequest::new(container.id, 0),
            resource_id: Some(id),
            size_hint: None,
            tags: BTreeSet::new(),
            n_required: None,
            kind: SubRequestKind::Format { fs, unlock, force },
        };
        let _ = self.incoming_tx.send(IncomingItem::SubRequest(Box::new(pending)));
        self.wake.wake();

        rx.recv().map_err(|_| LrsError::Shutdown)?;
        let outcomes = container.take_outcomes();
        match outcomes.into_iter().next().flatten() {
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(err),
            None => Err(LrsError::Shutdown),
        }
    }

    fn handle_release(&self, media: Vec<ReleaseEntry>) -> LrsResult<Response> {
        let socket_id = self.next_socket_id();
        let ids: Vec<ResourceId> = media.iter().map(|e| e.id.clone()).collect();
        let container = Arc::new(RequestContainer::new(socket_id, Request::Release { media: media.clone() }, ids));

        let rx = self.register_waiter(container.id, None);
        let devices = self.dispatcher.devices_snapshot();
        if let Err(err) = release::handle_release(&devices, &container, &media) {
            self.forget_waiter(container.id);
            return Err(err);
        }

        rx.recv().map_err(|_| LrsError::Shutdown)?;
        for outcome in container.take_outcomes() {
            if let Some(Err(err)) = outcome {
                return Err(err);
            }
        }
        Ok(Response::Released)
    }

    fn handle_notify(&self, op: NotifyOp, resource_id: ResourceId, _wait: bool) -> LrsResult<Response> {
        let ctx = self.notify_context();
        let build: &DeviceBuilder = &|record: DeviceRecord| self.build_device(record);
        match op {
            NotifyOp::DeviceAdd => ctx.device_add(&resource_id.name, build),
            NotifyOp::DeviceLock => ctx.device_lock(&resource_id.name),
            NotifyOp::DeviceUnlock => ctx.device_unlock(&resource_id.name, build),
        }?;
        Ok(Response::Notified)
    }

    fn handle_configure(&self, op: String, _json: serde_json::Value) -> LrsResult<Response> {
        // spec §4.6/§6 "Configure": an operator escape hatch reserved for
        // future runtime tuning knobs (sync thresholds, policy). No
        // configure operations are defined yet; any op name is accepted
        // and acknowledged, matching the teacher's forward-compatible
        // `Configure` RPC stub.
        info!(op = %op, "configure request acknowledged (no-op)");
        Ok(Response::Configured)
    }

    fn assemble_response(
        &self,
        container: &Arc<RequestContainer>,
        n_required: Option<usize>,
        build: impl Fn(Vec<MediaGrant>) -> Response,
    ) -> LrsResult<Response> {
        let outcomes = container.take_outcomes();
        let mut grants = Vec::new();
        for outcome in outcomes {
            match outcome {
                Some(Ok(Response::WriteAllocated { media })) | Some(Ok(Response::ReadAllocated { media })) => {
                    grants.extend(media);
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(_)) | None => {}
            }
        }
        if let Some(n) = n_required {
            if grants.len() < n {
                return Err(LrsError::Shutdown);
            }
            grants.truncate(n);
        }
        Ok(build(grants))
    }
}

impl RequestHandler for Registry {
    fn handle(&self, request: Request) -> LrsResult<Response> {
        match request {
            Request::Ping => Ok(Response::Pong),
            Request::WriteAllocate { media } => self.handle_write_allocate(media),
            Request::ReadAllocate { media, n_required } => self.handle_read_allocate(media, n_required),
            Request::Release { media } => self.handle_release(media),
            Request::Format { id, fs, unlock, force } => self.handle_format(id, fs, unlock, force),
            Request::Notify { op, resource_id, wait } => self.handle_notify(op, resource_id, wait),
            Request::Configure { op, json } => self.handle_configure(op, json),
        }
    }
}

/// Consumes the shared outgoing-outcome channel and wakes whichever
/// comm-thread is blocked waiting on a now-complete container (spec §5
/// "The outgoing response queue is shared by all threads").
fn spawn_completion_collector(outgoing_rx: Receiver<SubRequestOutcome>, pending: Arc<Mutex<HashMap<u64, PendingWaiter>>>) {
    std::thread::Builder::new()
        .name("phobos-completion".into())
        .spawn(move || {
            for outcome in outgoing_rx.iter() {
                let container = outcome.container;
                let complete = {
                    let guard = pending.lock().unwrap();
                    guard.get(&container.id).map(|w| container.is_complete(w.n_required)).unwrap_or(false)
                };
                if complete {
                    if let Some(waiter) = pending.lock().unwrap().remove(&container.id) {
                        let _ = waiter.notify.send(());
                    }
                }
            }
        })
        .expect("failed to start completion collector thread");
}
