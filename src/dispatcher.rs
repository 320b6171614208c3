//! Request Dispatcher / Scheduler Thread (spec §4.5). One thread per
//! family; a polling loop with a coarse 100ms tick plus an explicit wake-up
//! on enqueue, grounded on the teacher's `node/watchdog.rs` poll-and-act
//! loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::device::{Device, DeviceWork, OperationalState};
use crate::dss::Dss;
use crate::error::{ErrorKind, LrsError};
use crate::io_scheduler::{IoScheduler, PendingSubRequest, SubRequestKind};
use crate::model::ResourceId;
use crate::registry::IncomingItem;
use crate::request::{SubRequestOutcome, SubRequestStatus};

/// Shared wake signal: the incoming queue push and the 100ms tick both
/// notify this condvar (spec §5 "Suspension points").
#[derive(Default)]
pub struct WakeSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn wake(&self) {
        self.condvar.notify_all();
    }

    fn wait_tick(&self) {
        let guard = self.mutex.lock().unwrap();
        let _ = self.condvar.wait_timeout(guard, Duration::from_millis(100)).unwrap();
    }
}

/// Per-family scheduler thread state.
pub struct Dispatcher {
    devices: Mutex<Vec<Arc<Device>>>,
    scheduler: Arc<IoScheduler>,
    dss: Arc<dyn Dss>,
    incoming: Receiver<IncomingItem>,
    /// Lets the dispatcher thread itself report a permanently failed
    /// sub-request (spec §4.5 "on permanent failure emit an error
    /// response"), on the same channel every device thread's completion
    /// already travels on so a single collector can wake either kind of
    /// waiter.
    outgoing: Sender<SubRequestOutcome>,
    wake: Arc<WakeSignal>,
    shutdown: AtomicBool,
    host: String,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devices: Vec<Arc<Device>>,
        scheduler: Arc<IoScheduler>,
        dss: Arc<dyn Dss>,
        incoming: Receiver<IncomingItem>,
        outgoing: Sender<SubRequestOutcome>,
        wake: Arc<WakeSignal>,
        host: String,
    ) -> Self {
        Self { devices: Mutex::new(devices), scheduler, dss, incoming, outgoing, wake, shutdown: AtomicBool::new(false), host }
    }

    pub fn add_device(&self, device: Arc<Device>) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn remove_device(&self, id: &ResourceId) -> Option<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();
        let pos = devices.iter().position(|d| &d.id == id)?;
        Some(devices.remove(pos))
    }

    pub fn devices_snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.wake();
    }

    /// The scheduler thread main loop (spec §4.5, steps 1-4).
    pub fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.drain_on_shutdown();
                return;
            }

            self.drain_retry_queue();
            self.drain_incoming_queue();

            let devices = self.devices_snapshot();
            self.scheduler.dispatch_devices(&devices);
            self.pair_pending(&devices);

            self.wake.wait_tick();
        }
    }

    /// Step 1: drain the retry queue.
    fn drain_retry_queue(&self) {
        for mut item in self.scheduler.drain_retry() {
            let devices = self.devices_snapshot();
            match self.try_pair(&devices, &item) {
                Ok(true) => {}
                Ok(false) => self.scheduler.requeue(item),
                Err(err) if err.kind() == ErrorKind::Again => self.scheduler.requeue(item),
                Err(err) => {
                    item.sub_request.status = SubRequestStatus::Error;
                    self.emit_permanent_failure(item, err);
                }
            }
        }
    }

    /// Step 2: drain the incoming queue. Validation and inline handling of
    /// notify/ping/configure requests happens in `registry`; by the time an
    /// item reaches here it is already a sub-request ready for pairing.
    fn drain_incoming_queue(&self) {
        while let Ok(item) = self.incoming.try_recv() {
            match item {
                IncomingItem::SubRequest(pending) => self.scheduler.push(*pending),
                IncomingItem::Inline(responder) => responder(),
            }
        }
    }

    /// Step 4: attempt to pair every still-pending sub-request.
    fn pair_pending(&self, devices: &[Arc<Device>]) {
        let mut carried = Vec::new();
        while let Some(item) = self.scheduler.pop_pending() {
            match self.try_pair(devices, &item) {
                Ok(true) => {}
                Ok(false) => carried.push(item),
                Err(err) if err.kind() == ErrorKind::Again => carried.push(item),
                Err(err) => self.emit_permanent_failure(item, err),
            }
        }
        for item in carried {
            self.scheduler.push(item);
        }
    }

    fn try_pair(&self, devices: &[Arc<Device>], item: &PendingSubRequest) -> Result<bool, LrsError> {
        if devices.is_empty() {
            return Err(LrsError::NoDevice);
        }

        if let SubRequestKind::Format { fs, unlock, force } = item.kind {
            let medium_id = item
                .resource_id
                .clone()
                .ok_or_else(|| LrsError::Protocol { details: "format sub-request missing medium id".into() })?;
            let device = devices
                .iter()
                .find(|d| d.loaded_medium().as_ref() == Some(&medium_id) && d.is_free())
                .or_else(|| devices.iter().find(|d| d.is_free() && d.state() == OperationalState::Empty));
            return Ok(match device {
                Some(device) => {
                    self.publish_format(device, item, medium_id, fs, unlock, force);
                    true
                }
                None => false,
            });
        }

        if let Some(medium_id) = &item.resource_id {
            if item.n_required.is_some() {
                // read
                return Ok(match self.scheduler.pair_for_read(devices, medium_id) {
                    Some(device) => {
                        self.publish_allocate(&device, item, medium_id.clone());
                        true
                    }
                    None => false,
                });
            }
        }

        let size = item.size_hint.unwrap_or(0);
        let already: Vec<ResourceId> = item.resource_id.iter().cloned().collect();
        match self.scheduler.pair_for_write(devices, size, &item.tags, &already, &self.host)? {
            Some((device, medium_id)) => {
                self.publish_allocate(&device, item, medium_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn publish_allocate(&self, device: &Arc<Device>, item: &PendingSubRequest, medium_id: ResourceId) {
        let work = DeviceWork::Allocate {
            container: item.container.clone(),
            medium_index: item.sub_request.medium_index,
            medium_id,
            size_hint: item.size_hint,
        };
        self.scheduler.publish(device, work);
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_format(
        &self,
        device: &Arc<Device>,
        item: &PendingSubRequest,
        medium_id: ResourceId,
        fs: crate::model::FsType,
        unlock: bool,
        force: bool,
    ) {
        let work = DeviceWork::Format {
            container: item.container.clone(),
            medium_index: item.sub_request.medium_index,
            medium_id,
            fs,
            unlock,
            force,
        };
        self.scheduler.publish(device, work);
    }

    fn emit_permanent_failure(&self, item: PendingSubRequest, err: LrsError) {
        warn!(container = item.container.id, error = %err, "sub-request failed permanently");
        let medium_index = item.sub_request.medium_index;
        item.container.record(medium_index, Err(err.clone()));
        item.container.mark_failed();
        self.rollback_done_siblings(&item.container, medium_index);
        let _ = self.outgoing.send(SubRequestOutcome { container: item.container, medium_index, result: Err(err) });
    }

    /// Invariant 6: a request never settles with a mix of `done` and
    /// `error` media. Any sibling sub-request in this container that
    /// already reached `done` is rolled back to `cancel` here, and the
    /// device holding its medium is freed the same way `release::
    /// handle_release` frees one on a client-initiated release.
    fn rollback_done_siblings(&self, container: &Arc<crate::request::RequestContainer>, failed_index: usize) {
        let cancelled = container.cancel_done_siblings(failed_index);
        if cancelled.is_empty() {
            return;
        }
        let devices = self.devices_snapshot();
        for medium_id in cancelled {
            warn!(container = container.id, medium = %medium_id, "rolling back already-done sibling after sibling failure");
            if let Some(device) = devices.iter().find(|d| d.loaded_medium().as_ref() == Some(&medium_id)) {
                device.clear_ongoing_io();
            }
        }
    }

    fn drain_on_shutdown(&self) {
        info!("scheduler shutting down, cancelling in-flight requests");
        for item in self.scheduler.drain_retry() {
            item.container.mark_failed();
            let medium_index = item.sub_request.medium_index;
            item.container.record(medium_index, Err(LrsError::Shutdown));
            let _ = self.outgoing.send(SubRequestOutcome { container: item.container, medium_index, result: Err(LrsError::Shutdown) });
        }
        while let Some(item) = self.scheduler.pop_pending() {
            item.container.mark_failed();
            let medium_index = item.sub_request.medium_index;
            item.container.record(medium_index, Err(LrsError::Shutdown));
            let _ = self.outgoing.send(SubRequestOutcome { container: item.container, medium_index, result: Err(LrsError::Shutdown) });
        }
        while let Ok(item) = self.incoming.try_recv() {
            if let IncomingItem::SubRequest(pending) = item {
                pending.container.mark_failed();
                let medium_index = pending.sub_request.medium_index;
                pending.container.record(medium_index, Err(LrsError::Shutdown));
                let _ = self.outgoing.send(SubRequestOutcome { container: pending.container, medium_index, result: Err(LrsError::Shutdown) });
            }
        }
        for device in self.devices_snapshot() {
            device.request_shutdown();
        }
    }
}
