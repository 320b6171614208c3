//! Notify handling (spec §4.6): `DeviceAdd`, `DeviceLock`, `DeviceUnlock`.
//! Grounded on the teacher's `node::service` device-registration flow
//! (look up in the store, mutate the in-memory registry, start/stop the
//! owning worker).

use std::sync::Arc;

use tracing::info;

use crate::device::{Device, OperationalState};
use crate::dispatcher::Dispatcher;
use crate::dss::{Dss, DeviceFilter};
use crate::error::{LrsError, LrsResult};
use crate::lock_manager::LockManager;
use crate::model::{AdminStatus, ResourceFamily, ResourceId};

/// Everything a notify handler needs to add/remove a device from the live
/// registry, without owning the backend adapters itself (those are
/// supplied per-call so this module stays backend-agnostic).
pub struct NotifyContext<'a> {
    pub dss: &'a Arc<dyn Dss>,
    pub lock_manager: &'a Arc<LockManager>,
    pub dispatcher: &'a Dispatcher,
    pub family: ResourceFamily,
    pub host: String,
}

/// Builds a `Device` and starts its thread for a newly discovered drive
/// (spec §4.6 "`DeviceAdd(name)`"). The actual adapter wiring is supplied
/// by the caller (`registry`) since that is family-specific.
pub type DeviceBuilder<'a> = dyn Fn(crate::model::DeviceRecord) -> Arc<Device> + 'a;

impl NotifyContext<'_> {
    /// `DeviceAdd(name)`: look up `(host, family, name, admin-status =
    /// unlocked)` in DSS, append it to the live device list, start its
    /// thread.
    pub fn device_add(&self, name: &str, build: &DeviceBuilder) -> LrsResult<()> {
        let filter = DeviceFilter {
            id: None,
            family: Some(self.family),
            host: Some(self.host.clone()),
            admin_status: Some(AdminStatus::Unlocked),
        };
        let record = self
            .dss
            .get_devices(&filter)?
            .into_iter()
            .find(|d| d.id.name == name)
            .ok_or_else(|| LrsError::DeviceNotFound { id: ResourceId::new(self.family, "", name) })?;

        self.lock_manager.acquire(crate::dss::LockableKind::Device, &record.id)?;

        let device = build(record);
        let device_for_thread = device.clone();
        std::thread::Builder::new()
            .name(format!("phobos-device-{}", device.id.name))
            .spawn(move || device_for_thread.run())
            .map_err(|err| LrsError::IoError { resource: device.id.clone(), details: err.to_string() })?;

        info!(device = %device.id, "device added and thread started");
        self.dispatcher.add_device(device);
        Ok(())
    }

    /// `DeviceLock(name)`: ask the device thread to finish ongoing work,
    /// wait for it to actually drain, then remove it from the registry and
    /// release its DSS lock (spec §4.6, invariant 3 "a locked device is
    /// never torn down out from under in-flight I/O").
    pub fn device_lock(&self, name: &str) -> LrsResult<()> {
        let id = ResourceId::new(self.family, "", name);
        let device = self
            .dispatcher
            .devices_snapshot()
            .into_iter()
            .find(|d| d.id.name == name)
            .ok_or_else(|| LrsError::DeviceNotFound { id: id.clone() })?;

        self.dss.update_device_admin_status(&device.id, AdminStatus::Locked)?;
        device.request_shutdown();
        device.wait_drained();
        self.dispatcher.remove_device(&device.id);
        self.lock_manager.release(crate::dss::LockableKind::Device, &device.id, false)?;
        info!(device = %device.id, "device locked, drained, and removed from registry");
        Ok(())
    }

    /// `DeviceUnlock`: flip admin-status on the in-memory record, or (if
    /// absent) fall through to `DeviceAdd`.
    pub fn device_unlock(&self, name: &str, build: &DeviceBuilder) -> LrsResult<()> {
        let existing = self.dispatcher.devices_snapshot().into_iter().find(|d| d.id.name == name);
        match existing {
            Some(device) => {
                self.dss.update_device_admin_status(&device.id, AdminStatus::Unlocked)?;
                info!(device = %device.id, "device unlocked");
                Ok(())
            }
            None => self.device_add(name, build),
        }
    }
}

/// Whether `OperationalState::Failed` devices should be skipped when
/// notify operations scan the live registry (always true, spec §4.2
/// "failed device is skipped by all pickers").
pub fn is_pickable(state: OperationalState) -> bool {
    state != OperationalState::Failed
}
