//! In-memory `Dss` double used by unit and scenario tests, standing in for
//! the real transactional store the way the teacher's `composer`-driven
//! tests stand in for real mayastor instances.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{LrsError, LrsResult};
use crate::model::{AdminStatus, DeviceRecord, Identity, LockRecord, MediumRecord, ResourceId};

use super::{DeviceFilter, Dss, LockableKind, MediaFilter};

#[derive(Default)]
struct State {
    media: HashMap<ResourceId, MediumRecord>,
    devices: HashMap<ResourceId, DeviceRecord>,
    medium_locks: HashMap<ResourceId, LockRecord>,
    device_locks: HashMap<ResourceId, LockRecord>,
}

/// An in-memory stand-in for the DSS transactional store.
pub struct MemoryDss {
    state: Mutex<State>,
}

impl Default for MemoryDss {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDss {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Seed a medium record directly (test fixture helper).
    pub fn seed_medium(&self, medium: MediumRecord) {
        let mut state = self.state.lock().unwrap();
        if let Some(lock) = medium.lock.clone() {
            state.medium_locks.insert(medium.id.clone(), lock);
        }
        state.media.insert(medium.id.clone(), medium);
    }

    /// Seed a device record directly (test fixture helper).
    pub fn seed_device(&self, device: DeviceRecord) {
        let mut state = self.state.lock().unwrap();
        if let Some(lock) = device.lock.clone() {
            state.device_locks.insert(device.id.clone(), lock);
        }
        state.devices.insert(device.id.clone(), device);
    }

    fn locks(state: &mut State, kind: LockableKind) -> &mut HashMap<ResourceId, LockRecord> {
        match kind {
            LockableKind::Device => &mut state.device_locks,
            LockableKind::Medium => &mut state.medium_locks,
        }
    }
}

impl Dss for MemoryDss {
    fn get_media(&self, filter: &MediaFilter) -> LrsResult<Vec<MediumRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .media
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .map(|mut m| {
                m.lock = state.medium_locks.get(&m.id).cloned();
                m
            })
            .collect())
    }

    fn update_medium(&self, medium: &MediumRecord) -> LrsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.media.contains_key(&medium.id) {
            return Err(LrsError::MediumNotFound { id: medium.id.clone() });
        }
        let mut medium = medium.clone();
        medium.lock = state.medium_locks.get(&medium.id).cloned();
        state.media.insert(medium.id.clone(), medium);
        Ok(())
    }

    fn set_medium(&self, medium: &MediumRecord) -> LrsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.media.insert(medium.id.clone(), medium.clone());
        Ok(())
    }

    fn get_devices(&self, filter: &DeviceFilter) -> LrsResult<Vec<DeviceRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .map(|mut d| {
                d.lock = state.device_locks.get(&d.id).cloned();
                d
            })
            .collect())
    }

    fn update_device_admin_status(&self, id: &ResourceId, status: AdminStatus) -> LrsResult<()> {
        let mut state = self.state.lock().unwrap();
        let device = state.devices.get_mut(id).ok_or_else(|| LrsError::DeviceNotFound { id: id.clone() })?;
        device.admin_status = status;
        Ok(())
    }

    fn lock_acquire(&self, kind: LockableKind, id: &ResourceId, owner: &Identity) -> LrsResult<()> {
        let mut state = self.state.lock().unwrap();
        let locks = Self::locks(&mut state, kind);
        if let Some(existing) = locks.get(id) {
            if !existing.owned_by(&owner.host, owner.pid) {
                return Err(LrsError::Busy { resource: id.clone() });
            }
            return Ok(());
        }
        locks.insert(id.clone(), LockRecord::new(owner.host.clone(), owner.pid));
        Ok(())
    }

    fn lock_release(&self, kind: LockableKind, id: &ResourceId, owner: &Identity, force: bool) -> LrsResult<()> {
        let mut state = self.state.lock().unwrap();
        let locks = Self::locks(&mut state, kind);
        match locks.get(id) {
            Some(existing) if force || existing.owned_by(&owner.host, owner.pid) => {
                locks.remove(id);
                Ok(())
            }
            Some(_) => Err(LrsError::AlreadyLocked { resource: id.clone() }),
            None => Ok(()),
        }
    }

    fn lock_status(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::locks(&mut state, kind).get(id).cloned())
    }

    fn lock_clean(&self, kind: LockableKind, host: &str, pid: u32) -> LrsResult<Vec<ResourceId>> {
        let mut state = self.state.lock().unwrap();
        let locks = Self::locks(&mut state, kind);
        let stale: Vec<ResourceId> = locks
            .iter()
            .filter(|(_, lock)| lock.owned_by(host, pid))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            locks.remove(id);
        }
        Ok(stale)
    }
}
