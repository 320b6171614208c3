//! In-memory test doubles for the three backend traits, used by scenario
//! tests the way the teacher's `composer` stands in for real bdevs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::{FsType, ResourceFamily};

use super::{
    BackendResult, DeviceAdapter, DeviceInfo, DriveSlot, FilesystemAdapter, LibraryAdapter, SpaceReport,
};

/// A mock device adapter backed by a fixed serial -> path/info map.
#[derive(Default)]
pub struct MockDeviceAdapter {
    devices: HashMap<String, (PathBuf, DeviceInfo)>,
}

impl MockDeviceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, serial: &str, path: impl Into<PathBuf>, family: ResourceFamily, model: &str) {
        self.devices.insert(
            serial.to_owned(),
            (path.into(), DeviceInfo { family, model: model.to_owned(), serial: serial.to_owned() }),
        );
    }
}

#[async_trait::async_trait]
impl DeviceAdapter for MockDeviceAdapter {
    async fn lookup(&self, serial: &str) -> BackendResult<PathBuf> {
        self.devices
            .get(serial)
            .map(|(path, _)| path.clone())
            .ok_or_else(|| super::BackendError::DeviceNotFound { serial: serial.to_owned() })
    }

    async fn query(&self, path: &Path) -> BackendResult<DeviceInfo> {
        self.devices
            .values()
            .find(|(p, _)| p == path)
            .map(|(_, info)| info.clone())
            .ok_or_else(|| super::BackendError::DeviceNotFound { serial: path.display().to_string() })
    }
}

/// A mock library adapter: slots and drives are plain string addresses,
/// media_move just updates an in-memory occupancy map.
pub struct MockLibraryAdapter {
    state: Mutex<LibraryState>,
}

#[derive(Default)]
struct LibraryState {
    /// address -> medium label occupying it, if any.
    occupancy: HashMap<String, Option<String>>,
    /// drive serial -> current address.
    drives: HashMap<String, String>,
}

impl MockLibraryAdapter {
    pub fn new() -> Self {
        Self { state: Mutex::new(LibraryState::default()) }
    }

    pub fn place_drive(&self, serial: &str, address: &str) {
        let mut state = self.state.lock().unwrap();
        state.drives.insert(serial.to_owned(), address.to_owned());
        state.occupancy.entry(address.to_owned()).or_insert(None);
    }

    pub fn place_medium(&self, label: &str, address: &str) {
        let mut state = self.state.lock().unwrap();
        state.occupancy.insert(address.to_owned(), Some(label.to_owned()));
    }
}

#[async_trait::async_trait]
impl LibraryAdapter for MockLibraryAdapter {
    async fn open(&self, _device: &DeviceInfo) -> BackendResult<()> {
        Ok(())
    }

    async fn close(&self, _device: &DeviceInfo) -> BackendResult<()> {
        Ok(())
    }

    async fn drive_lookup(&self, serial: &str) -> BackendResult<DriveSlot> {
        let state = self.state.lock().unwrap();
        let address = state
            .drives
            .get(serial)
            .cloned()
            .ok_or_else(|| super::BackendError::DeviceNotFound { serial: serial.to_owned() })?;
        let loaded_medium = state.occupancy.get(&address).cloned().flatten();
        Ok(DriveSlot { address, loaded_medium })
    }

    async fn media_lookup(&self, label: &str) -> BackendResult<String> {
        let state = self.state.lock().unwrap();
        state
            .occupancy
            .iter()
            .find(|(_, occupant)| occupant.as_deref() == Some(label))
            .map(|(address, _)| address.clone())
            .ok_or_else(|| super::BackendError::MediumNotFound { label: label.to_owned() })
    }

    async fn media_move(&self, src: &str, dst: &str) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(_)) = state.occupancy.get(dst) {
            return Err(super::BackendError::MoveProhibited { src: src.to_owned(), dst: dst.to_owned() });
        }
        let medium = state.occupancy.get(src).cloned().flatten();
        state.occupancy.insert(src.to_owned(), None);
        state.occupancy.insert(dst.to_owned(), medium);
        Ok(())
    }

    async fn find_free_slot(&self) -> BackendResult<String> {
        let state = self.state.lock().unwrap();
        state
            .occupancy
            .iter()
            .find(|(_, occupant)| occupant.is_none())
            .map(|(address, _)| address.clone())
            .ok_or(super::BackendError::NoFreeSlot)
    }

    async fn scan(&self) -> BackendResult<serde_json::Value> {
        let state = self.state.lock().unwrap();
        Ok(serde_json::json!({ "occupancy": state.occupancy }))
    }
}

/// A mock filesystem adapter: mount state and space are tracked per path.
pub struct MockFilesystemAdapter {
    state: Mutex<FsState>,
}

#[derive(Default)]
struct FsState {
    mounts: HashMap<PathBuf, PathBuf>,
    space: HashMap<PathBuf, SpaceReport>,
    labels: HashMap<PathBuf, String>,
}

impl MockFilesystemAdapter {
    pub fn new() -> Self {
        Self { state: Mutex::new(FsState::default()) }
    }

    pub fn seed_space(&self, device: &Path, report: SpaceReport) {
        self.state.lock().unwrap().space.insert(device.to_owned(), report);
    }
}

#[async_trait::async_trait]
impl FilesystemAdapter for MockFilesystemAdapter {
    async fn mount(&self, device: &Path, mount_point: &Path, _fs: FsType) -> BackendResult<()> {
        self.state.lock().unwrap().mounts.insert(device.to_owned(), mount_point.to_owned());
        Ok(())
    }

    async fn umount(&self, mount_point: &Path) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.mounts.retain(|_, mp| mp != mount_point);
        Ok(())
    }

    async fn mounted(&self, device: &Path) -> BackendResult<Option<PathBuf>> {
        Ok(self.state.lock().unwrap().mounts.get(device).cloned())
    }

    async fn format(&self, device: &Path, label: &str, _fs: FsType) -> BackendResult<SpaceReport> {
        let mut state = self.state.lock().unwrap();
        state.labels.insert(device.to_owned(), label.to_owned());
        Ok(state.space.get(device).copied().unwrap_or(SpaceReport { free_bytes: 0, used_bytes: 0 }))
    }

    async fn df(&self, mount_point: &Path) -> BackendResult<SpaceReport> {
        let state = self.state.lock().unwrap();
        let device = state.mounts.iter().find(|(_, mp)| mp.as_path() == mount_point).map(|(dev, _)| dev.clone());
        Ok(device.and_then(|dev| state.space.get(&dev).copied()).unwrap_or(SpaceReport { free_bytes: 0, used_bytes: 0 }))
    }

    async fn get_label(&self, mount_point: &Path) -> BackendResult<String> {
        let state = self.state.lock().unwrap();
        let device = state
            .mounts
            .iter()
            .find(|(_, mp)| mp.as_path() == mount_point)
            .map(|(dev, _)| dev.clone())
            .ok_or_else(|| super::BackendError::Io { details: format!("{} is not mounted", mount_point.display()) })?;
        state
            .labels
            .get(&device)
            .cloned()
            .ok_or_else(|| super::BackendError::Io { details: "no label set".into() })
    }

    async fn sync(&self, _mount_point: &Path) -> BackendResult<()> {
        Ok(())
    }
}
