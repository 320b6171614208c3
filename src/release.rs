//! Release / Sync Coordinator front door (spec §4.7): turns a client's
//! `Release` request into per-device `enqueue_sync`/`clear_ongoing_io`
//! calls. The sync-trigger, flush and cancellation logic itself lives on
//! `Device` (§4.2/§4.7 are one state machine); this module is the
//! request-routing layer on top, grounded on the teacher's
//! `volume/service.rs` share/unshare handlers that fan a single client
//! call out across the owning resource's current state.

use std::sync::Arc;

use crate::device::Device;
use crate::error::{LrsError, LrsResult};
use crate::protocol::ReleaseEntry;
use crate::request::RequestContainer;

/// Processes one `Release` request: for each entry, find the device that
/// currently holds the named medium and route the release to it.
pub fn handle_release(
    devices: &[Arc<Device>],
    container: &Arc<RequestContainer>,
    entries: &[ReleaseEntry],
) -> LrsResult<()> {
    for (medium_index, entry) in entries.iter().enumerate() {
        let device = devices
            .iter()
            .find(|d| d.loaded_medium().as_ref() == Some(&entry.id))
            .ok_or_else(|| LrsError::MediumNotFound { id: entry.id.clone() })?;

        device.clear_ongoing_io();

        if entry.size_written > 0 || entry.to_sync {
            device.enqueue_sync(container.clone(), medium_index, entry.size_written);
        }
    }
    Ok(())
}
