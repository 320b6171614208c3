//! etcd-backed `Dss` implementation.
//!
//! Grounded on the teacher's `persistent_store.rs`: the DSS client lives on
//! a dedicated tokio runtime thread (`etcd-client` requires an async
//! runtime) and every call from the synchronous, OS-thread-based scheduler
//! core is bridged across via a bounded `tokio::sync::mpsc` command queue
//! plus a one-shot reply, exactly the way `PersistentStore::execute_store_op`
//! hands a future to the reactor and awaits a oneshot completion.

use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use tokio::sync::{mpsc, oneshot};

use crate::error::{LrsError, LrsResult};
use crate::model::{AdminStatus, DeviceRecord, Identity, LockRecord, MediumRecord, ResourceId};

use super::{DeviceFilter, Dss, LockableKind, MediaFilter};

const KEY_PREFIX: &str = "/phobos";

fn medium_key(id: &ResourceId) -> String {
    format!("{KEY_PREFIX}/medium/{}/{}/{}", id.family, id.library, id.name)
}

fn device_key(id: &ResourceId) -> String {
    format!("{KEY_PREFIX}/device/{}/{}/{}", id.family, id.library, id.name)
}

fn lock_key(kind: LockableKind, id: &ResourceId) -> String {
    let kind = match kind {
        LockableKind::Device => "device",
        LockableKind::Medium => "medium",
    };
    format!("{KEY_PREFIX}/lock/{kind}/{}/{}/{}", id.family, id.library, id.name)
}

enum Command {
    GetMedia(MediaFilter, oneshot::Sender<LrsResult<Vec<MediumRecord>>>),
    UpdateMedium(MediumRecord, oneshot::Sender<LrsResult<()>>),
    SetMedium(MediumRecord, oneshot::Sender<LrsResult<()>>),
    GetDevices(DeviceFilter, oneshot::Sender<LrsResult<Vec<DeviceRecord>>>),
    UpdateDeviceAdminStatus(ResourceId, AdminStatus, oneshot::Sender<LrsResult<()>>),
    LockAcquire(LockableKind, ResourceId, Identity, oneshot::Sender<LrsResult<()>>),
    LockRelease(LockableKind, ResourceId, Identity, bool, oneshot::Sender<LrsResult<()>>),
    LockStatus(LockableKind, ResourceId, oneshot::Sender<LrsResult<Option<LockRecord>>>),
    LockClean(LockableKind, String, u32, oneshot::Sender<LrsResult<Vec<ResourceId>>>),
}

/// DSS client backed by etcd. Cheap to clone; every instance shares the
/// same background runtime thread and command queue.
#[derive(Clone)]
pub struct EtcdDss {
    cmd_tx: mpsc::Sender<Command>,
}

impl EtcdDss {
    /// Connects to etcd at `endpoint`, spawning the dedicated I/O thread.
    /// Mirrors `PersistentStore::connect_to_backing_store`: the connection
    /// itself happens on the runtime thread, not on the caller's thread.
    pub fn connect(endpoint: &str) -> LrsResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let endpoint = endpoint.to_owned();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("phobos-dss-io".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let client = match Client::connect([endpoint.as_str()], None).await {
                        Ok(client) => client,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err.to_string()));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    run_command_loop(client, cmd_rx).await;
                });
            })
            .map_err(|err| LrsError::Dss { details: err.to_string() })?;

        ready_rx
            .recv()
            .map_err(|err| LrsError::Dss { details: err.to_string() })?
            .map_err(|details| LrsError::Dss { details })?;

        Ok(Self { cmd_tx })
    }

    fn send_and_wait<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<LrsResult<T>>) -> Command,
    ) -> LrsResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .blocking_send(build(tx))
            .map_err(|_| LrsError::Dss { details: "DSS I/O thread is gone".into() })?;
        rx.blocking_recv()
            .map_err(|_| LrsError::Dss { details: "DSS I/O thread dropped the reply".into() })?
    }
}

impl Dss for EtcdDss {
    fn get_media(&self, filter: &MediaFilter) -> LrsResult<Vec<MediumRecord>> {
        self.send_and_wait(|tx| Command::GetMedia(filter.clone(), tx))
    }

    fn update_medium(&self, medium: &MediumRecord) -> LrsResult<()> {
        self.send_and_wait(|tx| Command::UpdateMedium(medium.clone(), tx))
    }

    fn set_medium(&self, medium: &MediumRecord) -> LrsResult<()> {
        self.send_and_wait(|tx| Command::SetMedium(medium.clone(), tx))
    }

    fn get_devices(&self, filter: &DeviceFilter) -> LrsResult<Vec<DeviceRecord>> {
        self.send_and_wait(|tx| Command::GetDevices(filter.clone(), tx))
    }

    fn update_device_admin_status(&self, id: &ResourceId, status: AdminStatus) -> LrsResult<()> {
        self.send_and_wait(|tx| Command::UpdateDeviceAdminStatus(id.clone(), status, tx))
    }

    fn lock_acquire(&self, kind: LockableKind, id: &ResourceId, owner: &Identity) -> LrsResult<()> {
        self.send_and_wait(|tx| Command::LockAcquire(kind, id.clone(), owner.clone(), tx))
    }

    fn lock_release(&self, kind: LockableKind, id: &ResourceId, owner: &Identity, force: bool) -> LrsResult<()> {
        self.send_and_wait(|tx| Command::LockRelease(kind, id.clone(), owner.clone(), force, tx))
    }

    fn lock_status(&self, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>> {
        self.send_and_wait(|tx| Command::LockStatus(kind, id.clone(), tx))
    }

    fn lock_clean(&self, kind: LockableKind, host: &str, pid: u32) -> LrsResult<Vec<ResourceId>> {
        self.send_and_wait(|tx| Command::LockClean(kind, host.to_owned(), pid, tx))
    }
}

async fn run_command_loop(client: Client, mut cmd_rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        let mut client = client.clone();
        tokio::spawn(async move {
            match cmd {
                Command::GetMedia(filter, reply) => {
                    let _ = reply.send(get_media(&mut client, &filter).await);
                }
                Command::UpdateMedium(medium, reply) => {
                    let _ = reply.send(put_medium(&mut client, &medium).await);
                }
                Command::SetMedium(medium, reply) => {
                    let _ = reply.send(put_medium(&mut client, &medium).await);
                }
                Command::GetDevices(filter, reply) => {
                    let _ = reply.send(get_devices(&mut client, &filter).await);
                }
                Command::UpdateDeviceAdminStatus(id, status, reply) => {
                    let _ = reply.send(update_device_admin_status(&mut client, &id, status).await);
                }
                Command::LockAcquire(kind, id, owner, reply) => {
                    let _ = reply.send(lock_acquire(&mut client, kind, &id, &owner).await);
                }
                Command::LockRelease(kind, id, owner, force, reply) => {
                    let _ = reply.send(lock_release(&mut client, kind, &id, &owner, force).await);
                }
                Command::LockStatus(kind, id, reply) => {
                    let _ = reply.send(lock_status(&mut client, kind, &id).await);
                }
                Command::LockClean(kind, host, pid, reply) => {
                    let _ = reply.send(lock_clean(&mut client, kind, &host, pid).await);
                }
            }
        });
    }
}

fn dss_err(details: impl ToString) -> LrsError {
    LrsError::Dss { details: details.to_string() }
}

async fn fetch_lock(client: &mut Client, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>> {
    let resp = client.get(lock_key(kind, id), None).await.map_err(dss_err)?;
    match resp.kvs().first() {
        Some(kv) => Ok(Some(serde_json::from_slice(kv.value()).map_err(dss_err)?)),
        None => Ok(None),
    }
}

async fn get_media(client: &mut Client, filter: &MediaFilter) -> LrsResult<Vec<MediumRecord>> {
    let prefix = format!("{KEY_PREFIX}/medium/");
    let resp = client
        .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
        .await
        .map_err(dss_err)?;
    let mut out = Vec::new();
    for kv in resp.kvs() {
        let mut medium: MediumRecord = serde_json::from_slice(kv.value()).map_err(dss_err)?;
        medium.lock = fetch_lock(client, LockableKind::Medium, &medium.id).await?;
        if filter.matches(&medium) {
            out.push(medium);
        }
    }
    Ok(out)
}

async fn put_medium(client: &mut Client, medium: &MediumRecord) -> LrsResult<()> {
    let mut stored = medium.clone();
    stored.lock = None; // locks are tracked in their own keys
    let value = serde_json::to_vec(&stored).map_err(dss_err)?;
    client.put(medium_key(&medium.id), value, None).await.map_err(dss_err)?;
    Ok(())
}

async fn get_devices(client: &mut Client, filter: &DeviceFilter) -> LrsResult<Vec<DeviceRecord>> {
    let prefix = format!("{KEY_PREFIX}/device/");
    let resp = client
        .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
        .await
        .map_err(dss_err)?;
    let mut out = Vec::new();
    for kv in resp.kvs() {
        let mut device: DeviceRecord = serde_json::from_slice(kv.value()).map_err(dss_err)?;
        device.lock = fetch_lock(client, LockableKind::Device, &device.id).await?;
        if filter.matches(&device) {
            out.push(device);
        }
    }
    Ok(out)
}

async fn update_device_admin_status(client: &mut Client, id: &ResourceId, status: AdminStatus) -> LrsResult<()> {
    let resp = client.get(device_key(id), None).await.map_err(dss_err)?;
    let kv = resp.kvs().first().ok_or_else(|| LrsError::DeviceNotFound { id: id.clone() })?;
    let mut device: DeviceRecord = serde_json::from_slice(kv.value()).map_err(dss_err)?;
    device.admin_status = status;
    device.lock = None;
    let value = serde_json::to_vec(&device).map_err(dss_err)?;
    client.put(device_key(id), value, None).await.map_err(dss_err)?;
    Ok(())
}

/// Atomic create-if-absent using an etcd transaction: the lock is granted
/// only if its key does not exist yet (create_revision == 0).
async fn lock_acquire(client: &mut Client, kind: LockableKind, id: &ResourceId, owner: &Identity) -> LrsResult<()> {
    let key = lock_key(kind, id);
    let lock = LockRecord::new(owner.host.clone(), owner.pid);
    let value = serde_json::to_vec(&lock).map_err(dss_err)?;

    let txn = Txn::new()
        .when(vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
        .and_then(vec![TxnOp::put(key.as_str(), value, None)])
        .or_else(vec![TxnOp::get(key.as_str(), None)]);

    let resp = client.txn(txn).await.map_err(dss_err)?;
    if resp.succeeded() {
        return Ok(());
    }
    // Lost the race: surface who holds it so the caller can classify
    // Busy vs AlreadyLocked.
    match fetch_lock(client, kind, id).await? {
        Some(existing) if existing.owned_by(&owner.host, owner.pid) => Ok(()),
        Some(_) => Err(LrsError::Busy { resource: id.clone() }),
        None => Err(LrsError::Busy { resource: id.clone() }),
    }
}

async fn lock_release(
    client: &mut Client,
    kind: LockableKind,
    id: &ResourceId,
    owner: &Identity,
    force: bool,
) -> LrsResult<()> {
    match fetch_lock(client, kind, id).await? {
        None => Ok(()),
        Some(existing) if force || existing.owned_by(&owner.host, owner.pid) => {
            client.delete(lock_key(kind, id), None).await.map_err(dss_err)?;
            Ok(())
        }
        Some(_) => Err(LrsError::AlreadyLocked { resource: id.clone() }),
    }
}

async fn lock_status(client: &mut Client, kind: LockableKind, id: &ResourceId) -> LrsResult<Option<LockRecord>> {
    fetch_lock(client, kind, id).await
}

async fn lock_clean(client: &mut Client, kind: LockableKind, host: &str, pid: u32) -> LrsResult<Vec<ResourceId>> {
    let prefix = format!("{KEY_PREFIX}/lock/{}/", match kind {
        LockableKind::Device => "device",
        LockableKind::Medium => "medium",
    });
    let resp = client
        .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
        .await
        .map_err(dss_err)?;

    let mut cleaned = Vec::new();
    let mut ids_by_key = Vec::new();
    for kv in resp.kvs() {
        let lock: LockRecord = match serde_json::from_slice(kv.value()) {
            Ok(lock) => lock,
            Err(_) => continue,
        };
        if lock.owned_by(host, pid) {
            if let Some(id) = parse_resource_id(&prefix, kv.key_str().unwrap_or_default()) {
                ids_by_key.push((kv.key().to_vec(), id));
            }
        }
    }
    for (key, id) in ids_by_key {
        client.delete(key, None).await.map_err(dss_err)?;
        cleaned.push(id);
    }
    Ok(cleaned)
}

fn parse_resource_id(prefix: &str, key: &str) -> Option<ResourceId> {
    let rest = key.strip_prefix(prefix)?;
    let mut parts = rest.splitn(3, '/');
    let family = match parts.next()? {
        "tape" => crate::model::ResourceFamily::Tape,
        "directory" => crate::model::ResourceFamily::Directory,
        "rados-pool" => crate::model::ResourceFamily::RadosPool,
        _ => return None,
    };
    let library = parts.next()?.to_owned();
    let name = parts.next()?.to_owned();
    Some(ResourceId { family, library, name })
}
