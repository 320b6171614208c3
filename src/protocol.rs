//! Wire protocol (spec §6 "Client protocol"): the request/response
//! envelopes carried as length-prefixed JSON frames over the Unix socket.
//! Modelled the same way the teacher's `mbus-api::v0` enumerates message
//! kinds with serde derives, minus the message-bus channel routing this
//! daemon doesn't need.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{FsType, ResourceId};

/// A size/tags pair describing one medium to allocate for a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMediaSpec {
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A (medium id, written bytes, return code, sync-now flag) tuple reported
/// back by the client once it has finished writing or reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub id: ResourceId,
    pub size_written: u64,
    pub rc: i32,
    pub to_sync: bool,
}

/// A notify sub-operation (spec §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyOp {
    DeviceAdd,
    DeviceLock,
    DeviceUnlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
    Ping,
    WriteAllocate { media: Vec<WriteMediaSpec> },
    ReadAllocate { media: Vec<ResourceId>, n_required: usize },
    Release { media: Vec<ReleaseEntry> },
    Format { id: ResourceId, fs: FsType, unlock: bool, force: bool },
    Notify { op: NotifyOp, resource_id: ResourceId, wait: bool },
    Configure { op: String, json: serde_json::Value },
}

impl Request {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::WriteAllocate { .. } => "write_allocate",
            Request::ReadAllocate { .. } => "read_allocate",
            Request::Release { .. } => "release",
            Request::Format { .. } => "format",
            Request::Notify { .. } => "notify",
            Request::Configure { .. } => "configure",
        }
    }
}

/// An allocated medium slot returned to the client in a write or read
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaGrant {
    pub id: ResourceId,
    pub mount_path: PathBuf,
    pub fs_type: FsType,
    /// Address-format discriminator: how the client should address bytes
    /// on this medium (POSIX path vs. RADOS object key vs. LTFS file).
    pub address_format: String,
    /// Present on write responses only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_space: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Response {
    Pong,
    WriteAllocated { media: Vec<MediaGrant> },
    ReadAllocated { media: Vec<MediaGrant> },
    Released,
    Formatted { free_space: u64 },
    Notified,
    Configured,
}

/// A signed numeric error code plus the request kind it originated from
/// (spec §6 "An error response carries a signed numeric code ... and the
/// originating request-kind tag").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: i32,
    pub request_kind: String,
    pub message: String,
}

/// The full framed envelope: client-chosen id plus payload or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub payload: EnvelopePayload<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum EnvelopePayload<T> {
    Ok { body: T },
    Err { error: ErrorEnvelope },
}

pub type RequestEnvelope = Envelope<Request>;
pub type ResponseEnvelope = Envelope<Response>;
