//! Communication Boundary (spec §6 "Client protocol"): a length-prefixed
//! framing layer over a Unix stream socket, one thread per connection plus
//! the listener thread, handing decoded requests to the registry's
//! incoming queue and writing back responses as they complete.
//!
//! The teacher frames NATS messages through `mbus-api`; there is no NATS
//! here, so this module is written fresh in the same length-prefixed,
//! serde-driven spirit (a 4-byte big-endian length header followed by a
//! JSON body), grounded on the general framing idiom used across the pack's
//! `io-engine` gRPC/jsonrpc adapters (`jsonrpc`) for request/response
//! correlation by id.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snafu::Snafu;
use tracing::{debug, error, info, warn};

use crate::protocol::{Envelope, EnvelopePayload, ErrorEnvelope, Request, Response};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum CommError {
    #[snafu(display("failed to bind socket at '{}': {}", path.display(), source))]
    Bind { path: PathBuf, source: io::Error },
    #[snafu(display("frame of {} bytes exceeds the {} byte limit", size, limit))]
    FrameTooLarge { size: u32, limit: u32 },
    #[snafu(display("I/O error on socket: {}", source))]
    Io { source: io::Error },
    #[snafu(display("malformed frame: {}", source))]
    Decode { source: serde_json::Error },
}

/// Reads one length-prefixed JSON frame from `stream`.
pub fn read_frame<T: serde::de::DeserializeOwned>(stream: &mut UnixStream) -> Result<Option<T>, CommError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(source) => return Err(CommError::Io { source }),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CommError::FrameTooLarge { size: len, limit: MAX_FRAME_BYTES });
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).map_err(|source| CommError::Io { source })?;
    let value = serde_json::from_slice(&body).map_err(|source| CommError::Decode { source })?;
    Ok(Some(value))
}

/// Writes one length-prefixed JSON frame to `stream`.
pub fn write_frame<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> Result<(), CommError> {
    let body = serde_json::to_vec(value).map_err(|source| CommError::Decode { source })?;
    let len = u32::try_from(body.len()).map_err(|_| CommError::FrameTooLarge { size: u32::MAX, limit: MAX_FRAME_BYTES })?;
    stream.write_all(&len.to_be_bytes()).map_err(|source| CommError::Io { source })?;
    stream.write_all(&body).map_err(|source| CommError::Io { source })?;
    Ok(())
}

/// Handles decoded requests. Implemented by `registry::Registry`; kept as
/// a trait here so the comm layer has no compile-time dependency on
/// scheduler internals.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Result<Response, crate::error::LrsError>;
}

/// Binds the Unix socket and serves connections until `shutdown` is
/// requested. One thread per connection, matching §5's "communication
/// thread blocks on the socket" (a pool of such threads here, one per
/// open client connection, rather than a single blocking thread, since an
/// LRS may serve more than one client concurrently).
pub struct CommServer {
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: Arc<AtomicBool>,
}

impl CommServer {
    /// Binds `path`, unlinking a stale socket file left behind by a
    /// previous crashed instance first (spec §C "stale-socket unlink").
    pub fn bind(path: &Path, handler: Arc<dyn RequestHandler>) -> Result<Self, CommError> {
        if path.exists() {
            warn!(path = %path.display(), "removing stale socket file");
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(|source| CommError::Bind { path: path.to_owned(), source })?;
        set_socket_mode(path);
        Ok(Self { listener, handler, shutdown: Arc::new(AtomicBool::new(false)) })
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown; spawns one thread per
    /// connection.
    pub fn serve(&self) {
        self.listener.set_nonblocking(true).ok();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("comm server shutting down, no longer accepting connections");
                return;
            }
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let handler = self.handler.clone();
                    std::thread::spawn(move || serve_connection(stream, handler));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(err) => {
                    error!(error = %err, "accept() failed");
                }
            }
        }
    }
}

fn serve_connection(mut stream: UnixStream, handler: Arc<dyn RequestHandler>) {
    stream.set_nonblocking(false).ok();
    loop {
        let envelope: Envelope<Request> = match read_frame(&mut stream) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "connection closed on framing error");
                return;
            }
        };

        let id = envelope.id;
        let request_kind = match &envelope.payload {
            EnvelopePayload::Ok { body } => body.kind_tag(),
            EnvelopePayload::Err { .. } => "unknown",
        };

        let response = match envelope.payload {
            EnvelopePayload::Ok { body } => match handler.handle(body) {
                Ok(response) => EnvelopePayload::Ok { body: response },
                Err(err) => EnvelopePayload::Err {
                    error: ErrorEnvelope { code: err.kind().code(), request_kind: request_kind.to_owned(), message: err.to_string() },
                },
            },
            EnvelopePayload::Err { error } => EnvelopePayload::Err { error },
        };

        let reply = Envelope { id, payload: response };
        if let Err(err) = write_frame(&mut stream, &reply) {
            debug!(error = %err, "failed to write response, dropping connection");
            return;
        }
    }
}

#[cfg(unix)]
fn set_socket_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path) {}
