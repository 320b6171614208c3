//! Request container and sub-request types (spec §3). A `RequestContainer`
//! is the unit the scheduler thread enqueues; a `SubRequest` is the unit a
//! device thread actually works on, one per named medium.
//!
//! Grounded on the teacher's mbus-api request/reply envelopes
//! (`mbus-api/src/v0.rs`): an immutable request payload plus mutable
//! response state collected as replies arrive, except here the mutable
//! state is shared across sub-requests rather than awaited end-to-end by
//! a single async call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::LrsError;
use crate::model::ResourceId;
use crate::protocol::{Request, Response};

/// Monotonically increasing container id, used only for logging/ordering;
/// the client-chosen request id travels inside `Request`/`Response`.
static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Status of one sub-request against one medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRequestStatus {
    Todo,
    Done,
    Error,
    Cancel,
}

/// A (request, medium-index) pair assigned to exactly one device thread at
/// a time (spec §3 "Sub-request").
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub container_id: u64,
    pub medium_index: usize,
    pub status: SubRequestStatus,
    /// Set when this sub-request's medium failed once already; a second
    /// failure is treated as permanent rather than retried (spec §4.4
    /// "media that failed permanently are removed").
    pub failed_on_medium: bool,
}

impl SubRequest {
    pub fn new(container_id: u64, medium_index: usize) -> Self {
        Self { container_id, medium_index, status: SubRequestStatus::Todo, failed_on_medium: false }
    }
}

/// Mutable response state accumulated as sub-requests complete.
#[derive(Debug, Default)]
pub struct ResponseState {
    pub per_medium: Vec<Option<Result<Response, LrsError>>>,
    /// Per-medium status mirroring `SubRequestStatus`, tracked alongside
    /// `per_medium` so a sibling that already reached `Done` can be rolled
    /// back to `Cancel` when another medium in the same request fails
    /// permanently (spec invariant 6).
    pub status: Vec<SubRequestStatus>,
    pub done_count: usize,
    pub failed: bool,
}

/// An immutable client request plus the mutable, mutex-guarded state
/// collected while it is serviced (spec §3 "Request container").
pub struct RequestContainer {
    pub id: u64,
    pub socket_id: u64,
    pub received_at: DateTime<Utc>,
    pub request: Request,
    pub resource_ids: Vec<ResourceId>,
    state: Mutex<ResponseState>,
}

impl RequestContainer {
    pub fn new(socket_id: u64, request: Request, resource_ids: Vec<ResourceId>) -> Self {
        let n = resource_ids.len().max(1);
        Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
            socket_id,
            received_at: Utc::now(),
            request,
            resource_ids,
            state: Mutex::new(ResponseState {
                per_medium: vec![None; n],
                status: vec![SubRequestStatus::Todo; n],
                done_count: 0,
                failed: false,
            }),
        }
    }

    pub fn media_count(&self) -> usize {
        self.resource_ids.len().max(1)
    }

    /// Record a sub-request outcome. Returns `true` once this was the
    /// response that completed the request (either every medium is done,
    /// or a permanent failure occurred).
    pub fn record(&self, medium_index: usize, outcome: Result<Response, LrsError>) -> bool {
        let mut state = self.state.lock().unwrap();
        let is_err = outcome.is_err();
        state.per_medium[medium_index] = Some(outcome);
        state.status[medium_index] = if is_err { SubRequestStatus::Error } else { SubRequestStatus::Done };
        if is_err {
            state.failed = true;
        } else {
            state.done_count += 1;
        }
        state.failed || state.done_count >= self.media_count()
    }

    /// Rolls every already-`Done` sibling of `failed_index` back to
    /// `Cancel` and returns the medium ids that need their device-side
    /// allocation undone (spec invariant 6: "either all media reach `done`
    /// or all reach `error`/`cancel`, never a mix").
    pub fn cancel_done_siblings(&self, failed_index: usize) -> Vec<ResourceId> {
        let mut state = self.state.lock().unwrap();
        let mut cancelled = Vec::new();
        for index in 0..state.status.len() {
            if index == failed_index || state.status[index] != SubRequestStatus::Done {
                continue;
            }
            let medium_id = match &state.per_medium[index] {
                Some(Ok(Response::WriteAllocated { media })) | Some(Ok(Response::ReadAllocated { media })) => {
                    media.first().map(|grant| grant.id.clone())
                }
                _ => None,
            };
            state.status[index] = SubRequestStatus::Cancel;
            if let Some(medium_id) = medium_id {
                cancelled.push(medium_id);
            }
        }
        cancelled
    }

    /// True once enough sub-requests finished to resolve the request: all
    /// of them for write/format/release, or `n_required` of them for a
    /// read (spec §4.4 "succeeds as soon as that many media reach done").
    pub fn is_complete(&self, n_required: Option<usize>) -> bool {
        let state = self.state.lock().unwrap();
        let required = n_required.unwrap_or_else(|| self.media_count());
        state.failed || state.done_count >= required
    }

    pub fn mark_failed(&self) {
        self.state.lock().unwrap().failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    /// Drains whatever per-medium outcomes have been recorded so far, for
    /// assembling the final client response.
    pub fn take_outcomes(&self) -> Vec<Option<Result<Response, LrsError>>> {
        std::mem::take(&mut self.state.lock().unwrap().per_medium)
    }
}

/// One device thread's completion report for a sub-request, handed to the
/// outgoing-response consumer via the shared outgoing queue (spec §5 "The
/// outgoing response queue is shared by all threads").
pub struct SubRequestOutcome {
    pub container: Arc<RequestContainer>,
    pub medium_index: usize,
    pub result: Result<Response, LrsError>,
}
