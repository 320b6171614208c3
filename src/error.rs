//! Error taxonomy (spec §7 ERROR HANDLING DESIGN). A single `LrsError`
//! covers every fallible operation in the library; `.kind()` maps each
//! variant onto exactly one taxonomy entry, the way the teacher's
//! `SvcError` is reduced to a wire-level `ReplyErrorKind`.

use snafu::Snafu;

use crate::model::ResourceId;

/// The error taxonomy from spec §7, independent of the specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Again,
    Busy,
    AlreadyLocked,
    NotFound,
    Permission,
    InvalidState,
    NoSpace,
    NoDevice,
    Shutdown,
    IoError,
    Protocol,
}

impl ErrorKind {
    /// Stable numeric code carried on the wire, mirroring errno-style
    /// negative codes used throughout the original system.
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Again => -11,
            ErrorKind::Busy => -16,
            ErrorKind::AlreadyLocked => -98,
            ErrorKind::NotFound => -2,
            ErrorKind::Permission => -13,
            ErrorKind::InvalidState => -22,
            ErrorKind::NoSpace => -28,
            ErrorKind::NoDevice => -19,
            ErrorKind::Shutdown => -108,
            ErrorKind::IoError => -5,
            ErrorKind::Protocol => -71,
        }
    }

    /// Whether the scheduler should transparently retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Again | ErrorKind::Busy)
    }
}

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum LrsError {
    #[snafu(display("resource '{}' is busy", resource))]
    Busy { resource: ResourceId },

    #[snafu(display("resource '{}' is locked by a foreign host", resource))]
    AlreadyLocked { resource: ResourceId },

    #[snafu(display("device '{}' not found", id))]
    DeviceNotFound { id: ResourceId },

    #[snafu(display("medium '{}' not found", id))]
    MediumNotFound { id: ResourceId },

    #[snafu(display("operation forbidden on '{}'", resource))]
    Permission { resource: ResourceId },

    #[snafu(display("medium '{}' is in an incompatible fs-status for this operation", id))]
    InvalidState { id: ResourceId },

    #[snafu(display("no medium has enough free space for {} bytes", size))]
    NoSpace { size: u64 },

    #[snafu(display("no compatible drive is available"))]
    NoDevice,

    #[snafu(display("the daemon is shutting down"))]
    Shutdown,

    #[snafu(display("back-end I/O error on '{}': {}", resource, details))]
    IoError { resource: ResourceId, details: String },

    #[snafu(display("malformed request: {}", details))]
    Protocol { details: String },

    #[snafu(display("DSS error: {}", details))]
    Dss { details: String },

    #[snafu(display("invalid argument: {}", details))]
    InvalidArgument { details: String },
}

impl LrsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LrsError::Busy { .. } => ErrorKind::Busy,
            LrsError::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            LrsError::DeviceNotFound { .. } | LrsError::MediumNotFound { .. } => ErrorKind::NotFound,
            LrsError::Permission { .. } => ErrorKind::Permission,
            LrsError::InvalidState { .. } => ErrorKind::InvalidState,
            LrsError::NoSpace { .. } => ErrorKind::NoSpace,
            LrsError::NoDevice => ErrorKind::NoDevice,
            LrsError::Shutdown => ErrorKind::Shutdown,
            LrsError::IoError { .. } => ErrorKind::IoError,
            LrsError::Protocol { .. } => ErrorKind::Protocol,
            // A raw DSS failure is transient by default (spec §4.1 Failure
            // semantics: "DSS errors are transient and propagated").
            LrsError::Dss { .. } => ErrorKind::Again,
            LrsError::InvalidArgument { .. } => ErrorKind::Protocol,
        }
    }
}

pub type LrsResult<T> = Result<T, LrsError>;
