// src/error.rs

use std::fmt;

/// Error codes returned by bus operations.
///
/// Codes are grouped by the way callers are expected to react:
/// validation errors are permanent for a given request, transient errors
/// may succeed on retry, and lifecycle errors describe the state of the
/// peer or domain rather than the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusError {
    /// Malformed request: unknown flags, bad sizes, bad combinations.
    InvalidArgument,
    /// Allocation failed, or a resource quota was exhausted.
    NoMemory,
    /// The named entry (name, slice, destination) does not exist.
    NoSuchEntry,
    /// The supplied name set does not match the peer's registered names,
    /// or connect parameters differ from the live ones.
    NamesDiffer,
    /// A name is already claimed by another live peer.
    NameExists,
    /// A name is shorter than two bytes or exceeds `NAME_MAX_SIZE`,
    /// or a name buffer is not properly terminated.
    NameTooLong,
    /// The peer is already connected with identical parameters.
    AlreadyConnected,
    /// The operation requires a connected peer, but the peer is NEW.
    NotConnected,
    /// The peer or domain has been deactivated.
    Shutdown,
    /// The caller lacks the capability required for the operation.
    PermissionDenied,
    /// Nothing to do right now; retry later (e.g. empty receive queue).
    Again,
    /// A caller-memory access was out of range.
    Fault,
    /// The command code is not known to the dispatcher.
    NoSuchIoctl,
}

impl BusError {
    /// Short symbolic name, stable across releases.
    pub fn code(self) -> &'static str {
        match self {
            BusError::InvalidArgument => "INVALID_ARGUMENT",
            BusError::NoMemory => "NO_MEMORY",
            BusError::NoSuchEntry => "NO_SUCH_ENTRY",
            BusError::NamesDiffer => "NAMES_DIFFER",
            BusError::NameExists => "NAME_EXISTS",
            BusError::NameTooLong => "NAME_TOO_LONG",
            BusError::AlreadyConnected => "ALREADY_CONNECTED",
            BusError::NotConnected => "NOT_CONNECTED",
            BusError::Shutdown => "SHUTDOWN",
            BusError::PermissionDenied => "PERMISSION_DENIED",
            BusError::Again => "AGAIN",
            BusError::Fault => "FAULT",
            BusError::NoSuchIoctl => "NO_SUCH_IOCTL",
        }
    }

    /// Check if this error is transient.
    ///
    /// Transient errors are returned without side effects and may succeed
    /// if the caller retries after the queue or pool state changes.
    pub fn is_transient(self) -> bool {
        matches!(self, BusError::Again)
    }

    /// Check if this error describes peer or domain lifecycle state.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            BusError::AlreadyConnected | BusError::NotConnected | BusError::Shutdown
        )
    }

    /// Check if this error indicates an invalid request.
    ///
    /// Validation errors short-circuit before any state change.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            BusError::InvalidArgument
                | BusError::NameTooLong
                | BusError::PermissionDenied
                | BusError::NoSuchIoctl
        )
    }

    /// Get a human-readable description of this error.
    pub fn description(self) -> &'static str {
        match self {
            BusError::InvalidArgument => "invalid argument",
            BusError::NoMemory => "out of memory or quota",
            BusError::NoSuchEntry => "no such entry",
            BusError::NamesDiffer => "names differ",
            BusError::NameExists => "name already exists",
            BusError::NameTooLong => "name too short or too long",
            BusError::AlreadyConnected => "peer already connected",
            BusError::NotConnected => "peer not connected",
            BusError::Shutdown => "peer or domain shut down",
            BusError::PermissionDenied => "permission denied",
            BusError::Again => "try again",
            BusError::Fault => "caller memory fault",
            BusError::NoSuchIoctl => "unknown command",
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

impl std::error::Error for BusError {}

/// Result type alias for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;
