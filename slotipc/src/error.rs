//! Error types for the slotipc client and transport.

use std::fmt;
use std::io;

use crate::layout::{RequestId, Status, MAX_STRING_LEN};

/// Error type for client and transport operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from shared memory or semaphore syscalls.
    Io(io::Error),
    /// The server restarted; previously issued request ids are invalid.
    /// The client has already reconnected to the fresh region.
    ServerRestarted,
    /// Every slot is occupied; retry after consuming responses.
    NoFreeSlots,
    /// Input string length outside `1..=MAX_STRING_LEN`, or an interior NUL.
    InvalidString,
    /// No slot carries the polled request id.
    UnknownRequest(RequestId),
    /// A blocking call completed with a non-OK status.
    Op(Status),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::ServerRestarted => write!(f, "server restarted; request context invalidated"),
            Error::NoFreeSlots => write!(f, "no free slots available"),
            Error::InvalidString => {
                write!(f, "string length must be 1..={} bytes without NUL", MAX_STRING_LEN)
            }
            Error::UnknownRequest(id) => write!(f, "unknown request id {}", id),
            Error::Op(status) => write!(f, "operation failed: {}", status),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type alias for slotipc operations.
pub type Result<T> = std::result::Result<T, Error>;
