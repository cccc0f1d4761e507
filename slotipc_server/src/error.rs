//! Error types for server startup and shutdown.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error type for server operations. Everything here is a startup failure;
/// once the dispatcher runs, worker-level failures are answered in-band
/// through the slot status instead.
#[derive(Debug)]
pub enum ServerError {
    /// Another server instance holds the singleton lock.
    AlreadyRunning(PathBuf),
    /// IO error from shared object creation or the lock files.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AlreadyRunning(path) => write!(
                f,
                "another server instance is already running; if it crashed, remove {} and retry",
                path.display()
            ),
            ServerError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
