use std::{fmt, io};

/// Errors surfaced by the queue and its named synchronization objects.
///
/// Transient conditions are not errors: a full ring, an empty ring, or an
/// exhausted connection table are reported through boolean or `Option`
/// returns by the operations themselves.
#[derive(Debug)]
pub enum ShmqError {
    /// Failure creating, opening or mapping a named segment.
    SharedMemory(shared_memory::ShmemError),
    /// A non-recoverable OS error from a mutex, semaphore or clock call.
    Sys(io::Error),
    /// Invalid channel name or inconsistent configuration.
    Config(String),
}

impl fmt::Display for ShmqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmqError::SharedMemory(e) => write!(f, "shared memory error: {}", e),
            ShmqError::Sys(e) => write!(f, "system error: {}", e),
            ShmqError::Config(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for ShmqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmqError::SharedMemory(e) => Some(e),
            ShmqError::Sys(e) => Some(e),
            ShmqError::Config(_) => None,
        }
    }
}

impl From<shared_memory::ShmemError> for ShmqError {
    fn from(err: shared_memory::ShmemError) -> Self {
        ShmqError::SharedMemory(err)
    }
}

impl From<io::Error> for ShmqError {
    fn from(err: io::Error) -> Self {
        ShmqError::Sys(err)
    }
}
