//! Error types for the Galaxy3D GPU buffer core
//!
//! This module defines the error type shared by the managed buffer and by
//! every backend implementing the graphics device collaborators.

use std::fmt;

/// Result type for Galaxy3D GPU buffer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Galaxy3D GPU buffer errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Backend-specific error (Vulkan, mock, etc.)
    BackendError(String),

    /// Out of GPU memory
    OutOfMemory,

    /// GPU resource or descriptor view creation failed
    AllocationFailed(String),

    /// A checked append does not fit in the remaining capacity
    CapacityExceeded {
        /// Bytes the caller tried to write
        requested: u64,
        /// Bytes still available in the buffer
        available: u64,
    },

    /// Mapping a GPU resource into host memory failed
    MappingFailed(String),

    /// Caller broke an API contract (range outside capacity, mapping device-local memory, ...)
    PreconditionViolation(String),

    /// Invalid resource (unknown handle, destroyed buffer, etc.)
    InvalidResource(String),

    /// Initialization failed (device, queues, allocator)
    InitializationFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::AllocationFailed(msg) => write!(f, "Allocation failed: {}", msg),
            Error::CapacityExceeded { requested, available } => write!(
                f,
                "Capacity exceeded: {} bytes requested, {} bytes available",
                requested, available
            ),
            Error::MappingFailed(msg) => write!(f, "Mapping failed: {}", msg),
            Error::PreconditionViolation(msg) => write!(f, "Precondition violation: {}", msg),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether this error comes from a GPU allocation (resource or view creation)
    pub fn is_allocation_error(&self) -> bool {
        matches!(self, Error::OutOfMemory | Error::AllocationFailed(_))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
