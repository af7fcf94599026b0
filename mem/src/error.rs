use core::fmt;

/// Errors surfaced by the shared-memory substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// The allocator could not satisfy the request. Never retried;
    /// callers roll back partial allocations and propagate.
    OutOfMemory,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "shared-memory allocator exhausted"),
        }
    }
}

impl core::error::Error for MemError {}

pub type MemResult<T = ()> = Result<T, MemError>;
