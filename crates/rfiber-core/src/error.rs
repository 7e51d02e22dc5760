//! Error types for the fiber runtime
//!
//! Capacity exhaustion in the work queue is reported as `bool`, and
//! contract violations panic. Everything else that can fail at runtime
//! ends up here.

use core::fmt;

/// Result type for runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// Operation requires being called from inside a fiber
    NotInFiberContext,

    /// Stack allocation/mapping failed
    StackAllocation(MemoryError),

    /// Worker thread error
    Worker(WorkerError),

    /// Runtime not initialized
    NotInitialized,

    /// Runtime already initialized
    AlreadyInitialized,

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),

    /// The fiber's entry closure panicked
    Panicked,

    /// Runtime is shutting down and no longer accepts fibers
    ShuttingDown,

    /// Operation would deadlock when called from a worker thread
    InsideRuntime,
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::NotInFiberContext => write!(f, "not in fiber context"),
            FiberError::StackAllocation(e) => write!(f, "stack allocation failed: {}", e),
            FiberError::Worker(e) => write!(f, "worker error: {}", e),
            FiberError::NotInitialized => write!(f, "runtime not initialized"),
            FiberError::AlreadyInitialized => write!(f, "runtime already initialized"),
            FiberError::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            FiberError::Panicked => write!(f, "fiber panicked"),
            FiberError::ShuttingDown => write!(f, "runtime shutting down"),
            FiberError::InsideRuntime => write!(f, "not allowed on a runtime worker thread"),
        }
    }
}

impl std::error::Error for FiberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FiberError::StackAllocation(e) => Some(e),
            FiberError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap or the system allocator failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Requested stack size is too small to hold the control block
    StackTooSmall,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::StackTooSmall => write!(f, "stack too small"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for FiberError {
    fn from(e: MemoryError) -> Self {
        FiberError::StackAllocation(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerError> for FiberError {
    fn from(e: WorkerError) -> Self {
        FiberError::Worker(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", FiberError::Panicked), "fiber panicked");

        let e = FiberError::StackAllocation(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "stack allocation failed: memory allocation failed");

        let e = FiberError::InvalidConfig("num_groups must be > 0");
        assert_eq!(format!("{}", e), "invalid config: num_groups must be > 0");
    }

    #[test]
    fn test_error_conversion() {
        let e: FiberError = MemoryError::ProtectionFailed.into();
        assert!(matches!(e, FiberError::StackAllocation(MemoryError::ProtectionFailed)));
        assert!(e.source().is_some());

        let e: FiberError = WorkerError::SpawnFailed.into();
        assert!(matches!(e, FiberError::Worker(WorkerError::SpawnFailed)));
        assert!(FiberError::Panicked.source().is_none());
    }
}
