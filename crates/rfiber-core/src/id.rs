//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Debugging identifier of a fiber
///
/// Identifiers are handed out from a process-wide counter and never
/// reused. Zero is reserved for master fibers (the scheduler context of
/// each worker thread), which never run user code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Identifier carried by master fibers
    pub const MASTER: FiberId = FiberId(0);

    /// Allocate a fresh identifier
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the master fiber identifier
    #[inline]
    pub const fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            write!(f, "FiberId(MASTER)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            write!(f, "master")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
