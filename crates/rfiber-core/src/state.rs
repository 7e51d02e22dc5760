//! Fiber state type

use core::fmt;

/// State of a fiber
///
/// Only ever changed while holding the fiber's transition lock, which is
/// why the state lives inside that lock (see `FiberEntity::scheduler_lock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Ready to run, sitting in a work queue
    Ready = 0,

    /// Currently executing on a worker
    Running = 1,

    /// Parked on a wait list, woken by whoever satisfies the condition
    Waiting = 2,

    /// Voluntarily gave up the CPU, re-queued right after the switch
    Yield = 3,

    /// Entry closure returned, awaiting teardown
    Dead = 4,
}

impl FiberState {
    /// Check if this state allows the fiber to be picked by a worker
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, FiberState::Dead)
    }

    /// Check if the fiber is suspended (not running, not queued by itself)
    #[inline]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, FiberState::Waiting | FiberState::Yield)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            3 => FiberState::Yield,
            _ => FiberState::Dead,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Waiting => write!(f, "WAITING"),
            FiberState::Yield => write!(f, "YIELD"),
            FiberState::Dead => write!(f, "DEAD"),
        }
    }
}
