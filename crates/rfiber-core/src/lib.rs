//! # rfiber-core
//!
//! Platform-agnostic building blocks of the rfiber runtime.
//!
//! Nothing in here switches stacks or talks to the OS; that lives in
//! `rfiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber debugging identifier
//! - `state` - Fiber state enum
//! - `list` - Intrusive doubly- and singly-linked lists
//! - `work_queue` - Lock-free MPMC queue of ready fibers
//! - `fls` - Fiber-local storage slots
//! - `spinlock` - Spinlock with guard leaking for cross-context release
//! - `cache` - Cache-line padding
//! - `error` - Error types
//! - `kprint` - Kernel-style logging macros
//! - `env` - Environment variable helpers

pub mod cache;
pub mod env;
pub mod error;
pub mod fls;
pub mod id;
pub mod kprint;
pub mod list;
pub mod spinlock;
pub mod state;
pub mod work_queue;

pub use cache::CacheAligned;
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};
pub use error::{FiberError, FiberResult, MemoryError, WorkerError};
pub use fls::{ErasedPtr, FiberLocalStorage, Trivial};
pub use id::FiberId;
pub use list::{DoublyLinked, DoublyLinkedList, DoublyLinkedListEntry};
pub use list::{SinglyLinked, SinglyLinkedList, SinglyLinkedListEntry};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use state::FiberState;
pub use work_queue::WorkQueue;

/// Runtime-wide constants
pub mod constants {
    /// Maximum workers (OS threads) per scheduling group
    pub const MAX_WORKERS: usize = 64;
}
