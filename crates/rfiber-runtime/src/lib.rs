//! # rfiber-runtime
//!
//! Platform-specific half of the rfiber runtime.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Fiber stacks (mmap with guard pages, pooled) and control blocks
//! - Scheduling groups, their workers and worker parking
//! - Exit barriers for joining fibers
//! - Configuration (build-time defaults plus environment)

pub mod arch;
pub mod barrier;
pub mod config;
pub mod entity;
pub mod group;
pub mod memory;
pub mod parking;
pub mod sanitizer;
pub mod scheduler;
pub mod tls;
pub mod worker;

use std::sync::OnceLock;
use std::time::Instant;

// Re-exports
pub use barrier::ExitBarrier;
pub use config::SchedulerConfig;
pub use entity::{fiber_count, FiberDesc, FiberEntity, FiberPtr};
pub use group::{Launch, SchedulingGroup};
pub use parking::{new_parking, WorkerParking};
pub use scheduler::Scheduler;
pub use worker::WorkerPool;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the runtime first asked for the time
pub fn now_ns() -> u64 {
    START_INSTANT.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
