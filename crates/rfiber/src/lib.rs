//! # rfiber - M:N fiber runtime
//!
//! Fibers are cheap user-space threads with their own stack, run by a
//! fixed set of OS worker threads.
//!
//! ## Features
//!
//! - **Scheduling groups**: workers are partitioned into groups; a fiber
//!   normally stays in the group that started it
//! - **Work stealing**: idle workers take fibers from their peers, and
//!   optionally from other groups
//! - **Fast context switch**: hand-written assembly for x86_64 and aarch64
//! - **Pooled stacks** with guard pages
//! - **Joinable fibers**: `join()` suspends only the calling fiber
//! - **Fiber-local storage**: `FiberLocal<T>` and `TrivialFiberLocal<T>`
//!
//! ## Quick Start
//!
//! ```ignore
//! use rfiber::{Runtime, SchedulerConfig, spawn, yield_now};
//!
//! fn main() {
//!     let runtime = Runtime::new(SchedulerConfig::default()).unwrap();
//!
//!     let sum = runtime.block_on(|| {
//!         let fibers: Vec<_> = (0..10u64)
//!             .map(|i| spawn(move || {
//!                 yield_now();
//!                 i * i
//!             }))
//!             .collect();
//!         fibers.into_iter().map(|f| f.join().unwrap()).sum::<u64>()
//!     });
//!     assert_eq!(sum.unwrap(), 285);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      spawn(), Fiber::join(), yield_now(), FiberLocal        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │       scheduling groups, work queues, overflow, parking     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Worker g0 │      │ Worker g0 │      │ Worker g1 │
//!    │  (master) │      │  (master) │      │  (master) │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  Fiber stacks                           │
//!    │   mmap + guard page, control block at the top, pooled   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

mod local;

use std::sync::Arc;

pub use local::{FiberLocal, TrivialFiberLocal};

// Re-export core types
pub use rfiber_core::{FiberError, FiberId, FiberResult, FiberState, Trivial};

// Re-export kprint macros for debug logging
pub use rfiber_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};
pub use rfiber_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};

// Re-export env utilities
pub use rfiber_core::{env_get, env_get_bool, env_get_millis, env_get_opt};

// Re-export runtime types
pub use rfiber_runtime::{fiber_count, Launch, Scheduler, SchedulerConfig};

use rfiber_core::SpinLock;
use rfiber_runtime::{tls, ExitBarrier, FiberDesc};

/// A started scheduler and its workers
///
/// Dropping the runtime waits for every live fiber to finish, then joins
/// the workers.
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    /// Build the scheduler from `config` and start its workers
    pub fn new(config: SchedulerConfig) -> FiberResult<Self> {
        let scheduler = Scheduler::new(config)?;
        scheduler.start()?;
        Ok(Runtime { scheduler })
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Spawn a fiber with default settings
    ///
    /// # Panics
    ///
    /// If the fiber cannot be created, e.g. after shutdown began or when
    /// its stack cannot be mapped. Use [`Builder::spawn_on`] to handle the
    /// error instead.
    pub fn spawn<F, T>(&self, f: F) -> Fiber<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match Builder::new().spawn_on(self, f) {
            Ok(fiber) => fiber,
            Err(e) => panic!("failed to spawn fiber: {}", e),
        }
    }

    /// Run `f` in a fiber and block the calling thread until it returns
    pub fn block_on<F, T>(&self, f: F) -> FiberResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Builder::new().spawn_on(self, f)?.join()
    }

    /// Wait for all fibers, then stop the workers
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(self) -> FiberResult<()> {
        self.scheduler.shutdown()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("scheduler", &self.scheduler).finish()
    }
}

/// Fiber factory with per-fiber settings
#[derive(Debug, Clone, Default)]
pub struct Builder {
    stack_size: Option<usize>,
    scheduling_group_local: bool,
    launch: Launch,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes; other sizes than the configured default are
    /// mapped fresh instead of taken from the pool
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Keep the fiber off other groups' workers
    pub fn scheduling_group_local(mut self, local: bool) -> Self {
        self.scheduling_group_local = local;
        self
    }

    pub fn launch(mut self, launch: Launch) -> Self {
        self.launch = launch;
        self
    }

    /// Spawn into the calling fiber's scheduling group
    ///
    /// Fails with `NotInFiberContext` off the runtime's workers.
    pub fn spawn<F, T>(self, f: F) -> FiberResult<Fiber<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let group = tls::current_group().ok_or(FiberError::NotInFiberContext)?;
        let launch = self.launch;
        let (desc, handle) = self.prepare(f);
        let id = group.start_fiber(desc, launch)?;
        Ok(handle.started(id))
    }

    /// Spawn into `runtime`, from anywhere
    pub fn spawn_on<F, T>(self, runtime: &Runtime, f: F) -> FiberResult<Fiber<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let launch = self.launch;
        let (desc, handle) = self.prepare(f);
        let id = runtime.scheduler.start_fiber(desc, launch)?;
        Ok(handle.started(id))
    }

    fn prepare<F, T>(self, f: F) -> (FiberDesc, PendingFiber<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let barrier = Arc::new(ExitBarrier::new());
        let result = Arc::new(SpinLock::new(None));

        let slot = Arc::clone(&result);
        let mut desc = FiberDesc::new(move || {
            let value = f();
            *slot.lock() = Some(value);
        });
        desc.stack_size = self.stack_size;
        desc.scheduling_group_local = self.scheduling_group_local;
        desc.exit_barrier = Some(Arc::clone(&barrier));

        (desc, PendingFiber { barrier, result })
    }
}

struct PendingFiber<T> {
    barrier: Arc<ExitBarrier>,
    result: Arc<SpinLock<Option<T>>>,
}

impl<T> PendingFiber<T> {
    fn started(self, id: FiberId) -> Fiber<T> {
        Fiber {
            id,
            barrier: self.barrier,
            result: self.result,
        }
    }
}

/// Handle to a spawned fiber
///
/// Dropping the handle detaches the fiber; it keeps running.
#[must_use = "dropping a Fiber detaches it; call join() to wait for it"]
pub struct Fiber<T = ()> {
    id: FiberId,
    barrier: Arc<ExitBarrier>,
    result: Arc<SpinLock<Option<T>>>,
}

impl<T> Fiber<T> {
    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Whether the entry closure already returned (or panicked)
    pub fn is_finished(&self) -> bool {
        self.barrier.is_released()
    }

    /// Wait for the fiber and take its return value
    ///
    /// Inside a fiber only the caller is suspended; elsewhere the thread
    /// blocks. Returns `Err(Panicked)` if the entry closure panicked.
    pub fn join(self) -> FiberResult<T> {
        if self.barrier.wait() {
            return Err(FiberError::Panicked);
        }
        self.result.lock().take().ok_or(FiberError::Panicked)
    }

    /// Let the fiber run on its own
    pub fn detach(self) {}
}

impl<T> std::fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Spawn a fiber into the calling fiber's scheduling group
///
/// # Panics
///
/// Outside the runtime's workers, or if the fiber cannot be created. Use
/// [`Runtime::spawn`] from plain threads.
pub fn spawn<F, T>(f: F) -> Fiber<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match Builder::new().spawn(f) {
        Ok(fiber) => fiber,
        Err(e) => panic!("failed to spawn fiber: {}", e),
    }
}

/// Let other fibers run
///
/// The calling fiber goes back to the queue of the worker it runs on.
/// Outside a fiber this yields the OS thread.
pub fn yield_now() {
    match (tls::current_user_fiber(), tls::current_group()) {
        (Some(fiber), Some(group)) => group.yield_fiber(fiber),
        _ => std::thread::yield_now(),
    }
}

/// Id of the running fiber, `None` outside fibers
#[inline]
pub fn current_id() -> Option<FiberId> {
    tls::current_user_fiber().map(|f| f.id())
}

/// Check if currently executing within a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    tls::is_in_fiber()
}
