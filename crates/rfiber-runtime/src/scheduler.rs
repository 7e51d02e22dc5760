//! Scheduler: scheduling groups plus the workers that serve them

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rfiber_core::{kdebug, kwarn, FiberError, FiberId, FiberResult};

use crate::config::SchedulerConfig;
use crate::entity::FiberDesc;
use crate::group::{Launch, SchedulingGroup};
use crate::memory;
use crate::tls;
use crate::worker::WorkerPool;

pub struct Scheduler {
    config: SchedulerConfig,
    groups: Arc<[SchedulingGroup]>,
    live_fibers: Arc<AtomicUsize>,
    worker_pool: Mutex<Option<WorkerPool>>,
    running: AtomicBool,
    next_group: AtomicUsize,
}

impl Scheduler {
    /// Validate `config` and build the groups; no thread is started yet
    pub fn new(config: SchedulerConfig) -> FiberResult<Self> {
        config.validate()?;
        if config.debug_logging {
            rfiber_core::kprint::set_log_level(rfiber_core::kprint::LogLevel::Debug);
        }
        memory::set_pool_capacity(config.stack_pool_capacity);

        let live_fibers = Arc::new(AtomicUsize::new(0));
        let groups: Vec<_> = (0..config.num_groups)
            .map(|i| SchedulingGroup::new(i, &config, Arc::clone(&live_fibers)))
            .collect();

        Ok(Scheduler {
            config,
            groups: groups.into(),
            live_fibers,
            worker_pool: Mutex::new(None),
            running: AtomicBool::new(false),
            next_group: AtomicUsize::new(0),
        })
    }

    /// Spawn the worker threads
    pub fn start(&self) -> FiberResult<()> {
        if self.groups.iter().any(SchedulingGroup::is_stopped) {
            return Err(FiberError::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FiberError::AlreadyInitialized);
        }
        if self.config.debug_logging {
            self.config.print();
        }

        let pool = WorkerPool::start(&self.groups).inspect_err(|_| {
            self.running.store(false, Ordering::SeqCst);
        })?;
        kdebug!(
            "scheduler started: {} groups, {} workers",
            self.groups.len(),
            pool.num_workers()
        );
        *self.pool() = Some(pool);
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn groups(&self) -> &[SchedulingGroup] {
        &self.groups
    }

    /// Fibers created by this scheduler and not yet freed
    #[inline]
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::SeqCst)
    }

    /// Group for a new fiber: the caller's own group when it is one of
    /// ours, round-robin otherwise
    pub fn pick_group(&self) -> &SchedulingGroup {
        if let Some(current) = tls::current_group() {
            if let Some(group) = self.groups.iter().find(|g| ptr::eq(*g, current)) {
                return group;
            }
        }
        let i = self.next_group.fetch_add(1, Ordering::Relaxed) % self.groups.len();
        &self.groups[i]
    }

    /// Start a fiber in the group chosen by `pick_group`
    pub fn start_fiber(&self, desc: FiberDesc, launch: Launch) -> FiberResult<FiberId> {
        if !self.is_running() && !tls::is_in_fiber() {
            return Err(FiberError::NotInitialized);
        }
        self.pick_group().start_fiber(desc, launch)
    }

    /// Stop accepting fibers from outside, let the live ones finish, then
    /// join the workers
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) -> FiberResult<()> {
        if tls::current_group().is_some() {
            kwarn!("shutdown requested from a worker thread, ignored");
            return Err(FiberError::InsideRuntime);
        }
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        for group in self.groups.iter() {
            group.stop();
        }
        let pool = self.pool().take();
        if let Some(pool) = pool {
            pool.join()?;
        }
        memory::drain_pool();
        kdebug!("scheduler stopped");
        Ok(())
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Option<WorkerPool>> {
        self.worker_pool.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("groups", &self.groups.len())
            .field("running", &self.is_running())
            .field("live_fibers", &self.live_fibers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ExitBarrier;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config() -> SchedulerConfig {
        SchedulerConfig::new()
            .num_groups(2)
            .workers_per_group(2)
            .park_timeout(Duration::from_millis(5))
    }

    #[test]
    fn test_start_twice_rejected() {
        let sched = Scheduler::new(config()).unwrap();
        sched.start().unwrap();
        assert_eq!(sched.start(), Err(FiberError::AlreadyInitialized));
        sched.shutdown().unwrap();
        assert_eq!(sched.start(), Err(FiberError::ShuttingDown));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Scheduler::new(SchedulerConfig::new().num_groups(0)).unwrap_err();
        assert!(matches!(err, FiberError::InvalidConfig(_)));
    }

    #[test]
    fn test_start_fiber_needs_running_scheduler() {
        let sched = Scheduler::new(config()).unwrap();
        let err = sched.start_fiber(FiberDesc::new(|| {}), Launch::Post).unwrap_err();
        assert_eq!(err, FiberError::NotInitialized);
    }

    #[test]
    fn test_fibers_run_and_shutdown_drains() {
        let sched = Scheduler::new(config()).unwrap();
        sched.start().unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(ExitBarrier::with_count(100));
        for _ in 0..100 {
            let ran = Arc::clone(&ran);
            let barrier = Arc::clone(&barrier);
            let desc = FiberDesc::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                barrier.count_down(false);
            });
            sched.start_fiber(desc, Launch::Post).unwrap();
        }
        assert!(!barrier.wait());
        assert_eq!(ran.load(Ordering::SeqCst), 100);

        sched.shutdown().unwrap();
        assert!(!sched.is_running());
        assert_eq!(sched.live_fibers(), 0);
        // Idempotent
        sched.shutdown().unwrap();
    }

    #[test]
    fn test_pick_group_round_robin_from_outside() {
        let sched = Scheduler::new(config()).unwrap();
        let first = sched.pick_group().index();
        let second = sched.pick_group().index();
        assert_ne!(first, second);
    }
}
