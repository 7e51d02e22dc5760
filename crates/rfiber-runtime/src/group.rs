//! Scheduling groups
//!
//! A group is a set of workers, each owning one [`WorkQueue`]. Fibers made
//! ready in a group go to the readying worker's own queue when it belongs
//! to the group, otherwise to the group's queues round-robin. When a queue
//! is full the fiber lands in the group's unbounded overflow queue.
//!
//! Every state change of a fiber happens under its `scheduler_lock`. A
//! fiber that stops running cannot release its own lock (it would become
//! runnable again before its context is saved), so it leaks the guard and
//! lets the master fiber release it after the switch, via `resume_on`.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use rfiber_core::{ktrace, FiberError, FiberId, FiberResult, FiberState, SpinLockGuard, WorkQueue};

use crate::config::SchedulerConfig;
use crate::entity::{self, FiberDesc, FiberPtr};
use crate::parking::{new_parking, WorkerParking};
use crate::tls;

/// How a newly started fiber gets to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Launch {
    /// Queue the new fiber, the caller keeps running
    #[default]
    Post,
    /// From inside a fiber: switch to the new fiber right away and queue
    /// the caller instead. Acts as `Post` anywhere else.
    Dispatch,
}

pub struct SchedulingGroup {
    index: usize,
    queues: Box<[WorkQueue<FiberPtr>]>,
    overflow: SegQueue<FiberPtr>,
    parking: Box<dyn WorkerParking>,
    stopped: AtomicBool,
    next_queue: AtomicUsize,
    /// Shared by all groups of one scheduler
    live_fibers: Arc<AtomicUsize>,
    stack_size: usize,
    idle_spins: u32,
    park_timeout: Duration,
    cross_group_stealing: bool,
}

impl SchedulingGroup {
    /// Create group `index` with `config.workers_per_group` work queues
    ///
    /// `live_fibers` counts the fibers created in any group sharing it.
    pub fn new(index: usize, config: &SchedulerConfig, live_fibers: Arc<AtomicUsize>) -> Self {
        let queues = (0..config.workers_per_group)
            .map(|_| WorkQueue::new(config.run_queue_capacity))
            .collect();
        SchedulingGroup {
            index,
            queues,
            overflow: SegQueue::new(),
            parking: new_parking(),
            stopped: AtomicBool::new(false),
            next_queue: AtomicUsize::new(0),
            live_fibers,
            stack_size: config.stack_size,
            idle_spins: config.idle_spins,
            park_timeout: config.park_timeout,
            cross_group_stealing: config.cross_group_stealing,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    /// Default (pooled) stack size of fibers created here
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Fibers created and not yet freed, across all groups of the scheduler
    #[inline]
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::SeqCst)
    }

    pub(crate) fn fiber_created(&self) {
        self.live_fibers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fiber_freed(&self) {
        if self.live_fibers.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_stopped() {
            // Let workers waiting for the last fiber exit promptly
            self.parking.wake_all();
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask the workers to exit once no live fiber is left
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.parking.wake_all();
    }

    /// Racy count of queued fibers
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.unsafe_size()).sum::<usize>() + self.overflow.len()
    }

    /// Create a fiber from `desc` and get it running per `launch`
    ///
    /// Returns the new fiber's id; the fiber itself may be gone already.
    pub fn start_fiber(&self, desc: FiberDesc, launch: Launch) -> FiberResult<FiberId> {
        let fiber = entity::instantiate_fiber_entity(self, desc)?;
        let id = fiber.id();

        // Fibers may keep spawning while the scheduler drains, outsiders may not
        if self.is_stopped() && !tls::is_in_fiber() {
            *fiber.scheduler_lock().lock() = FiberState::Dead;
            // Safety: never queued nor run, nobody else knows about it
            unsafe { entity::free_fiber_entity(fiber) };
            return Err(FiberError::ShuttingDown);
        }

        match (launch, tls::current_user_fiber()) {
            (Launch::Dispatch, Some(current)) if tls::worker_index_in(self).is_some() => {
                self.switch_to(current, fiber);
            }
            _ => self.ready_fiber(fiber, fiber.scheduler_lock().lock()),
        }
        Ok(id)
    }

    /// Make `fiber` runnable in this group
    ///
    /// `guard` must be `fiber`'s transition lock; it is released before
    /// the fiber is queued.
    pub(crate) fn ready_fiber(&self, fiber: FiberPtr, mut guard: SpinLockGuard<'_, FiberState>) {
        debug_assert!(!fiber.is_master(), "master fibers are never queued");
        debug_assert_ne!(*guard, FiberState::Dead, "readying a dead fiber");

        *guard = FiberState::Ready;
        fiber.set_scheduling_group(self);
        fiber.set_last_ready_ns(crate::now_ns());
        drop(guard);

        let stealable = !(fiber.is_scheduling_group_local() || fiber.is_fiber_reactor());
        let queue = match tls::worker_index_in(self) {
            Some(index) => index,
            None => self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
        };
        if !self.queues[queue].push(fiber, stealable) {
            ktrace!(
                "work queue {}.{} full, fiber {} goes to overflow",
                self.index,
                queue,
                fiber.id()
            );
            self.overflow.push(fiber);
        }
        self.parking.wake_one();
    }

    /// Put the calling fiber to sleep until someone readies it
    ///
    /// `guard` must be `fiber`'s transition lock, taken by the caller after
    /// registering the fiber wherever its waker will find it.
    pub(crate) fn halt(&self, fiber: FiberPtr, mut guard: SpinLockGuard<'_, FiberState>) {
        assert_eq!(tls::current_fiber(), Some(fiber), "only a fiber can halt itself");
        assert!(!fiber.is_master(), "master fibers cannot halt");

        *guard = FiberState::Waiting;
        SpinLockGuard::leak(guard);

        let master = current_master();
        // Safety: the master is suspended in its worker loop. The lock was
        // leaked above and is released once our context is saved
        unsafe { master.resume_on(move || fiber.scheduler_lock().force_unlock()) };
    }

    /// Requeue the calling fiber in this group and let others run
    pub fn yield_fiber(&self, fiber: FiberPtr) {
        assert_eq!(tls::current_fiber(), Some(fiber), "only a fiber can yield itself");

        let mut guard = fiber.scheduler_lock().lock();
        *guard = FiberState::Yield;
        SpinLockGuard::leak(guard);

        let master = current_master();
        let group = self as *const SchedulingGroup;
        // Safety: the master is suspended in its worker loop. Groups outlive
        // fibers, and the lock was leaked above
        unsafe {
            master.resume_on(move || (*group).ready_fiber(fiber, fiber.scheduler_lock().assume_locked()));
        }
    }

    /// Run `new` right away on this worker, requeueing `current`
    pub(crate) fn switch_to(&self, current: FiberPtr, new: FiberPtr) {
        assert_eq!(tls::current_fiber(), Some(current), "switch_to from a foreign fiber");
        assert_ne!(current, new, "switch_to self");

        {
            let mut state = new.scheduler_lock().lock();
            assert_eq!(*state, FiberState::Ready, "switching to a fiber that is not ready");
            *state = FiberState::Running;
        }
        new.set_scheduling_group(self);

        let mut guard = current.scheduler_lock().lock();
        *guard = FiberState::Yield;
        SpinLockGuard::leak(guard);

        let group = self as *const SchedulingGroup;
        // Safety: `new` was Ready and we moved it to Running above, so no
        // worker can pick it up. The rest as in yield_fiber
        unsafe {
            new.resume_on(move || (*group).ready_fiber(current, current.scheduler_lock().assume_locked()));
        }
    }

    /// Next fiber for worker `index`: own queue, overflow, peers, then
    /// (if enabled) stealable fibers of other groups
    pub(crate) fn acquire_fiber(&self, index: usize, all_groups: &[SchedulingGroup]) -> Option<FiberPtr> {
        if let Some(fiber) = self.queues[index].pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.overflow.pop() {
            return Some(fiber);
        }

        let n = self.queues.len();
        for offset in 1..n {
            if let Some(fiber) = self.queues[(index + offset) % n].pop() {
                return Some(fiber);
            }
        }

        if self.cross_group_stealing {
            for group in all_groups.iter().filter(|g| !ptr::eq(*g, self)) {
                for queue in group.queues.iter() {
                    if let Some(fiber) = queue.steal() {
                        ktrace!("stole fiber {} from group {}", fiber.id(), group.index);
                        return Some(fiber);
                    }
                }
            }
        }
        None
    }

    /// Switch into a fiber taken from a queue, from the master fiber
    pub(crate) fn run_fiber(&self, fiber: FiberPtr) {
        {
            let mut state = fiber.scheduler_lock().lock();
            assert_eq!(*state, FiberState::Ready, "dequeued fiber {} not ready", fiber.id());
            *state = FiberState::Running;
        }
        // Safety: dequeued fibers belong to nobody else, and we own the
        // transition to Running
        unsafe { fiber.resume() };
    }

    /// Whether a worker that found no work may exit
    pub(crate) fn should_exit(&self) -> bool {
        self.is_stopped() && self.live_fibers() == 0
    }

    #[inline]
    pub(crate) fn parking(&self) -> &dyn WorkerParking {
        &*self.parking
    }

    #[inline]
    pub(crate) fn idle_spins(&self) -> u32 {
        self.idle_spins
    }

    #[inline]
    pub(crate) fn park_timeout(&self) -> Duration {
        self.park_timeout
    }
}

impl std::fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingGroup")
            .field("index", &self.index)
            .field("workers", &self.queues.len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

fn current_master() -> FiberPtr {
    match tls::master_fiber() {
        Some(master) => master,
        None => panic!("fiber is running on a thread without a master fiber"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{free_fiber_entity, instantiate_fiber_entity};

    fn group(workers: usize, capacity: usize) -> SchedulingGroup {
        let config = SchedulerConfig::new()
            .workers_per_group(workers)
            .run_queue_capacity(capacity);
        SchedulingGroup::new(0, &config, Default::default())
    }

    fn dispose(fiber: FiberPtr) {
        *fiber.scheduler_lock().lock() = FiberState::Dead;
        unsafe { free_fiber_entity(fiber) };
    }

    #[test]
    fn test_ready_from_outside_round_robins() {
        let g = group(2, 8);
        let a = instantiate_fiber_entity(&g, FiberDesc::new(|| {})).unwrap();
        let b = instantiate_fiber_entity(&g, FiberDesc::new(|| {})).unwrap();
        *a.scheduler_lock().lock() = FiberState::Waiting;
        *b.scheduler_lock().lock() = FiberState::Waiting;
        g.ready_fiber(a, a.scheduler_lock().lock());
        g.ready_fiber(b, b.scheduler_lock().lock());

        assert_eq!(g.queues[0].unsafe_size(), 1);
        assert_eq!(g.queues[1].unsafe_size(), 1);
        assert_eq!(a.state(), FiberState::Ready);
        assert!(ptr::eq(a.scheduling_group().unwrap(), &g));

        let mut got = vec![g.acquire_fiber(0, &[]).unwrap(), g.acquire_fiber(0, &[]).unwrap()];
        got.sort_by_key(|f| f.id());
        assert_eq!(got, vec![a, b]);
        assert!(g.acquire_fiber(0, &[]).is_none());
        dispose(a);
        dispose(b);
    }

    #[test]
    fn test_full_queue_spills_to_overflow() {
        let g = group(1, 2);
        let fibers: Vec<_> = (0..4)
            .map(|_| instantiate_fiber_entity(&g, FiberDesc::new(|| {})).unwrap())
            .collect();
        for &f in &fibers {
            *f.scheduler_lock().lock() = FiberState::Waiting;
            g.ready_fiber(f, f.scheduler_lock().lock());
        }
        assert_eq!(g.queued(), 4);
        assert!(!g.overflow.is_empty());

        let mut seen = Vec::new();
        while let Some(f) = g.acquire_fiber(0, &[]) {
            seen.push(f);
        }
        assert_eq!(seen.len(), 4);
        for f in fibers {
            dispose(f);
        }
    }

    #[test]
    fn test_cross_group_steal_skips_local_fibers() {
        let config = SchedulerConfig::new().workers_per_group(1).cross_group_stealing(true);
        let live = Arc::new(AtomicUsize::new(0));
        let groups = [
            SchedulingGroup::new(0, &config, Arc::clone(&live)),
            SchedulingGroup::new(1, &config, Arc::clone(&live)),
        ];

        let mut desc = FiberDesc::new(|| {});
        desc.scheduling_group_local = true;
        let local = instantiate_fiber_entity(&groups[1], desc).unwrap();
        let free = instantiate_fiber_entity(&groups[1], FiberDesc::new(|| {})).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);

        *local.scheduler_lock().lock() = FiberState::Waiting;
        groups[1].ready_fiber(local, local.scheduler_lock().lock());
        // The local fiber sits at the tail, so nothing can be stolen
        assert!(groups[0].acquire_fiber(0, &groups).is_none());
        assert_eq!(groups[1].acquire_fiber(0, &groups), Some(local));

        *free.scheduler_lock().lock() = FiberState::Waiting;
        groups[1].ready_fiber(free, free.scheduler_lock().lock());
        assert_eq!(groups[0].acquire_fiber(0, &groups), Some(free));

        dispose(local);
        dispose(free);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_fiber_rejected_after_stop() {
        let g = group(1, 8);
        g.stop();
        let err = g.start_fiber(FiberDesc::new(|| {}), Launch::Post).unwrap_err();
        assert_eq!(err, FiberError::ShuttingDown);
        assert_eq!(g.live_fibers(), 0);
    }

    #[test]
    fn test_should_exit_waits_for_live_fibers() {
        let g = group(1, 8);
        let f = instantiate_fiber_entity(&g, FiberDesc::new(|| {})).unwrap();
        g.stop();
        assert!(!g.should_exit());
        dispose(f);
        assert!(g.should_exit());
    }
}
