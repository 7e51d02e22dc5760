//! Thread-local fiber and worker context
//!
//! A fiber can be suspended on one worker and resumed on another, so a
//! thread-local read before a context switch may belong to a different
//! thread than the same read after it. The accessors are therefore never
//! inlined: each call re-derives the thread-local address instead of
//! reusing one cached across a switch.

use std::cell::Cell;
use std::ptr;

use crate::entity::FiberPtr;
use crate::group::SchedulingGroup;

thread_local! {
    /// Fiber currently running on this OS thread (the master fiber when idle)
    static CURRENT_FIBER: Cell<Option<FiberPtr>> = const { Cell::new(None) };

    /// This worker's master fiber
    static MASTER_FIBER: Cell<Option<FiberPtr>> = const { Cell::new(None) };

    /// Scheduling group and worker index, for worker threads only
    static WORKER: Cell<(*const SchedulingGroup, usize)> =
        const { Cell::new((ptr::null(), usize::MAX)) };
}

#[inline(never)]
pub fn current_fiber() -> Option<FiberPtr> {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_current_fiber(fiber: Option<FiberPtr>) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub fn master_fiber() -> Option<FiberPtr> {
    MASTER_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_master_fiber(fiber: Option<FiberPtr>) {
    MASTER_FIBER.with(|c| c.set(fiber));
}

/// Whether user code on this thread runs inside a fiber (not a master)
#[inline(never)]
pub fn is_in_fiber() -> bool {
    matches!(current_fiber(), Some(f) if !f.is_master())
}

/// The running non-master fiber, if any
#[inline]
pub fn current_user_fiber() -> Option<FiberPtr> {
    current_fiber().filter(|f| !f.is_master())
}

#[inline(never)]
pub(crate) fn set_worker(group: &SchedulingGroup, index: usize) {
    WORKER.with(|c| c.set((group as *const SchedulingGroup, index)));
}

#[inline(never)]
pub(crate) fn clear_worker() {
    WORKER.with(|c| c.set((ptr::null(), usize::MAX)));
}

/// Scheduling group of the calling worker thread
///
/// Groups outlive their worker threads and every fiber, so the reference
/// stays valid for as long as the caller runs on a worker.
#[inline(never)]
pub fn current_group() -> Option<&'static SchedulingGroup> {
    let (group, _) = WORKER.with(|c| c.get());
    // Safety: set by the worker loop for the lifetime of the worker thread
    unsafe { group.as_ref() }
}

/// Index of the calling worker within its group
#[inline(never)]
pub fn worker_index() -> Option<usize> {
    let (group, index) = WORKER.with(|c| c.get());
    (!group.is_null()).then_some(index)
}

/// Index of the calling worker if it belongs to `group`
#[inline(never)]
pub(crate) fn worker_index_in(group: &SchedulingGroup) -> Option<usize> {
    let (current, index) = WORKER.with(|c| c.get());
    ptr::eq(current, group).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_thread_has_no_context() {
        std::thread::spawn(|| {
            assert!(current_fiber().is_none());
            assert!(master_fiber().is_none());
            assert!(!is_in_fiber());
            assert!(current_group().is_none());
            assert!(worker_index().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_worker_index_in_only_matches_own_group() {
        use crate::config::SchedulerConfig;

        std::thread::spawn(|| {
            let config = SchedulerConfig::new().workers_per_group(2);
            let own = SchedulingGroup::new(0, &config, Default::default());
            let other = SchedulingGroup::new(1, &config, Default::default());

            set_worker(&own, 1);
            assert_eq!(worker_index_in(&own), Some(1));
            assert_eq!(worker_index_in(&other), None);
            assert_eq!(worker_index(), Some(1));

            // Another thread sees nothing
            let own_addr = &own as *const SchedulingGroup as usize;
            let seen = std::thread::spawn(move || {
                worker_index_in(unsafe { &*(own_addr as *const SchedulingGroup) })
            })
            .join()
            .unwrap();
            assert_eq!(seen, None);

            clear_worker();
            assert_eq!(worker_index_in(&own), None);
        })
        .join()
        .unwrap();
    }
}
