//! Exit barrier: one-shot countdown joined by fibers and threads alike
//!
//! Fibers waiting on the barrier are parked on an intrusive wait list and
//! halted; they cost no OS thread. Plain threads block on a condition
//! variable instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use rfiber_core::{DoublyLinkedList, FiberState, SpinLock};

use crate::entity::{FiberEntity, FiberPtr};
use crate::group::SchedulingGroup;
use crate::tls;

struct BarrierState {
    count: usize,
    waiters: DoublyLinkedList<FiberEntity>,
}

pub struct ExitBarrier {
    state: SpinLock<BarrierState>,
    done: Mutex<bool>,
    cond: Condvar,
    panicked: AtomicBool,
}

impl ExitBarrier {
    /// A barrier released by a single `count_down`
    pub fn new() -> Self {
        Self::with_count(1)
    }

    pub fn with_count(count: usize) -> Self {
        ExitBarrier {
            state: SpinLock::new(BarrierState {
                count,
                waiters: DoublyLinkedList::new(),
            }),
            done: Mutex::new(count == 0),
            cond: Condvar::new(),
            panicked: AtomicBool::new(false),
        }
    }

    /// Whether the count already reached zero
    pub fn is_released(&self) -> bool {
        self.state.lock().count == 0
    }

    /// Decrement the count, waking every waiter when it reaches zero
    ///
    /// `panicked` is sticky: one panicking party marks the barrier.
    pub fn count_down(&self, panicked: bool) {
        if panicked {
            self.panicked.store(true, Ordering::Release);
        }

        let mut waiters = DoublyLinkedList::new();
        {
            let mut state = self.state.lock();
            assert!(state.count > 0, "exit barrier counted down too many times");
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            waiters.swap(&mut state.waiters);
        }

        while let Some(waiter) = waiters.pop_front() {
            // Safety: waiters stay alive while halted on our list
            let fiber = unsafe { FiberPtr::from_non_null(waiter) };
            // Spins until the master of the halting worker releases it
            let guard = fiber.scheduler_lock().lock();
            assert_eq!(*guard, FiberState::Waiting, "barrier waiter {} not waiting", fiber.id());
            match fiber.scheduling_group() {
                Some(group) => group.ready_fiber(fiber, guard),
                None => panic!("barrier waiter {} has no scheduling group", fiber.id()),
            }
        }

        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    /// Block until the count reaches zero
    ///
    /// Inside a fiber only the fiber is suspended. Returns whether any
    /// party counted down with `panicked` set.
    pub fn wait(&self) -> bool {
        match (tls::current_user_fiber(), tls::current_group()) {
            (Some(fiber), Some(group)) => self.wait_fiber(fiber, group),
            _ => self.wait_thread(),
        }
        self.panicked.load(Ordering::Acquire)
    }

    fn wait_fiber(&self, fiber: FiberPtr, group: &SchedulingGroup) {
        let mut state = self.state.lock();
        if state.count == 0 {
            return;
        }
        // Lock order: barrier, then fiber
        let guard = fiber.scheduler_lock().lock();
        // Safety: the fiber is running (so in no other list) and stays
        // alive until count_down pops it
        unsafe { state.waiters.push_back(fiber.as_non_null()) };
        drop(state);
        group.halt(fiber, guard);
    }

    fn wait_thread(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for ExitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExitBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitBarrier")
            .field("released", &self.is_released())
            .field("panicked", &self.panicked.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_wait_released() {
        let barrier = Arc::new(ExitBarrier::new());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait())
        };
        thread::sleep(Duration::from_millis(10));
        assert!(!barrier.is_released());
        barrier.count_down(false);
        assert!(!waiter.join().unwrap());
        assert!(barrier.is_released());
    }

    #[test]
    fn test_panicked_is_sticky() {
        let barrier = ExitBarrier::with_count(2);
        barrier.count_down(true);
        assert!(!barrier.is_released());
        barrier.count_down(false);
        assert!(barrier.wait());
    }

    #[test]
    fn test_zero_count_is_released() {
        let barrier = ExitBarrier::with_count(0);
        assert!(barrier.is_released());
        assert!(!barrier.wait());
    }

    #[test]
    #[should_panic(expected = "too many times")]
    fn test_extra_count_down_panics() {
        let barrier = ExitBarrier::new();
        barrier.count_down(false);
        barrier.count_down(false);
    }
}
