//! Spinlock used for fiber state transitions and short scheduler sections
//!
//! Besides the usual guard API, a guard can be leaked with
//! [`SpinLockGuard::leak`] so that the lock stays held across a context
//! switch. The holder on the other side then releases it with
//! [`SpinLock::force_unlock`]. This is how a fiber hands its own
//! transition lock to the master fiber when it goes to sleep.

use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set spinlock
///
/// Critical sections must be short and must never block. Fibers that need
/// to wait for something longer use a wait list (see `ExitBarrier`).
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

const MAX_PAUSE: u32 = 64;

// Safety: access to `data` is serialized by `locked`
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock
    ///
    /// Waits on plain loads with a doubling pause so that waiters do not
    /// keep stealing the cache line from the holder.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut pause = 1u32;
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                for _ in 0..pause {
                    core::hint::spin_loop();
                }
                pause = (pause * 2).min(MAX_PAUSE);
            }
        }
        SpinLockGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        (!self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire))
            .then(|| SpinLockGuard { lock: self })
    }

    /// Re-create a guard for a lock whose guard was leaked
    ///
    /// # Safety
    ///
    /// The lock must be held, and the caller must be the logical owner of
    /// that acquisition (typically the receiving side of a leaked guard).
    #[inline]
    pub unsafe fn assume_locked(&self) -> SpinLockGuard<'_, T> {
        debug_assert!(self.is_locked());
        SpinLockGuard { lock: self }
    }

    /// Release a lock whose guard was leaked
    ///
    /// # Safety
    ///
    /// The lock must be held and no guard for it may be alive.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        debug_assert!(self.is_locked());
        self.locked.store(false, Ordering::Release);
    }

    /// Racy: only meaningful for assertions
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Releases the lock on drop, unless leaked
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Forget the guard, leaving the lock held
    ///
    /// Returns the lock so the caller can later release it with
    /// [`SpinLock::force_unlock`] or re-adopt it with
    /// [`SpinLock::assume_locked`].
    #[inline]
    pub fn leak(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        mem::forget(guard);
        lock
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard proves the lock is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the lock is held
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
