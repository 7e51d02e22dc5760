//! Fiber-local variables
//!
//! The fiber counterpart of `thread_local!`: each fiber sees its own copy,
//! wherever it migrates. Values are dropped when the fiber exits.
//!
//! ```ignore
//! use std::cell::Cell;
//! use rfiber::FiberLocal;
//!
//! static REQUEST_ID: FiberLocal<Cell<u64>> = FiberLocal::new(|| Cell::new(0));
//!
//! REQUEST_ID.with(|id| id.set(42));
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use rfiber_core::fls::{alloc_fls_index, alloc_trivial_fls_index};
use rfiber_core::{FiberError, FiberResult, Trivial};
use rfiber_runtime::tls;

const UNALLOCATED: usize = usize::MAX;

/// Slot index of a local, allocated on first use
fn lazy_index(cell: &AtomicUsize, alloc: fn() -> usize) -> usize {
    let index = cell.load(Ordering::Acquire);
    if index != UNALLOCATED {
        return index;
    }
    let fresh = alloc();
    // A racing loser leaks its index; indices are never reused anyway
    match cell.compare_exchange(UNALLOCATED, fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(winner) => winner,
    }
}

/// A fiber-local value of any `Send` type, lazily created by `init`
pub struct FiberLocal<T: Send + 'static> {
    index: AtomicUsize,
    init: fn() -> T,
}

impl<T: Send + 'static> FiberLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        FiberLocal {
            index: AtomicUsize::new(UNALLOCATED),
            init,
        }
    }

    /// Run `f` with the calling fiber's value
    ///
    /// # Panics
    ///
    /// Outside a fiber. Use [`try_with`](Self::try_with) to get an error
    /// instead.
    pub fn with<F, R>(&'static self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        match self.try_with(f) {
            Ok(r) => r,
            Err(e) => panic!("FiberLocal::with: {}", e),
        }
    }

    pub fn try_with<F, R>(&'static self, f: F) -> FiberResult<R>
    where
        F: FnOnce(&T) -> R,
    {
        let fiber = tls::current_user_fiber().ok_or(FiberError::NotInFiberContext)?;
        // Safety: we are the running fiber, the only one touching its storage
        let slot = unsafe { fiber.get_fls(lazy_index(&self.index, alloc_fls_index)) };

        // Only take `&mut` while the slot is empty: nested `with` calls on
        // the same local then share the value
        // Safety: the slot lives in the control block of the running fiber
        let value = unsafe {
            if (*slot.as_ptr()).is_empty() {
                let fresh = (self.init)();
                (*slot.as_ptr()).set(fresh);
            }
            (*slot.as_ptr()).get::<T>()
        };
        match value {
            Some(v) => Ok(f(v)),
            None => panic!("fiber-local slot holds a different type"),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for FiberLocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberLocal").finish_non_exhaustive()
    }
}

/// A fiber-local [`Trivial`] value kept in a zero-initialized word
///
/// Fresh fibers read the all-zero value (`0`, `false`, null).
pub struct TrivialFiberLocal<T: Trivial> {
    index: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Trivial> TrivialFiberLocal<T> {
    pub const fn new() -> Self {
        TrivialFiberLocal {
            index: AtomicUsize::new(UNALLOCATED),
            _marker: PhantomData,
        }
    }

    /// # Panics
    ///
    /// Outside a fiber.
    pub fn get(&'static self) -> T {
        self.with_cell(|cell| T::from_word(cell.get()))
    }

    /// # Panics
    ///
    /// Outside a fiber.
    pub fn set(&'static self, value: T) {
        self.with_cell(|cell| cell.set(value.into_word()));
    }

    /// Store `value`, returning the previous one
    pub fn replace(&'static self, value: T) -> T {
        self.with_cell(|cell| T::from_word(cell.replace(value.into_word())))
    }

    fn with_cell<R>(&'static self, f: impl FnOnce(&Cell<u64>) -> R) -> R {
        let fiber = match tls::current_user_fiber() {
            Some(f) => f,
            None => panic!("TrivialFiberLocal: {}", FiberError::NotInFiberContext),
        };
        let index = lazy_index(&self.index, alloc_trivial_fls_index);
        // Safety: the running fiber's storage, borrowed for `f` only; `f`
        // gets no chance to suspend the fiber
        f(unsafe { fiber.get_trivial_fls(index) })
    }
}

impl<T: Trivial> Default for TrivialFiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Trivial> std::fmt::Debug for TrivialFiberLocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrivialFiberLocal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_index_is_stable() {
        let cell = AtomicUsize::new(UNALLOCATED);
        let first = lazy_index(&cell, alloc_fls_index);
        assert_eq!(lazy_index(&cell, alloc_fls_index), first);
        assert_ne!(first, UNALLOCATED);
    }

    #[test]
    fn test_outside_fiber_is_an_error() {
        static LOCAL: FiberLocal<u32> = FiberLocal::new(|| 7);
        assert_eq!(LOCAL.try_with(|v| *v), Err(FiberError::NotInFiberContext));
    }

    #[test]
    #[should_panic(expected = "not in fiber context")]
    fn test_trivial_outside_fiber_panics() {
        static LOCAL: TrivialFiberLocal<u64> = TrivialFiberLocal::new();
        LOCAL.get();
    }
}
