//! Fiber stack memory
//!
//! Two sources:
//!
//! - **Pooled** stacks (the configured default size) are mapped with a
//!   guard page below them and, once freed, cached in a process-wide
//!   pool for reuse. The pool's free list is threaded through the cached
//!   stacks themselves, in their top page.
//! - **System** stacks (any other size) come from the global allocator,
//!   page aligned, with no guard page.
//!
//! ```text
//!   low                                                      high
//!   | guard (pooled only) | usable stack ...  | top page          |
//!                         ^ base              ^ stack top
//!                                             | magic | entity    |
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix::{map_stack, unmap_stack};
    } else {
        compile_error!("rfiber stacks need a unix platform");
    }
}

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use rfiber_core::error::MemoryError;
use rfiber_core::{impl_singly_linked, kerror, ktrace};
use rfiber_core::{SinglyLinkedList, SinglyLinkedListEntry, SpinLock};

/// Page size used when `sysconf` gives nothing usable
const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, queried once
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .filter(|v| v.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE);
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `size` up to a whole number of pages
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// A fiber stack: `[base, base + size)`, growing down from the top
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
    from_system: bool,
}

// Safety: a stack is plain memory owned by exactly one fiber
unsafe impl Send for Stack {}

impl Stack {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest usable byte
    #[inline]
    pub fn end(&self) -> *mut u8 {
        // Safety: stays within (one past) the allocation
        unsafe { self.base().add(self.size) }
    }

    /// Start of the top page, where the control block lives
    #[inline]
    pub fn top_page(&self) -> *mut u8 {
        // Safety: stacks are at least two pages
        unsafe { self.end().sub(page_size()) }
    }

    #[inline]
    pub fn is_from_system(&self) -> bool {
        self.from_system
    }

    /// Rebuild a `Stack` from its parts (as recorded in a control block)
    ///
    /// # Safety
    ///
    /// The parts must come from a `Stack` that was not freed since.
    pub unsafe fn from_raw_parts(base: *mut u8, size: usize, from_system: bool) -> Self {
        Stack {
            base: NonNull::new_unchecked(base),
            size,
            from_system,
        }
    }
}

/// Header written into the top page of a cached stack
struct FreeStack {
    link: SinglyLinkedListEntry,
    base: *mut u8,
    size: usize,
}

impl_singly_linked!(FreeStack, link);

// Safety: only reachable through the pool lock
unsafe impl Send for FreeStack {}

struct StackPool {
    free: SpinLock<SinglyLinkedList<FreeStack>>,
    capacity: AtomicUsize,
}

static STACK_POOL: StackPool = StackPool {
    free: SpinLock::new(SinglyLinkedList::new()),
    capacity: AtomicUsize::new(1024),
};

/// Set how many freed stacks the pool keeps
pub fn set_pool_capacity(capacity: usize) {
    STACK_POOL.capacity.store(capacity, Ordering::Relaxed);
}

/// Number of stacks currently cached
pub fn pool_len() -> usize {
    STACK_POOL.free.lock().len()
}

/// Allocate a stack of `size` bytes (rounded up to pages)
///
/// `pooled` selects the pool (guard page, cached on free) over the system
/// allocator.
pub fn allocate_stack(size: usize, pooled: bool) -> Result<Stack, MemoryError> {
    let size = round_up_to_page(size);
    if size < 2 * page_size() {
        return Err(MemoryError::StackTooSmall);
    }
    if pooled {
        allocate_pooled(size)
    } else {
        allocate_system(size)
    }
}

fn allocate_pooled(size: usize) -> Result<Stack, MemoryError> {
    loop {
        let cached = {
            let mut free = STACK_POOL.free.lock();
            if free.is_empty() {
                None
            } else {
                Some(free.pop_front())
            }
        };
        let Some(header) = cached else { break };

        // Safety: the header was written by `free_stack` and the stack is ours now
        let (base, cached_size) = unsafe {
            let h = header.as_ptr();
            ((*h).base, (*h).size)
        };
        if cached_size == size {
            // Safety: base is non-null for every cached stack
            return Ok(unsafe { Stack::from_raw_parts(base, size, false) });
        }
        // Default size changed since this stack was cached
        unsafe { unmap_stack(base, cached_size) };
    }

    let base = map_stack(size).inspect_err(|e| kerror!("stack mapping failed: {}", e))?;
    ktrace!("mapped new {} byte stack at {:p}", size, base.as_ptr());
    Ok(Stack {
        base,
        size,
        from_system: false,
    })
}

fn allocate_system(size: usize) -> Result<Stack, MemoryError> {
    let layout =
        Layout::from_size_align(size, page_size()).map_err(|_| MemoryError::AllocationFailed)?;
    // Safety: layout has non-zero size
    let base = unsafe { alloc::alloc(layout) };
    let base = NonNull::new(base).ok_or(MemoryError::AllocationFailed)?;
    Ok(Stack {
        base,
        size,
        from_system: true,
    })
}

/// Return a stack to where it came from
///
/// # Safety
///
/// Nothing may be running on, or pointing into, the stack anymore.
pub unsafe fn free_stack(stack: Stack) {
    if stack.from_system {
        let layout = Layout::from_size_align_unchecked(stack.size, page_size());
        alloc::dealloc(stack.base(), layout);
        return;
    }

    let mut free = STACK_POOL.free.lock();
    if free.len() < STACK_POOL.capacity.load(Ordering::Relaxed) {
        let header = stack.top_page().cast::<FreeStack>();
        header.write(FreeStack {
            link: SinglyLinkedListEntry::new(),
            base: stack.base(),
            size: stack.size,
        });
        free.push_front(NonNull::new_unchecked(header));
        return;
    }
    drop(free);
    unmap_stack(stack.base(), stack.size);
}

/// Unmap every cached stack
pub fn drain_pool() {
    let mut drained = SinglyLinkedList::new();
    drained.assign_from(&mut STACK_POOL.free.lock());
    while !drained.is_empty() {
        let header = drained.pop_front();
        // Safety: cached stacks are owned by the pool alone
        unsafe {
            let h = header.as_ptr();
            unmap_stack((*h).base, (*h).size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
    }

    #[test]
    fn test_too_small_rejected() {
        assert_eq!(
            allocate_stack(page_size(), false).unwrap_err(),
            MemoryError::StackTooSmall
        );
    }

    #[test]
    fn test_system_stack_is_writable() {
        let stack = allocate_stack(64 * 1024, false).unwrap();
        assert!(stack.is_from_system());
        assert_eq!(stack.base() as usize % page_size(), 0);
        unsafe {
            stack.base().write_bytes(0xAB, stack.size());
            assert_eq!(*stack.end().sub(1), 0xAB);
            free_stack(stack);
        }
    }

    #[test]
    fn test_pooled_stack_reused() {
        // Odd size so concurrent tests using other sizes do not interfere
        let size = 40 * page_size();
        let stack = allocate_stack(size, true).unwrap();
        assert!(!stack.is_from_system());
        let base = stack.base();
        unsafe {
            stack.top_page().write_bytes(0, page_size());
            free_stack(stack);
        }

        let again = allocate_stack(size, true).unwrap();
        assert_eq!(again.size(), size);
        // Either our cached stack or a fresh one if another test raced us
        if again.base() == base {
            assert!(!again.is_from_system());
        }
        unsafe { free_stack(again) };
    }
}
