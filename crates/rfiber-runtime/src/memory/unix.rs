//! Unix stack mapping using mmap

use std::ptr::{self, NonNull};

use rfiber_core::error::MemoryError;

use super::page_size;

/// Map `size` usable bytes with a PROT_NONE guard page below them
///
/// Returns the lowest usable address.
pub(super) fn map_stack(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let page = page_size();
    let total = size.checked_add(page).ok_or(MemoryError::AllocationFailed)?;

    let mapping = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapping == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed);
    }

    // Overflowing the stack runs into this page and faults
    let ret = unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) };
    if ret != 0 {
        unsafe { libc::munmap(mapping, total) };
        return Err(MemoryError::ProtectionFailed);
    }

    // Safety: mmap never returns null on success, and base stays inside the mapping
    Ok(unsafe { NonNull::new_unchecked(mapping.cast::<u8>().add(page)) })
}

/// Unmap a stack created by `map_stack`, guard page included
///
/// # Safety
///
/// `base` and `size` must come from one `map_stack` call.
pub(super) unsafe fn unmap_stack(base: *mut u8, size: usize) {
    let page = page_size();
    let ret = libc::munmap(base.sub(page).cast(), size + page);
    debug_assert_eq!(ret, 0, "munmap of fiber stack failed");
}
