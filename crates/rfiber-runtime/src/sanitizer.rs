//! Sanitizer annotations for stack switches
//!
//! With the `asan` or `tsan` feature enabled, every context switch tells
//! the sanitizer runtime which stack it is moving to. Without them
//! [`SanitizerContext`] is empty and every hook compiles to nothing.

#[cfg(any(feature = "asan", feature = "tsan"))]
use std::cell::Cell;
#[cfg(any(feature = "asan", feature = "tsan"))]
use std::ffi::c_void;
#[cfg(any(feature = "asan", feature = "tsan"))]
use std::ptr;

#[cfg(feature = "asan")]
extern "C" {
    fn __sanitizer_start_switch_fiber(
        fake_stack_save: *mut *mut c_void,
        bottom: *const c_void,
        size: usize,
    );
    fn __sanitizer_finish_switch_fiber(
        fake_stack_save: *mut c_void,
        bottom_old: *mut *const c_void,
        size_old: *mut usize,
    );
}

#[cfg(feature = "tsan")]
extern "C" {
    fn __tsan_get_current_fiber() -> *mut c_void;
    fn __tsan_create_fiber(flags: u32) -> *mut c_void;
    fn __tsan_destroy_fiber(fiber: *mut c_void);
    fn __tsan_switch_to_fiber(fiber: *mut c_void, flags: u32);
}

/// Per-fiber sanitizer state
pub struct SanitizerContext {
    #[cfg(feature = "asan")]
    fake_stack: Cell<*mut c_void>,
    #[cfg(feature = "asan")]
    stack_bottom: Cell<*const c_void>,
    #[cfg(feature = "asan")]
    stack_size: Cell<usize>,
    #[cfg(feature = "tsan")]
    tsan_fiber: Cell<*mut c_void>,
    #[cfg(feature = "tsan")]
    owns_tsan_fiber: bool,
}

impl Default for SanitizerContext {
    fn default() -> Self {
        SanitizerContext {
            #[cfg(feature = "asan")]
            fake_stack: Cell::new(ptr::null_mut()),
            #[cfg(feature = "asan")]
            stack_bottom: Cell::new(ptr::null()),
            #[cfg(feature = "asan")]
            stack_size: Cell::new(0),
            #[cfg(feature = "tsan")]
            tsan_fiber: Cell::new(ptr::null_mut()),
            #[cfg(feature = "tsan")]
            owns_tsan_fiber: false,
        }
    }
}

impl SanitizerContext {
    /// Context for a fiber running on `[bottom, bottom + size)`
    #[allow(unused_variables)]
    pub fn for_stack(bottom: *const u8, size: usize) -> Self {
        SanitizerContext {
            #[cfg(feature = "asan")]
            fake_stack: Cell::new(ptr::null_mut()),
            #[cfg(feature = "asan")]
            stack_bottom: Cell::new(bottom.cast()),
            #[cfg(feature = "asan")]
            stack_size: Cell::new(size),
            #[cfg(feature = "tsan")]
            tsan_fiber: Cell::new(unsafe { __tsan_create_fiber(0) }),
            #[cfg(feature = "tsan")]
            owns_tsan_fiber: true,
        }
    }

    /// Context for the calling thread's own stack
    pub fn for_current_thread() -> Self {
        let ctx = SanitizerContext::default();
        #[cfg(feature = "asan")]
        {
            let (bottom, size) = current_thread_stack();
            ctx.stack_bottom.set(bottom);
            ctx.stack_size.set(size);
        }
        #[cfg(feature = "tsan")]
        {
            ctx.tsan_fiber.set(unsafe { __tsan_get_current_fiber() });
        }
        ctx
    }

    /// Announce a switch from `self` to `to`
    #[inline]
    #[allow(unused_variables)]
    pub fn start_switch(&self, to: &SanitizerContext) {
        #[cfg(feature = "asan")]
        unsafe {
            __sanitizer_start_switch_fiber(
                self.fake_stack.as_ptr(),
                to.stack_bottom.get(),
                to.stack_size.get(),
            );
        }
        #[cfg(feature = "tsan")]
        unsafe {
            __tsan_switch_to_fiber(to.tsan_fiber.get(), 0);
        }
    }

    /// Complete a switch that landed on `self`
    #[inline]
    pub fn finish_switch(&self) {
        #[cfg(feature = "asan")]
        unsafe {
            __sanitizer_finish_switch_fiber(
                self.fake_stack.get(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
        }
    }
}

#[cfg(feature = "tsan")]
impl Drop for SanitizerContext {
    fn drop(&mut self) {
        if self.owns_tsan_fiber && !self.tsan_fiber.get().is_null() {
            unsafe { __tsan_destroy_fiber(self.tsan_fiber.get()) };
        }
    }
}

#[cfg(feature = "asan")]
fn current_thread_stack() -> (*const c_void, usize) {
    let mut attr = std::mem::MaybeUninit::<libc::pthread_attr_t>::uninit();
    let mut addr: *mut c_void = ptr::null_mut();
    let mut size = 0usize;
    unsafe {
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return (ptr::null(), 0);
        }
        libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
    }
    (addr as *const c_void, size)
}
