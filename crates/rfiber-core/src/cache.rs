//! Cache-line padding for contended atomics

use core::ops::{Deref, DerefMut};

// x86_64 and aarch64 prefetch cache lines in pairs, so pad to 128 there.
cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
        /// Wrapper aligning `T` to its own pair of cache lines
        #[derive(Debug, Default)]
        #[repr(align(128))]
        pub struct CacheAligned<T>(pub T);
    } else {
        /// Wrapper aligning `T` to its own cache line
        #[derive(Debug, Default)]
        #[repr(align(64))]
        pub struct CacheAligned<T>(pub T);
    }
}

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        CacheAligned(value)
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
