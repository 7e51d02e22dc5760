//! Fiber-local storage slots
//!
//! Every fiber carries a [`FiberLocalStorage`]: 8 inline type-erased slots,
//! 8 inline 8-byte trivial slots, and overflow maps for higher indices.
//! Indices are handed out once per process by [`alloc_fls_index`] /
//! [`alloc_trivial_fls_index`] and never reused, so a new local can never
//! observe a value left behind by an older one.
//!
//! Storage is only ever touched by the fiber that owns it, which is why
//! the accessors take `&self` and the type is neither `Send` nor `Sync`
//! on its own.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of slots of each kind stored inline in the control block
pub const INLINE_FLS_SLOTS: usize = 8;

static NEXT_FLS_INDEX: AtomicUsize = AtomicUsize::new(0);
static NEXT_TRIVIAL_FLS_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Allocate an index for a non-trivial fiber-local
pub fn alloc_fls_index() -> usize {
    NEXT_FLS_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// Allocate an index for a trivial fiber-local
pub fn alloc_trivial_fls_index() -> usize {
    NEXT_TRIVIAL_FLS_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// An owned, type-erased value (or nothing)
#[derive(Default)]
pub struct ErasedPtr(Option<Box<dyn Any + Send>>);

impl ErasedPtr {
    pub const fn new() -> Self {
        ErasedPtr(None)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the value if it is a `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_deref_mut().and_then(|v| v.downcast_mut())
    }

    /// Replace the held value, dropping the old one
    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    /// Drop the held value
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Borrow the `T`, creating it with `init` if the slot is empty
    ///
    /// Panics if the slot holds a value of another type.
    pub fn get_or_insert_with<T: Any + Send>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        if self.0.is_none() {
            self.0 = Some(Box::new(init()));
        }
        self.get_mut::<T>().expect("fiber-local slot holds a different type")
    }
}

impl std::fmt::Debug for ErasedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "ErasedPtr(empty)")
        } else {
            write!(f, "ErasedPtr(..)")
        }
    }
}

/// Plain values that fit in a zero-initialized 8-byte trivial slot
///
/// A fresh slot reads back as the all-zero value (`0`, `false`, `0.0`,
/// `'\0'`, null). Besides the primitives, small plain-old-data types can
/// opt in with an empty impl and use the bytewise default methods:
///
/// ```
/// use rfiber_core::Trivial;
///
/// #[derive(Clone, Copy, PartialEq, Debug)]
/// #[repr(C)]
/// struct Span {
///     start: u32,
///     len: u32,
/// }
///
/// // Safety: 8 bytes, no padding, all-zero is a valid Span
/// unsafe impl Trivial for Span {}
///
/// let span = Span { start: 3, len: 9 };
/// assert_eq!(Span::from_word(span.into_word()), span);
/// assert_eq!(Span::from_word(0), Span { start: 0, len: 0 });
/// ```
///
/// # Safety
///
/// Implementors using the default methods must have no padding bytes and
/// accept the all-zero bit pattern as a valid value. Types larger than
/// 8 bytes are rejected at compile time.
pub unsafe trait Trivial: Copy + 'static {
    #[inline]
    fn into_word(self) -> u64 {
        const { assert!(mem::size_of::<Self>() <= mem::size_of::<u64>(), "trivial values are at most 8 bytes") };
        let mut word = 0u64;
        // Safety: fits (checked above) and has no padding (trait contract)
        unsafe {
            ptr::copy_nonoverlapping(
                (&self as *const Self).cast::<u8>(),
                (&mut word as *mut u64).cast::<u8>(),
                mem::size_of::<Self>(),
            );
        }
        word
    }

    #[inline]
    fn from_word(word: u64) -> Self {
        const { assert!(mem::size_of::<Self>() <= mem::size_of::<u64>(), "trivial values are at most 8 bytes") };
        // Safety: `word` is zero or came from `into_word` (trait contract)
        unsafe { ptr::read_unaligned((&word as *const u64).cast::<Self>()) }
    }
}

macro_rules! impl_trivial_int {
    ($($t:ty),*) => {$(
        unsafe impl Trivial for $t {
            #[inline]
            fn into_word(self) -> u64 {
                self as u64
            }
            #[inline]
            fn from_word(word: u64) -> Self {
                word as $t
            }
        }
    )*};
}

impl_trivial_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

unsafe impl Trivial for bool {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        word != 0
    }
}

unsafe impl Trivial for f32 {
    #[inline]
    fn into_word(self) -> u64 {
        self.to_bits() as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        f32::from_bits(word as u32)
    }
}

unsafe impl Trivial for f64 {
    #[inline]
    fn into_word(self) -> u64 {
        self.to_bits()
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        f64::from_bits(word)
    }
}

unsafe impl Trivial for char {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_word(word: u64) -> Self {
        char::from_u32(word as u32).unwrap_or('\0')
    }
}

unsafe impl<T: 'static> Trivial for *const T {}
unsafe impl<T: 'static> Trivial for *mut T {}

/// Per-fiber local storage
pub struct FiberLocalStorage {
    inline: [UnsafeCell<ErasedPtr>; INLINE_FLS_SLOTS],
    inline_trivial: [Cell<u64>; INLINE_FLS_SLOTS],
    // Boxed so slot addresses survive rehashing
    external: UnsafeCell<Option<HashMap<usize, Box<UnsafeCell<ErasedPtr>>>>>,
    external_trivial: UnsafeCell<Option<HashMap<usize, Box<Cell<u64>>>>>,
}

impl FiberLocalStorage {
    pub fn new() -> Self {
        FiberLocalStorage {
            inline: Default::default(),
            inline_trivial: Default::default(),
            external: UnsafeCell::new(None),
            external_trivial: UnsafeCell::new(None),
        }
    }

    /// Slot for non-trivial local `index`
    ///
    /// The pointer stays valid until [`clear`](Self::clear) or drop.
    pub fn slot(&self, index: usize) -> NonNull<ErasedPtr> {
        if index < INLINE_FLS_SLOTS {
            // Safety: UnsafeCell is never null
            return unsafe { NonNull::new_unchecked(self.inline[index].get()) };
        }
        // Safety: only the owning fiber calls this, and the map is never
        // borrowed across the call
        let map = unsafe { &mut *self.external.get() };
        let cell = map
            .get_or_insert_with(HashMap::new)
            .entry(index)
            .or_insert_with(|| Box::new(UnsafeCell::new(ErasedPtr::new())));
        // Safety: UnsafeCell is never null
        unsafe { NonNull::new_unchecked(cell.get()) }
    }

    /// Slot for trivial local `index`, zero on first access
    pub fn trivial_slot(&self, index: usize) -> &Cell<u64> {
        if index < INLINE_FLS_SLOTS {
            return &self.inline_trivial[index];
        }
        // Safety: as in `slot`; entries are boxed and only removed by `clear`,
        // which needs `&mut self`
        let map = unsafe { &mut *self.external_trivial.get() };
        map.get_or_insert_with(HashMap::new)
            .entry(index)
            .or_insert_with(|| Box::new(Cell::new(0)))
    }

    /// Drop every value and zero every trivial slot
    pub fn clear(&mut self) {
        for slot in &mut self.inline {
            slot.get_mut().reset();
        }
        for slot in &self.inline_trivial {
            slot.set(0);
        }
        *self.external.get_mut() = None;
        *self.external_trivial.get_mut() = None;
    }
}

impl Default for FiberLocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_indices_never_reused() {
        let a = alloc_fls_index();
        let b = alloc_fls_index();
        assert_ne!(a, b);
        let t = alloc_trivial_fls_index();
        let u = alloc_trivial_fls_index();
        assert!(u > t);
    }

    #[test]
    fn test_erased_ptr() {
        let mut p = ErasedPtr::new();
        assert!(p.is_empty());
        assert!(p.get::<u32>().is_none());

        p.set(String::from("hello"));
        assert_eq!(p.get::<String>().map(String::as_str), Some("hello"));
        assert!(p.get::<u32>().is_none());

        p.get_mut::<String>().unwrap().push('!');
        assert_eq!(p.get::<String>().unwrap(), "hello!");

        p.reset();
        assert!(p.is_empty());
        assert_eq!(*p.get_or_insert_with(|| 5u8), 5);
    }

    #[test]
    fn test_reset_drops_value() {
        let tracker = Arc::new(());
        let mut p = ErasedPtr::new();
        p.set(Arc::clone(&tracker));
        assert_eq!(Arc::strong_count(&tracker), 2);
        p.reset();
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_trivial_slots_start_zeroed() {
        let fls = FiberLocalStorage::new();
        for index in [0, 7, 8, 1000] {
            assert_eq!(fls.trivial_slot(index).get(), 0);
        }
        assert!(!bool::from_word(fls.trivial_slot(3).get()));
        assert_eq!(f64::from_word(fls.trivial_slot(9).get()), 0.0);
    }

    #[test]
    fn test_trivial_roundtrip_types() {
        let fls = FiberLocalStorage::new();
        fls.trivial_slot(1).set((-7i32).into_word());
        fls.trivial_slot(20).set(1.5f64.into_word());
        fls.trivial_slot(2).set(true.into_word());
        assert_eq!(i32::from_word(fls.trivial_slot(1).get()), -7);
        assert_eq!(f64::from_word(fls.trivial_slot(20).get()), 1.5);
        assert!(bool::from_word(fls.trivial_slot(2).get()));
    }

    #[test]
    fn test_trivial_wider_types() {
        #[derive(Clone, Copy, PartialEq, Debug)]
        #[repr(C)]
        struct Pair {
            a: u16,
            b: u16,
            c: i32,
        }
        unsafe impl Trivial for Pair {}

        let fls = FiberLocalStorage::new();
        assert_eq!(char::from_word(fls.trivial_slot(4).get()), '\0');
        assert_eq!(Pair::from_word(fls.trivial_slot(5).get()), Pair { a: 0, b: 0, c: 0 });
        assert!(<*const u8>::from_word(fls.trivial_slot(6).get()).is_null());

        let value = 42u32;
        let pair = Pair { a: 1, b: 2, c: -3 };
        fls.trivial_slot(4).set('ß'.into_word());
        fls.trivial_slot(5).set(pair.into_word());
        fls.trivial_slot(30).set((&value as *const u32).into_word());
        assert_eq!(char::from_word(fls.trivial_slot(4).get()), 'ß');
        assert_eq!(Pair::from_word(fls.trivial_slot(5).get()), pair);
        assert_eq!(<*const u32>::from_word(fls.trivial_slot(30).get()), &value as *const u32);
    }

    #[test]
    fn test_overflow_slots_are_stable() {
        let fls = FiberLocalStorage::new();
        let first = fls.slot(8);
        unsafe { (*first.as_ptr()).set(42u64) };
        // Force the map to grow
        for index in 9..200 {
            fls.slot(index);
        }
        assert_eq!(fls.slot(8), first);
        assert_eq!(unsafe { first.as_ref() }.get::<u64>(), Some(&42));
    }

    #[test]
    fn test_clear() {
        let mut fls = FiberLocalStorage::new();
        unsafe {
            (*fls.slot(0).as_ptr()).set(1u32);
            (*fls.slot(12).as_ptr()).set(2u32);
        }
        fls.trivial_slot(4).set(9);
        fls.clear();
        assert!(unsafe { fls.slot(0).as_ref() }.is_empty());
        assert!(unsafe { fls.slot(12).as_ref() }.is_empty());
        assert_eq!(fls.trivial_slot(4).get(), 0);
    }
}
