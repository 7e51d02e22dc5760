//! Intrusive singly-linked list
//!
//! Null-terminated, with head and tail pointers and a tracked size. There
//! is no `erase` or `pop_back`. The runtime uses it for free lists, where
//! only the front is ever taken.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// Link field embedded in a list element
#[derive(Debug)]
pub struct SinglyLinkedListEntry {
    next: Cell<*mut SinglyLinkedListEntry>,
}

impl SinglyLinkedListEntry {
    pub const fn new() -> Self {
        SinglyLinkedListEntry {
            next: Cell::new(ptr::null_mut()),
        }
    }
}

impl Default for SinglyLinkedListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that embed a [`SinglyLinkedListEntry`]
///
/// # Safety
///
/// `entry_of` and `from_entry` must be exact inverses for the same
/// embedded field. Use [`impl_singly_linked!`](crate::impl_singly_linked).
pub unsafe trait SinglyLinked {
    fn entry_of(this: NonNull<Self>) -> NonNull<SinglyLinkedListEntry>;

    /// # Safety
    ///
    /// `entry` must be the embedded entry of a live `Self`.
    unsafe fn from_entry(entry: NonNull<SinglyLinkedListEntry>) -> NonNull<Self>;
}

/// Non-owning intrusive singly-linked list
pub struct SinglyLinkedList<T: SinglyLinked> {
    head: *mut SinglyLinkedListEntry,
    tail: *mut SinglyLinkedListEntry,
    size: usize,
    _marker: PhantomData<*const T>,
}

// Safety: see `DoublyLinkedList`
unsafe impl<T: SinglyLinked + Send> Send for SinglyLinkedList<T> {}

impl<T: SinglyLinked> SinglyLinkedList<T> {
    pub const fn new() -> Self {
        SinglyLinkedList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            size: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// # Safety
    ///
    /// `item` must not be in any list, and must stay alive and in place
    /// until it is popped.
    pub unsafe fn push_front(&mut self, item: NonNull<T>) {
        let entry = T::entry_of(item).as_ptr();
        (*entry).next.set(self.head);
        if self.head.is_null() {
            self.tail = entry;
        }
        self.head = entry;
        self.size += 1;
    }

    /// # Safety
    ///
    /// Same as [`push_front`](Self::push_front).
    pub unsafe fn push_back(&mut self, item: NonNull<T>) {
        let entry = T::entry_of(item).as_ptr();
        (*entry).next.set(ptr::null_mut());
        if self.tail.is_null() {
            self.head = entry;
        } else {
            (*self.tail).next.set(entry);
        }
        self.tail = entry;
        self.size += 1;
    }

    /// Remove and return the first element. Panics if the list is empty.
    pub fn pop_front(&mut self) -> NonNull<T> {
        assert!(!self.is_empty(), "pop_front() on empty list");
        let first = self.head;
        // Safety: non-empty, so `first` is a member entry
        unsafe {
            self.head = (*first).next.get();
            (*first).next.set(ptr::null_mut());
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            self.size -= 1;
            T::from_entry(NonNull::new_unchecked(first))
        }
    }

    /// First element. Panics if the list is empty.
    pub fn front(&self) -> NonNull<T> {
        assert!(!self.is_empty(), "front() on empty list");
        // Safety: non-empty
        unsafe { T::from_entry(NonNull::new_unchecked(self.head)) }
    }

    /// Last element. Panics if the list is empty.
    pub fn back(&self) -> NonNull<T> {
        assert!(!self.is_empty(), "back() on empty list");
        // Safety: non-empty
        unsafe { T::from_entry(NonNull::new_unchecked(self.tail)) }
    }

    /// Move every element of `other` to the back of `self`, in order
    pub fn splice(&mut self, other: &mut SinglyLinkedList<T>) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.swap(other);
            return;
        }
        // Safety: `self.tail` is a member entry
        unsafe { (*self.tail).next.set(other.head) };
        self.tail = other.tail;
        self.size += other.size;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.size = 0;
    }

    pub fn swap(&mut self, other: &mut SinglyLinkedList<T>) {
        core::mem::swap(&mut self.head, &mut other.head);
        core::mem::swap(&mut self.tail, &mut other.tail);
        core::mem::swap(&mut self.size, &mut other.size);
    }

    /// Take over the contents of `other`. Panics unless `self` is empty.
    pub fn assign_from(&mut self, other: &mut SinglyLinkedList<T>) {
        assert!(self.is_empty(), "assigning into a non-empty list");
        self.swap(other);
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head,
            _marker: PhantomData,
        }
    }
}

impl<T: SinglyLinked> Default for SinglyLinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-to-back iterator over element pointers
pub struct Iter<'a, T: SinglyLinked> {
    cur: *mut SinglyLinkedListEntry,
    _marker: PhantomData<&'a SinglyLinkedList<T>>,
}

impl<'a, T: SinglyLinked> Iterator for Iter<'a, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let cur = NonNull::new(self.cur)?;
        // Safety: `cur` is a member entry while the list is borrowed
        unsafe {
            self.cur = cur.as_ref().next.get();
            Some(T::from_entry(cur))
        }
    }
}
