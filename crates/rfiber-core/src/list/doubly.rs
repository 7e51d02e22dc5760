//! Intrusive doubly-linked list
//!
//! Circular with a heap-allocated sentinel, so the list value itself can
//! be moved freely while elements point at the sentinel. An entry whose
//! links point back at itself (or are still null, before first use) is
//! not in any list; `erase` and `pop_*` restore that state.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// Link fields embedded in a list element
#[derive(Debug)]
pub struct DoublyLinkedListEntry {
    prev: Cell<*mut DoublyLinkedListEntry>,
    next: Cell<*mut DoublyLinkedListEntry>,
}

impl DoublyLinkedListEntry {
    /// A detached entry
    pub const fn new() -> Self {
        DoublyLinkedListEntry {
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        }
    }

    /// Point both links at the entry itself
    ///
    /// Only meaningful once the entry has reached its final address.
    #[inline]
    pub fn init(&self) {
        let me = self.as_ptr();
        self.prev.set(me);
        self.next.set(me);
    }

    /// Whether the entry is currently in some list
    #[inline]
    pub fn is_linked(&self) -> bool {
        let next = self.next.get();
        !next.is_null() && next != self.as_ptr()
    }

    #[inline]
    fn as_ptr(&self) -> *mut DoublyLinkedListEntry {
        self as *const _ as *mut _
    }
}

impl Default for DoublyLinkedListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that embed a [`DoublyLinkedListEntry`]
///
/// # Safety
///
/// `entry_of` and `from_entry` must be exact inverses for the same
/// embedded field. Use [`impl_doubly_linked!`](crate::impl_doubly_linked).
pub unsafe trait DoublyLinked {
    fn entry_of(this: NonNull<Self>) -> NonNull<DoublyLinkedListEntry>;

    /// # Safety
    ///
    /// `entry` must be the embedded entry of a live `Self`.
    unsafe fn from_entry(entry: NonNull<DoublyLinkedListEntry>) -> NonNull<Self>;
}

/// Non-owning intrusive doubly-linked list
pub struct DoublyLinkedList<T: DoublyLinked> {
    head: NonNull<DoublyLinkedListEntry>,
    size: usize,
    _marker: PhantomData<*const T>,
}

// Safety: the list only hands out element pointers; moving it between
// threads is fine as long as the elements themselves may be.
unsafe impl<T: DoublyLinked + Send> Send for DoublyLinkedList<T> {}

impl<T: DoublyLinked> DoublyLinkedList<T> {
    pub fn new() -> Self {
        let head = NonNull::from(Box::leak(Box::new(DoublyLinkedListEntry::new())));
        // Safety: freshly allocated, owned by this list
        unsafe { head.as_ref().init() };
        DoublyLinkedList {
            head,
            size: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn head(&self) -> &DoublyLinkedListEntry {
        // Safety: the sentinel lives as long as the list
        unsafe { self.head.as_ref() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Insert between two adjacent entries
    ///
    /// # Safety
    ///
    /// `prev` and `next` must be adjacent members of this list (or the sentinel).
    unsafe fn link_between(
        entry: &DoublyLinkedListEntry,
        prev: *mut DoublyLinkedListEntry,
        next: *mut DoublyLinkedListEntry,
    ) {
        entry.prev.set(prev);
        entry.next.set(next);
        (*prev).next.set(entry.as_ptr());
        (*next).prev.set(entry.as_ptr());
    }

    /// # Safety
    ///
    /// `entry` must be linked into a list.
    unsafe fn unlink(entry: &DoublyLinkedListEntry) {
        let prev = entry.prev.get();
        let next = entry.next.get();
        (*prev).next.set(next);
        (*next).prev.set(prev);
        entry.init();
    }

    /// Link `item` at the front
    ///
    /// # Safety
    ///
    /// `item` must stay alive and in place until it is unlinked.
    pub unsafe fn push_front(&mut self, item: NonNull<T>) {
        let entry = T::entry_of(item).as_ref();
        assert!(!entry.is_linked(), "entry is already in a list");
        let head = self.head.as_ptr();
        Self::link_between(entry, head, (*head).next.get());
        self.size += 1;
    }

    /// Link `item` at the back
    ///
    /// # Safety
    ///
    /// `item` must stay alive and in place until it is unlinked.
    pub unsafe fn push_back(&mut self, item: NonNull<T>) {
        let entry = T::entry_of(item).as_ref();
        assert!(!entry.is_linked(), "entry is already in a list");
        let head = self.head.as_ptr();
        Self::link_between(entry, (*head).prev.get(), head);
        self.size += 1;
    }

    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        if self.is_empty() {
            return None;
        }
        let first = self.head().next.get();
        // Safety: non-empty, so `first` is a member entry
        unsafe {
            Self::unlink(&*first);
            self.size -= 1;
            Some(T::from_entry(NonNull::new_unchecked(first)))
        }
    }

    pub fn pop_back(&mut self) -> Option<NonNull<T>> {
        if self.is_empty() {
            return None;
        }
        let last = self.head().prev.get();
        // Safety: non-empty, so `last` is a member entry
        unsafe {
            Self::unlink(&*last);
            self.size -= 1;
            Some(T::from_entry(NonNull::new_unchecked(last)))
        }
    }

    /// First element. Panics if the list is empty.
    pub fn front(&self) -> NonNull<T> {
        assert!(!self.is_empty(), "front() on empty list");
        // Safety: non-empty
        unsafe { T::from_entry(NonNull::new_unchecked(self.head().next.get())) }
    }

    /// Last element. Panics if the list is empty.
    pub fn back(&self) -> NonNull<T> {
        assert!(!self.is_empty(), "back() on empty list");
        // Safety: non-empty
        unsafe { T::from_entry(NonNull::new_unchecked(self.head().prev.get())) }
    }

    /// Unlink `item`. Returns false if it was not in any list.
    ///
    /// # Safety
    ///
    /// If `item` is linked, it must be linked into *this* list.
    pub unsafe fn erase(&mut self, item: NonNull<T>) -> bool {
        let entry = T::entry_of(item).as_ref();
        if !entry.is_linked() {
            return false;
        }
        Self::unlink(entry);
        self.size -= 1;
        true
    }

    /// Move every element of `other` to the back of `self`, in order
    pub fn splice(&mut self, other: &mut DoublyLinkedList<T>) {
        if other.is_empty() {
            return;
        }
        let head = self.head.as_ptr();
        let other_head = other.head.as_ptr();
        // Safety: both sentinels are live; `other` is non-empty
        unsafe {
            let first = (*other_head).next.get();
            let last = (*other_head).prev.get();
            let tail = (*head).prev.get();

            (*tail).next.set(first);
            (*first).prev.set(tail);
            (*last).next.set(head);
            (*head).prev.set(last);

            (*other_head).init();
        }
        self.size += other.size;
        other.size = 0;
    }

    /// Exchange contents with `other`
    pub fn swap(&mut self, other: &mut DoublyLinkedList<T>) {
        core::mem::swap(&mut self.head, &mut other.head);
        core::mem::swap(&mut self.size, &mut other.size);
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head().next.get(),
            end: self.head.as_ptr(),
            _marker: PhantomData,
        }
    }
}

impl<T: DoublyLinked> Default for DoublyLinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DoublyLinked> Drop for DoublyLinkedList<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
        // Safety: allocated in `new` with Box, nothing points at it anymore
        unsafe { drop(Box::from_raw(self.head.as_ptr())) };
    }
}

/// Front-to-back iterator over element pointers
pub struct Iter<'a, T: DoublyLinked> {
    cur: *mut DoublyLinkedListEntry,
    end: *mut DoublyLinkedListEntry,
    _marker: PhantomData<&'a DoublyLinkedList<T>>,
}

impl<'a, T: DoublyLinked> Iterator for Iter<'a, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        if self.cur == self.end {
            return None;
        }
        // Safety: `cur` is a member entry while the list is borrowed
        unsafe {
            let item = T::from_entry(NonNull::new_unchecked(self.cur));
            self.cur = (*self.cur).next.get();
            Some(item)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impl_doubly_linked;

    struct Node {
        value: u32,
        chain: DoublyLinkedListEntry,
    }

    impl_doubly_linked!(Node, chain);

    fn nodes(values: &[u32]) -> Vec<Box<Node>> {
        values
            .iter()
            .map(|&value| {
                Box::new(Node {
                    value,
                    chain: DoublyLinkedListEntry::new(),
                })
            })
            .collect()
    }

    fn ptr(node: &Node) -> NonNull<Node> {
        NonNull::from(node)
    }

    fn values(list: &DoublyLinkedList<Node>) -> Vec<u32> {
        list.iter().map(|n| unsafe { n.as_ref().value }).collect()
    }

    #[test]
    fn test_push_pop_order() {
        let ns = nodes(&[1, 2, 3]);
        let mut list = DoublyLinkedList::new();
        unsafe {
            list.push_back(ptr(&ns[1]));
            list.push_back(ptr(&ns[2]));
            list.push_front(ptr(&ns[0]));
        }
        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(unsafe { list.front().as_ref().value }, 1);
        assert_eq!(unsafe { list.back().as_ref().value }, 3);

        assert_eq!(list.pop_back().map(|n| unsafe { n.as_ref().value }), Some(3));
        assert_eq!(list.pop_front().map(|n| unsafe { n.as_ref().value }), Some(1));
        assert_eq!(list.len(), 1);
        assert!(!ns[0].chain.is_linked());
        assert!(ns[1].chain.is_linked());
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let mut list: DoublyLinkedList<Node> = DoublyLinkedList::new();
        assert!(list.pop_front().is_none());
        assert!(list.pop_back().is_none());
    }

    #[test]
    #[should_panic]
    fn test_front_on_empty_panics() {
        let list: DoublyLinkedList<Node> = DoublyLinkedList::new();
        list.front();
    }

    #[test]
    fn test_erase_restores_self_link() {
        let ns = nodes(&[1, 2]);
        let mut list = DoublyLinkedList::new();
        unsafe {
            list.push_back(ptr(&ns[0]));
            list.push_back(ptr(&ns[1]));
            assert!(list.erase(ptr(&ns[0])));
            assert!(!list.erase(ptr(&ns[0])));
        }
        let me = &ns[0].chain as *const _ as *mut DoublyLinkedListEntry;
        assert_eq!(ns[0].chain.next.get(), me);
        assert_eq!(ns[0].chain.prev.get(), me);
        assert_eq!(list.len(), 1);
        assert_eq!(values(&list), vec![2]);

        // Detached entries can be linked again
        unsafe { list.push_front(ptr(&ns[0])) };
        assert_eq!(values(&list), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "already in a list")]
    fn test_double_push_panics() {
        let ns = nodes(&[1]);
        let mut list = DoublyLinkedList::new();
        unsafe {
            list.push_back(ptr(&ns[0]));
            list.push_back(ptr(&ns[0]));
        }
    }

    #[test]
    fn test_splice_appends_in_order() {
        let ns = nodes(&[1, 2, 3, 4, 5]);
        let mut a = DoublyLinkedList::new();
        let mut b = DoublyLinkedList::new();
        unsafe {
            for n in &ns[..3] {
                a.push_back(ptr(n));
            }
            for n in &ns[3..] {
                b.push_back(ptr(n));
            }
        }
        a.splice(&mut b);
        assert_eq!(a.len(), 5);
        assert_eq!(values(&a), vec![1, 2, 3, 4, 5]);
        assert!(b.is_empty());
        assert_eq!(values(&b), Vec::<u32>::new());

        // Splicing an empty list is a no-op
        a.splice(&mut b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_swap_exchanges_contents() {
        let ns = nodes(&[1, 2, 3, 4, 5]);
        let mut a = DoublyLinkedList::new();
        let mut b = DoublyLinkedList::new();
        unsafe {
            for n in &ns[..3] {
                a.push_back(ptr(n));
            }
            for n in &ns[3..] {
                b.push_back(ptr(n));
            }
        }
        a.swap(&mut b);
        assert_eq!(values(&a), vec![4, 5]);
        assert_eq!(values(&b), vec![1, 2, 3]);
        assert_eq!((a.len(), b.len()), (2, 3));
    }

    #[test]
    fn test_list_survives_move() {
        let ns = nodes(&[1, 2]);
        let mut list = DoublyLinkedList::new();
        unsafe {
            list.push_back(ptr(&ns[0]));
            list.push_back(ptr(&ns[1]));
        }
        let moved = Box::new(list);
        assert_eq!(values(&moved), vec![1, 2]);
    }

    #[test]
    fn test_drop_detaches_members() {
        let ns = nodes(&[1, 2]);
        {
            let mut list = DoublyLinkedList::new();
            unsafe {
                list.push_back(ptr(&ns[0]));
                list.push_back(ptr(&ns[1]));
            }
        }
        assert!(!ns[0].chain.is_linked());
        assert!(!ns[1].chain.is_linked());
    }
}
