//! Bounded lock-free MPMC queue of ready fibers
//!
//! One queue per worker. Any thread may push; the owning worker pops, its
//! group peers pop when they run dry, and workers of other groups steal.
//! Stealing only takes entries pushed as stealable, which is how group
//! affinity is enforced.
//!
//! # Algorithm
//!
//! A ring of `capacity` slots, each carrying a sequence number that is the
//! only coordination field. Slot `i` starts with `seq == i`.
//!
//! - A producer at position `head` owns slot `head & mask` once it sees
//!   `seq == head` and wins the CAS on `head`. It writes the value, then
//!   publishes with `seq = head + 1` (Release).
//! - A consumer at position `tail` sees a ready slot when
//!   `seq == tail + 1`, claims it with a CAS on `tail`, reads the value
//!   and re-arms the slot for the next lap with `seq = tail + capacity`.
//!
//! Each operation is linearized at the Acquire load of the slot's
//! sequence number. A producer or consumer delayed after that load may
//! still report "full" or "empty" although the queue changed since; callers
//! treat both as transient.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cache::CacheAligned;

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    stealable: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity lock-free MPMC ring buffer
pub struct WorkQueue<T> {
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    capacity: usize,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

// Safety: values are only moved in and out of slots by the thread that
// owns the slot according to its sequence number.
unsafe impl<T: Send> Send for WorkQueue<T> {}
unsafe impl<T: Send> Sync for WorkQueue<T> {}

impl<T: Copy> WorkQueue<T> {
    /// Create a queue holding at least `capacity` entries
    ///
    /// The capacity is rounded up to the next power of two, and is at
    /// least 2: with a single slot the sequence a push publishes equals
    /// the one the next lap expects of a free slot.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "work queue capacity must be > 0");
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                stealable: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        WorkQueue {
            head: CacheAligned::new(AtomicUsize::new(0)),
            tail: CacheAligned::new(AtomicUsize::new(0)),
            capacity,
            mask: capacity - 1,
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn slot(&self, pos: usize) -> &Slot<T> {
        &self.slots[pos & self.mask]
    }

    /// Push one entry. Returns false if the queue is full.
    pub fn push(&self, item: T, stealable: bool) -> bool {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let slot = self.slot(head);
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == head {
                if self
                    .head
                    .compare_exchange_weak(head, head.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: the CAS made this slot ours until we publish it
                    unsafe { (*slot.value.get()).write(item) };
                    slot.stealable.store(stealable, Ordering::Relaxed);
                    slot.seq.store(head.wrapping_add(1), Ordering::Release);
                    return true;
                }
            } else if seq.wrapping_add(self.capacity) == head.wrapping_add(1) {
                // Slot still holds last lap's entry
                return false;
            }
            core::hint::spin_loop();
        }
    }

    /// Push all of `items` or none of them
    ///
    /// Needs one free slot beyond the batch, so it may fail while the
    /// queue still has exactly `items.len()` free slots. Batches of
    /// `capacity` or more always fail. An empty batch trivially succeeds.
    pub fn batch_push(&self, items: &[T], stealable: bool) -> bool {
        let batch = items.len();
        if batch == 0 {
            return true;
        }
        if batch >= self.capacity {
            return false;
        }

        'retry: loop {
            let head_was = self.head.load(Ordering::Relaxed);
            let head = head_was.wrapping_add(batch);
            let seq = self.slot(head).seq.load(Ordering::Acquire);

            if seq == head {
                // The slot past the batch is free for this lap, now check the
                // whole range before claiming any of it.
                for i in 0..batch {
                    let pos = head_was.wrapping_add(i);
                    let seq = self.slot(pos).seq.load(Ordering::Acquire);
                    if seq != pos {
                        if seq.wrapping_add(self.capacity) == pos.wrapping_add(1) {
                            // Not consumed yet
                            return false;
                        }
                        core::hint::spin_loop();
                        continue 'retry;
                    }
                }

                if self
                    .head
                    .compare_exchange_weak(head_was, head, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    for (i, item) in items.iter().enumerate() {
                        let pos = head_was.wrapping_add(i);
                        let slot = self.slot(pos);
                        debug_assert_eq!(slot.seq.load(Ordering::Relaxed), pos);
                        // Safety: claimed by the CAS above
                        unsafe { (*slot.value.get()).write(*item) };
                        slot.stealable.store(stealable, Ordering::Relaxed);
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    }
                    return true;
                }
            } else if seq.wrapping_add(self.capacity) == head.wrapping_add(1) {
                return false;
            }
            core::hint::spin_loop();
        }
    }

    /// Pop the oldest entry, stealable or not
    pub fn pop(&self) -> Option<T> {
        self.pop_if(|_| true)
    }

    /// Pop the oldest entry if it was pushed as stealable
    ///
    /// Returns `None` when the entry at the tail is not stealable, even if
    /// stealable entries sit behind it.
    pub fn steal(&self) -> Option<T> {
        self.pop_if(|slot| slot.stealable.load(Ordering::Relaxed))
    }

    fn pop_if(&self, pred: impl Fn(&Slot<T>) -> bool) -> Option<T> {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let slot = self.slot(tail);
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == tail.wrapping_add(1) {
                if !pred(slot) {
                    return None;
                }
                if self
                    .tail
                    .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: published by the producer (Acquire above), and
                    // the CAS made us its only consumer
                    let item = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.seq
                        .store(tail.wrapping_add(self.capacity), Ordering::Release);
                    return Some(item);
                }
            } else if seq == tail || seq.wrapping_add(self.capacity) == tail {
                // Not filled yet, or wrapped around
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// Racy emptiness check, suitable as a hint only
    pub fn unsafe_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as isize <= 0
    }

    /// Racy size estimate, never above capacity
    pub fn unsafe_size(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let size = head.wrapping_sub(tail);
        if size > self.capacity {
            // Torn read of head/tail
            return 0;
        }
        size
    }
}
