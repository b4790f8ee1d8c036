//! `FreeList` — a fixed-capacity lock-free free list over a preallocated array.
//!
//! Objects are constructed once up front and recycled by index. The list of
//! free slots is an intrusive stack threaded through each slot's `next_free`
//! link. The head packs the slot index with a tag that changes on every
//! successful update, so a thread holding a stale head cannot win a CAS after
//! the same index has been popped and pushed again.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

/// Sentinel index meaning "no slot".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Head layout: [Tag: 32 bits | Index: 32 bits]
const TAG_SHIFT: u32 = 32;
const INDEX_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[inline]
fn pack(index: u32, tag: u32) -> u64 {
    (u64::from(tag) << TAG_SHIFT) | u64::from(index)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn unpack(head: u64) -> (u32, u32) {
    ((head & INDEX_MASK) as u32, (head >> TAG_SHIFT) as u32)
}

struct Slot<T> {
    /// Next free index while free; the slot's own index while allocated.
    next_free: AtomicU32,
    value: T,
}

/// Lock-free pool of `capacity` preconstructed objects addressed by `u32` index.
pub struct FreeList<T> {
    slots: Box<[Slot<T>]>,
    first_free: CachePadded<AtomicU64>,
    available: AtomicUsize,
}

impl<T: Default> FreeList<T> {
    /// Creates a list of `capacity` default-constructed objects, all free.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not below [`INVALID_INDEX`].
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self::from_fn(capacity, |_| T::default())
    }
}

impl<T> FreeList<T> {
    /// Creates a list whose object at index `i` is `init(i)`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not below [`INVALID_INDEX`].
    pub fn from_fn(capacity: u32, mut init: impl FnMut(u32) -> T) -> Self {
        assert!(capacity < INVALID_INDEX, "free list capacity too large");
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|index| Slot {
                next_free: AtomicU32::new(if index + 1 < capacity { index + 1 } else { INVALID_INDEX }),
                value: init(index),
            })
            .collect();
        let first = if capacity == 0 { INVALID_INDEX } else { 0 };
        Self {
            slots,
            // Tag starts at 1 so a zeroed head is never mistaken for a live one.
            first_free: CachePadded::new(AtomicU64::new(pack(first, 1))),
            available: AtomicUsize::new(capacity as usize),
        }
    }

    /// Pops a free slot. Returns `None` when every slot is in use.
    pub fn allocate(&self) -> Option<u32> {
        let mut current = self.first_free.load(Ordering::Acquire);
        loop {
            let (index, tag) = unpack(current);
            if index == INVALID_INDEX {
                return None;
            }

            let slot = &self.slots[index as usize];
            let next = slot.next_free.load(Ordering::Acquire);
            let new_head = pack(next, tag.wrapping_add(1));

            match self.first_free.compare_exchange_weak(
                current,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    slot.next_free.store(index, Ordering::Relaxed);
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Pushes `index` back onto the list.
    ///
    /// The caller must own the slot: it came from [`allocate`](Self::allocate)
    /// and has not been freed since.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range. Double frees are caught by a debug
    /// assertion.
    pub fn free(&self, index: u32) {
        let slot = &self.slots[index as usize];
        debug_assert_eq!(
            slot.next_free.load(Ordering::Relaxed),
            index,
            "freeing a slot that is already in the free list"
        );

        let mut current = self.first_free.load(Ordering::Acquire);
        loop {
            let (head, tag) = unpack(current);
            slot.next_free.store(head, Ordering::Release);

            match self.first_free.compare_exchange_weak(
                current,
                pack(index, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the object stored at `index`, allocated or not.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[inline]
    pub fn get(&self, index: u32) -> &T {
        &self.slots[index as usize].value
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of free slots; exact when the list is quiescent.
    #[inline]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Iterates over every object with its index, allocated or not.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        (0u32..).zip(self.slots.iter().map(|slot| &slot.value))
    }
}

impl<T> fmt::Debug for FreeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
