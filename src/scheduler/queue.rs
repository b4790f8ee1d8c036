//! The shared work queue.
//!
//! A power-of-two ring of job indices with one shared tail and one head per
//! worker. Producers claim a position by advancing the tail, then publish the
//! job into that slot. Every worker walks the whole window between its head
//! and the tail and claims jobs by swapping the slot back to empty, so a job is
//! executed by whichever worker reaches it first. There is no owner per job and
//! an idle worker consumes whatever any producer queued.
//!
//! Positions are 64-bit and never wrap in practice; only the slot index is
//! reduced modulo the ring length.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::{Backoff, CachePadded};

/// Empty slot marker.
pub(crate) const NONE: u32 = u32::MAX;

struct Slot {
    /// Position + 1 of the last job published into this slot.
    sequence: AtomicU64,
    job: AtomicU32,
}

pub(crate) struct WorkQueue {
    slots: Box<[Slot]>,
    mask: u64,
    heads: Box<[CachePadded<AtomicU64>]>,
    active: AtomicUsize,
    tail: CachePadded<AtomicU64>,
}

impl WorkQueue {
    /// # Panics
    ///
    /// Panics if `length` is not a power of two.
    pub(crate) fn new(length: usize, max_workers: usize) -> Self {
        assert!(length.is_power_of_two(), "queue length must be a power of two");
        Self {
            slots: (0..length)
                .map(|_| Slot {
                    sequence: AtomicU64::new(0),
                    job: AtomicU32::new(NONE),
                })
                .collect(),
            mask: length as u64 - 1,
            heads: (0..max_workers)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            active: AtomicUsize::new(0),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &Slot {
        #[allow(clippy::cast_possible_truncation)]
        &self.slots[(position & self.mask) as usize]
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn max_workers(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Oldest position some active worker has not yet passed.
    pub(crate) fn min_head(&self) -> u64 {
        let active = self.active.load(Ordering::Acquire);
        self.heads[..active]
            .iter()
            .map(|head| head.load(Ordering::Acquire))
            .fold(self.tail(), u64::min)
    }

    /// Publishes `job`.
    ///
    /// While the ring is full `on_full` is invoked before each backoff step;
    /// it must make progress possible (wake or help the workers).
    pub(crate) fn push(&self, job: u32, mut on_full: impl FnMut()) {
        debug_assert_ne!(job, NONE);
        let capacity = self.slots.len() as u64;
        let backoff = Backoff::new();
        let mut head = self.min_head();

        let position = loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail - head >= capacity {
                head = self.min_head();
                if tail - head >= capacity {
                    on_full();
                    if backoff.is_completed() {
                        std::thread::sleep(std::time::Duration::from_micros(100));
                    } else {
                        backoff.snooze();
                    }
                    continue;
                }
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break tail;
            }
        };

        // Every worker passed `position - len`, so the slot was consumed.
        let slot = self.slot(position);
        debug_assert_eq!(slot.job.load(Ordering::Relaxed), NONE);
        slot.job.store(job, Ordering::Relaxed);
        slot.sequence.store(position + 1, Ordering::Release);
    }

    /// Claims the next job in `worker`'s window.
    ///
    /// Returns `None` once the worker's head has caught up with the tail.
    pub(crate) fn pop(&self, worker: usize) -> Option<u32> {
        let head = &self.heads[worker];
        let mut position = head.load(Ordering::Relaxed);
        while position != self.tail.load(Ordering::Acquire) {
            let slot = self.slot(position);

            // Position claimed but not yet published.
            let backoff = Backoff::new();
            while slot.sequence.load(Ordering::Acquire) <= position {
                backoff.snooze();
            }

            let job = if slot.job.load(Ordering::Relaxed) == NONE {
                NONE
            } else {
                slot.job.swap(NONE, Ordering::AcqRel)
            };
            position += 1;
            head.store(position, Ordering::Release);
            if job != NONE {
                return Some(job);
            }
        }
        None
    }

    /// Activates `workers` heads and rewinds every cursor to zero.
    ///
    /// Must not run concurrently with `push` or `pop`.
    pub(crate) fn reset(&self, workers: usize) {
        debug_assert!(workers <= self.heads.len());
        for slot in self.slots.iter() {
            slot.sequence.store(0, Ordering::Relaxed);
            slot.job.store(NONE, Ordering::Relaxed);
        }
        for head in self.heads.iter() {
            head.store(0, Ordering::Relaxed);
        }
        self.tail.store(0, Ordering::Relaxed);
        self.active.store(workers, Ordering::Release);
    }

    /// Hands every job still in the window to `f`.
    ///
    /// Must not run concurrently with `push` or `pop`.
    pub(crate) fn drain(&self, mut f: impl FnMut(u32)) {
        let tail = self.tail();
        for position in self.min_head()..tail {
            let job = self.slot(position).job.swap(NONE, Ordering::AcqRel);
            if job != NONE {
                f(job);
            }
        }
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("workers", &self.active.load(Ordering::Relaxed))
            .field("tail", &self.tail())
            .field("min_head", &self.min_head())
            .finish()
    }
}
