//! Barriers: fork-join groups a thread can wait on.
//!
//! A barrier keeps a ring of the jobs added to it and a semaphore that
//! finishing jobs release. The waiting thread does not just sleep: it keeps
//! executing ready jobs from its own ring and only blocks once none of them
//! can run.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::handle::JobHandle;
use super::queue::NONE;
use super::system::Shared;
use crate::concurrency::sync::{RawSemaphore, Semaphore};

pub(crate) struct Barrier {
    jobs: Box<[AtomicU32]>,
    mask: u64,
    read_index: CachePadded<AtomicU64>,
    write_index: CachePadded<AtomicU64>,
    /// Semaphore releases the waiter still has to consume.
    num_to_acquire: AtomicI32,
    semaphore: Semaphore,
    in_use: AtomicBool,
    generation: AtomicU32,
}

impl Barrier {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "barrier capacity must be a power of two");
        Self {
            jobs: (0..capacity).map(|_| AtomicU32::new(NONE)).collect(),
            mask: capacity as u64 - 1,
            read_index: CachePadded::new(AtomicU64::new(0)),
            write_index: CachePadded::new(AtomicU64::new(0)),
            num_to_acquire: AtomicI32::new(0),
            semaphore: Semaphore::default(),
            in_use: AtomicBool::new(false),
            generation: AtomicU32::new(0),
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &AtomicU32 {
        #[allow(clippy::cast_possible_truncation)]
        &self.jobs[(position & self.mask) as usize]
    }

    /// Moves the barrier from free to active. Returns the new generation on success.
    pub(crate) fn try_claim(&self) -> Option<u32> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| self.generation.load(Ordering::Acquire))
    }

    /// Moves the barrier back to free. The caller checked that it is empty.
    pub(crate) fn release_claim(&self) {
        debug_assert!(self.is_empty());
        self.generation.fetch_add(1, Ordering::AcqRel);
        let was_in_use = self.in_use.swap(false, Ordering::AcqRel);
        debug_assert!(was_in_use, "destroying a barrier that was never created");
    }

    #[inline]
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs added and not yet retired by a wait.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn len(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        (write - read) as usize
    }

    /// Starts tracking `jobs`.
    ///
    /// # Panics
    ///
    /// Panics if a job already belongs to another barrier or the ring would
    /// overflow.
    pub(crate) fn add_jobs(&self, shared: &Shared, barrier_index: u32, jobs: impl IntoIterator<Item = u32>) {
        let mut release_semaphore = false;
        let capacity = self.jobs.len() as u64;

        for index in jobs {
            let job = shared.job(index);
            if !job.set_barrier(barrier_index) {
                // Finished already, nothing to wait for.
                continue;
            }

            self.num_to_acquire.fetch_add(1, Ordering::AcqRel);

            // A ready job might never be picked up by a worker (zero threads,
            // or all of them busy), so make sure the waiter wakes up to run it.
            if !release_semaphore && job.can_be_executed() {
                release_semaphore = true;
                self.num_to_acquire.fetch_add(1, Ordering::AcqRel);
            }

            job.add_ref();

            let write = self.write_index.fetch_add(1, Ordering::AcqRel);
            let read = self.read_index.load(Ordering::Acquire);
            assert!(write - read < capacity, "barrier is full, raise barrier_capacity");
            self.slot(write).store(index, Ordering::Release);
        }

        if release_semaphore {
            self.semaphore.release(1);
        }
    }

    /// Called by the executing thread after a tracked job finished.
    #[inline]
    pub(crate) fn on_job_finished(&self) {
        self.semaphore.release(1);
    }

    /// Releases finished jobs at the front of the ring.
    fn retire_finished(&self, shared: &Shared) {
        let write = self.write_index.load(Ordering::Acquire);
        let mut read = self.read_index.load(Ordering::Relaxed);
        while read < write {
            let slot = self.slot(read);
            let index = slot.load(Ordering::Acquire);
            if index == NONE || !shared.job(index).is_done() {
                break;
            }
            slot.store(NONE, Ordering::Relaxed);
            shared.release_job(index);
            read += 1;
        }
        self.read_index.store(read, Ordering::Release);
    }

    /// Runs the first executable job in the ring. Returns `false` if there was none.
    fn execute_first_ready(&self, shared: &Shared) -> bool {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Relaxed);
        for position in read..write {
            let index = self.slot(position).load(Ordering::Acquire);
            if index != NONE && shared.job(index).can_be_executed() {
                shared.execute_job(index);
                return true;
            }
        }
        false
    }

    /// Blocks until every job added so far has finished, running ready ones
    /// on the calling thread in the meantime.
    pub(crate) fn wait(&self, shared: &Shared) {
        while self.num_to_acquire.load(Ordering::Acquire) > 0 {
            loop {
                self.retire_finished(shared);
                if !self.execute_first_ready(shared) {
                    break;
                }
            }

            // Consume every release that already happened in one go, or block for one.
            let count = self.semaphore.value().max(1);
            self.semaphore.acquire(count.unsigned_abs());
            self.num_to_acquire.fetch_sub(count, Ordering::AcqRel);
        }

        let write = self.write_index.load(Ordering::Acquire);
        let mut read = self.read_index.load(Ordering::Relaxed);
        while read < write {
            let index = self.slot(read).swap(NONE, Ordering::AcqRel);
            debug_assert!(index != NONE && shared.job(index).is_done());
            if index != NONE {
                shared.release_job(index);
            }
            read += 1;
        }
        self.read_index.store(read, Ordering::Release);
    }
}

/// Owning handle to a barrier claimed with
/// [`JobSystem::create_barrier`](crate::JobSystem::create_barrier).
///
/// Give it back with [`JobSystem::destroy_barrier`](crate::JobSystem::destroy_barrier)
/// once it is empty.
pub struct BarrierHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl BarrierHandle {
    pub(crate) fn barrier(&self) -> &Barrier {
        let barrier = self.shared.barrier(self.index);
        debug_assert_eq!(barrier.generation(), self.generation, "stale barrier handle");
        barrier
    }

    /// Adds a job to this barrier.
    ///
    /// # Panics
    ///
    /// Panics if the job belongs to another job system or another barrier,
    /// or if the barrier is full.
    pub fn add_job(&self, job: &JobHandle) {
        self.add_jobs(core::slice::from_ref(job));
    }

    /// Adds several jobs, waking the waiter at most once for all of them.
    ///
    /// # Panics
    ///
    /// Same conditions as [`add_job`](Self::add_job).
    pub fn add_jobs(&self, jobs: &[JobHandle]) {
        for job in jobs {
            assert!(
                Arc::ptr_eq(&job.shared, &self.shared),
                "job and barrier belong to different job systems"
            );
        }
        self.barrier()
            .add_jobs(&self.shared, self.index, jobs.iter().map(JobHandle::index));
    }

    /// `true` when no job is tracked; only then can the barrier be destroyed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.barrier().is_empty()
    }

    /// Number of jobs tracked and not yet retired by a wait.
    #[must_use]
    pub fn len(&self) -> usize {
        self.barrier().len()
    }

    /// Slot of this barrier in the job system's barrier array.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for BarrierHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("len", &self.len())
            .finish()
    }
}
