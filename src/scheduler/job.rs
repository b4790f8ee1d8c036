//! The job record stored in the job pool.
//!
//! A job's dependency counter doubles as its state word: any value below
//! [`EXECUTING`] is the number of unsatisfied dependencies, and the two
//! sentinels mark a job that is running or finished. Because the pool is
//! recycled, every field is either atomic or written only while the slot is
//! exclusively owned (freshly allocated, or being freed by its last owner).

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use super::color::Color;

/// Boxed job body.
pub(crate) type JobFunction = Box<dyn FnOnce() + Send + 'static>;

/// Dependency counter value while the function runs.
pub(crate) const EXECUTING: u32 = 0xe0e0_e0e0;
/// Dependency counter value once the function has returned.
pub(crate) const DONE: u32 = 0xd0d0_d0d0;

/// Barrier link: not tracked by any barrier.
const NO_BARRIER: u32 = 0;
/// Barrier link: the job finished; later barriers skip it.
const BARRIER_DONE: u32 = u32::MAX;

pub(crate) struct Job {
    function: UnsafeCell<Option<JobFunction>>,
    name: UnsafeCell<&'static str>,
    color: AtomicU32,
    num_dependencies: AtomicU32,
    reference_count: AtomicU32,
    /// `NO_BARRIER`, `BARRIER_DONE`, or barrier index + 1.
    barrier: AtomicU32,
    generation: AtomicU32,
}

// SAFETY: `function` and `name` are written only by the exclusive owner of a
// freshly allocated or dying slot, and `function` is taken exactly once by the
// thread that wins the `0 -> EXECUTING` transition. All other state is atomic.
unsafe impl Sync for Job {}

impl Default for Job {
    fn default() -> Self {
        Self {
            function: UnsafeCell::new(None),
            name: UnsafeCell::new(""),
            color: AtomicU32::new(0),
            num_dependencies: AtomicU32::new(DONE),
            reference_count: AtomicU32::new(0),
            barrier: AtomicU32::new(NO_BARRIER),
            generation: AtomicU32::new(0),
        }
    }
}

impl Job {
    /// Fills a slot that was just allocated from the pool.
    ///
    /// # Safety
    ///
    /// The caller must own the slot exclusively: no handle, queue entry or
    /// barrier may refer to it yet.
    pub(crate) unsafe fn construct(
        &self,
        name: &'static str,
        color: Color,
        function: JobFunction,
        num_dependencies: u32,
    ) {
        debug_assert!(num_dependencies < DONE.min(EXECUTING), "dependency count out of range");
        debug_assert_eq!(self.reference_count.load(Ordering::Relaxed), 0);
        *self.function.get() = Some(function);
        *self.name.get() = name;
        self.color.store(color.to_u32(), Ordering::Relaxed);
        self.barrier.store(NO_BARRIER, Ordering::Relaxed);
        self.num_dependencies.store(num_dependencies, Ordering::Release);
    }

    /// Drops whatever the slot still owns and invalidates old handles.
    ///
    /// # Safety
    ///
    /// Only the thread that dropped the last reference may call this, before
    /// returning the slot to the pool.
    pub(crate) unsafe fn clear(&self) {
        drop((*self.function.get()).take());
        self.generation.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn name(&self) -> &'static str {
        // SAFETY: only written while the slot has no other owner.
        unsafe { *self.name.get() }
    }

    #[inline]
    pub(crate) fn color(&self) -> Color {
        Color::from_u32(self.color.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_ref(&self) {
        self.reference_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference. Returns `true` when it was the last one.
    #[inline]
    pub(crate) fn release_ref(&self) -> bool {
        let old = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "job released more often than referenced");
        old == 1
    }

    /// # Panics
    ///
    /// Panics (debug builds) if the job is already queued, running or done.
    pub(crate) fn add_dependency(&self, count: u32) {
        let old = self.num_dependencies.fetch_add(count, Ordering::Relaxed);
        debug_assert!(
            old > 0 && old != EXECUTING && old != DONE,
            "cannot add a dependency to a job that is queued, running or done"
        );
    }

    /// Returns `true` when this call brought the count to zero, in which case
    /// the caller must queue the job.
    pub(crate) fn remove_dependency(&self, count: u32) -> bool {
        let old = self.num_dependencies.fetch_sub(count, Ordering::Release);
        debug_assert!(
            old != EXECUTING && old != DONE,
            "cannot remove a dependency from a job that is running or done"
        );
        debug_assert!(old >= count, "more dependencies removed than were added");
        old == count
    }

    #[inline]
    pub(crate) fn can_be_executed(&self) -> bool {
        self.num_dependencies.load(Ordering::Relaxed) == 0
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.num_dependencies.load(Ordering::Acquire) == DONE
    }

    /// Links the job to `barrier_index`.
    ///
    /// Returns `false` when the job has already finished, so the barrier
    /// should not track it.
    ///
    /// # Panics
    ///
    /// Panics if the job already belongs to another barrier.
    pub(crate) fn set_barrier(&self, barrier_index: u32) -> bool {
        match self.barrier.compare_exchange(
            NO_BARRIER,
            barrier_index + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(BARRIER_DONE) => false,
            Err(_) => panic!("a job can only be added to one barrier"),
        }
    }

    /// Claims the right to run the job.
    ///
    /// Succeeds for exactly one caller once the dependency count is zero.
    pub(crate) fn try_start(&self) -> Option<JobFunction> {
        self.num_dependencies
            .compare_exchange(0, EXECUTING, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        // SAFETY: the successful transition above makes us the only reader.
        let function = unsafe { (*self.function.get()).take() };
        debug_assert!(function.is_some(), "executable job without a function");
        function
    }

    /// Marks the job done and returns the barrier to notify, if any.
    pub(crate) fn finish(&self) -> Option<u32> {
        debug_assert_eq!(self.num_dependencies.load(Ordering::Relaxed), EXECUTING);
        self.num_dependencies.store(DONE, Ordering::Release);
        match self.barrier.swap(BARRIER_DONE, Ordering::AcqRel) {
            NO_BARRIER | BARRIER_DONE => None,
            link => Some(link - 1),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dependencies = self.num_dependencies.load(Ordering::Relaxed);
        let state: &dyn fmt::Debug = match dependencies {
            EXECUTING => &"executing",
            DONE => &"done",
            _ => &dependencies,
        };
        f.debug_struct("Job")
            .field("name", &self.name())
            .field("dependencies", state)
            .field("references", &self.reference_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
