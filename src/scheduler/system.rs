//! The job system: job pool, barriers, work queue and worker threads.

use core::any::Any;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::CachePadded;

use super::barrier::{Barrier, BarrierHandle};
use super::color::Color;
use super::handle::JobHandle;
use super::job::Job;
use super::queue::WorkQueue;
use crate::alloc::free_list::FreeList;
use crate::concurrency::sync::{RawSemaphore, Semaphore};
use crate::config::{default_thread_count, JobSystemConfig};
use crate::error::{BarrierNotEmpty, JobSystemError};

thread_local! {
    /// Address of the `Shared` whose worker runs on this thread, and its head.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    static HELP_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Nesting limit for workers running queued jobs while their own push waits
/// for room in the queue.
const MAX_HELP_DEPTH: u32 = 16;

#[inline]
fn to_permits(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// State shared by the `JobSystem`, its workers and every handle.
pub(crate) struct Shared {
    jobs: FreeList<Job>,
    barriers: Box<[Barrier]>,
    queue: WorkQueue,
    /// Released once per queued job; workers sleep on it.
    semaphore: Semaphore,
    quit: CachePadded<AtomicBool>,
    num_threads: AtomicUsize,
    panicked_jobs: AtomicUsize,
}

impl Shared {
    fn new(config: &JobSystemConfig, max_threads: usize) -> Self {
        Self {
            jobs: FreeList::new(config.max_jobs),
            barriers: (0..config.max_barriers)
                .map(|_| Barrier::new(config.barrier_capacity))
                .collect(),
            queue: WorkQueue::new(config.queue_length, max_threads),
            semaphore: Semaphore::default(),
            quit: CachePadded::new(AtomicBool::new(false)),
            num_threads: AtomicUsize::new(0),
            panicked_jobs: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn job(&self, index: u32) -> &Job {
        self.jobs.get(index)
    }

    #[inline]
    pub(crate) fn barrier(&self, index: u32) -> &Barrier {
        &self.barriers[index as usize]
    }

    /// Drops one reference and recycles the slot after the last one.
    pub(crate) fn release_job(&self, index: u32) {
        let job = self.job(index);
        if job.release_ref() {
            // SAFETY: that was the last reference, nobody else can reach the slot.
            unsafe { job.clear() };
            self.jobs.free(index);
        }
    }

    /// Runs the job if it is ready and nobody else claimed it.
    pub(crate) fn execute_job(&self, index: u32) {
        let job = self.job(index);
        let Some(function) = job.try_start() else {
            return;
        };

        if let Err(_payload) = panic::catch_unwind(AssertUnwindSafe(function)) {
            self.panicked_jobs.fetch_add(1, Ordering::Relaxed);
            log_error!(job = job.name(), reason = panic_message(&*_payload), "job panicked");
        }

        if let Some(barrier) = job.finish() {
            self.barrier(barrier).on_job_finished();
        }
    }

    /// Makes a ready job visible to the workers.
    ///
    /// Without worker threads this does nothing; the job then runs on the
    /// thread waiting for its barrier.
    pub(crate) fn queue_job(&self, index: u32) {
        let threads = self.num_threads.load(Ordering::Acquire);
        if threads == 0 {
            return;
        }
        self.enqueue(index, threads);
        self.semaphore.release(1);
    }

    pub(crate) fn queue_jobs(&self, indices: &[u32]) {
        let threads = self.num_threads.load(Ordering::Acquire);
        if threads == 0 || indices.is_empty() {
            return;
        }
        for &index in indices {
            self.enqueue(index, threads);
        }
        self.semaphore.release(to_permits(indices.len().min(threads)));
    }

    fn enqueue(&self, index: u32, threads: usize) {
        // The queue holds its own reference until a worker is done with the job.
        self.job(index).add_ref();

        self.queue.push(index, || {
            // A worker asleep on the semaphore keeps its head where it was and
            // holds the ring full. Wake everybody on every retry unless permits
            // are already pending, in which case nobody is blocked.
            if self.semaphore.value() <= 0 {
                log_trace!(job = self.job(index).name(), "work queue full");
                self.semaphore.release(to_permits(threads));
            }
            self.help_while_full();
        });
    }

    /// Lets a worker whose own push is blocked consume from its window, since
    /// its head may be the one holding the queue full.
    fn help_while_full(&self) {
        let Some(worker) = self.current_worker() else {
            return;
        };
        HELP_DEPTH.with(|depth| {
            if depth.get() >= MAX_HELP_DEPTH {
                return;
            }
            depth.set(depth.get() + 1);
            if let Some(index) = self.queue.pop(worker) {
                self.execute_job(index);
                self.release_job(index);
            }
            depth.set(depth.get() - 1);
        });
    }

    fn current_worker(&self) -> Option<usize> {
        let me = self as *const Self as usize;
        CURRENT_WORKER
            .with(Cell::get)
            .and_then(|(shared, worker)| (shared == me).then_some(worker))
    }

    fn worker_main(self: Arc<Self>, worker: usize) {
        enter_span!(DEBUG, "worker", index = worker);
        log_debug!("worker started");
        CURRENT_WORKER.with(|current| current.set(Some((Arc::as_ptr(&self) as usize, worker))));

        while !self.quit.load(Ordering::Acquire) {
            self.semaphore.acquire(1);
            while let Some(index) = self.queue.pop(worker) {
                self.execute_job(index);
                self.release_job(index);
            }
        }

        CURRENT_WORKER.with(|current| current.set(None));
        log_debug!("worker stopped");
    }
}

/// A fork-join job system.
///
/// Owns a fixed pool of job records, a fixed set of barriers and a number of
/// worker threads. Jobs with no unsatisfied dependencies are queued right
/// away; the rest are queued by whichever thread removes their last
/// dependency. A thread that waits on a barrier executes that barrier's ready
/// jobs itself, so [`max_concurrency`](Self::max_concurrency) is one more than
/// the number of workers.
///
/// ```
/// use forkjoin::{Color, JobSystem};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let system = JobSystem::init(64, 2, Some(2)).unwrap();
/// let total = Arc::new(AtomicUsize::new(0));
/// let barrier = system.create_barrier().unwrap();
/// for i in 1..=4 {
///     let total = total.clone();
///     let job = system
///         .create_job("add", Color::GREEN, move || { total.fetch_add(i, Ordering::Relaxed); }, 0)
///         .unwrap();
///     barrier.add_job(&job);
/// }
/// system.wait_for_jobs(&barrier);
/// system.destroy_barrier(barrier).unwrap();
/// assert_eq!(total.load(Ordering::Relaxed), 10);
/// ```
pub struct JobSystem {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    config: JobSystemConfig,
}

impl JobSystem {
    /// Preallocates everything `config` asks for and starts the workers.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::InvalidConfig`] for out-of-range values and
    /// [`JobSystemError::ThreadSpawn`] if a worker cannot be started.
    pub fn new(config: JobSystemConfig) -> Result<Self, JobSystemError> {
        config.validate()?;
        enter_span!(
            DEBUG,
            "job_system_init",
            max_jobs = config.max_jobs,
            max_barriers = config.max_barriers
        );

        let max_threads = config.resolved_max_threads();
        let num_threads = config.resolved_num_threads();
        let mut system = Self {
            shared: Arc::new(Shared::new(&config, max_threads)),
            threads: Vec::with_capacity(num_threads),
            config,
        };
        system.start_threads(num_threads)?;
        log_debug!(threads = num_threads, max_threads, "job system ready");
        Ok(system)
    }

    /// Shorthand for [`new`](Self::new) with default queue and barrier sizes.
    /// `num_threads = None` uses one worker per hardware thread minus one.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn init(max_jobs: u32, max_barriers: u32, num_threads: Option<usize>) -> Result<Self, JobSystemError> {
        Self::new(JobSystemConfig::new(max_jobs, max_barriers).with_num_threads(num_threads))
    }

    /// Creates a job that runs `function` once its `num_dependencies` have been
    /// removed. A job without dependencies is queued immediately.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::JobPoolExhausted`] when all `max_jobs` slots
    /// are in use.
    pub fn create_job<F>(
        &self,
        name: &'static str,
        color: Color,
        function: F,
        num_dependencies: u32,
    ) -> Result<JobHandle, JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(index) = self.shared.jobs.allocate() else {
            log_warn!(job = name, capacity = self.config.max_jobs, "job pool exhausted");
            return Err(JobSystemError::JobPoolExhausted {
                capacity: self.config.max_jobs,
            });
        };

        // SAFETY: the slot was just allocated, so this thread is its only owner.
        unsafe {
            self.shared
                .job(index)
                .construct(name, color, Box::new(function), num_dependencies);
        }
        let handle = JobHandle::new(Arc::clone(&self.shared), index);

        if num_dependencies == 0 {
            self.shared.queue_job(index);
        }
        Ok(handle)
    }

    fn assert_owned(&self, shared: &Arc<Shared>) {
        assert!(
            Arc::ptr_eq(shared, &self.shared),
            "handle belongs to a different job system"
        );
    }

    /// Queues a ready job. Jobs are queued automatically when created without
    /// dependencies or when their last dependency is removed, so this is only
    /// needed to re-offer a job explicitly.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to a different job system.
    pub fn queue_job(&self, job: &JobHandle) {
        self.assert_owned(&job.shared);
        self.shared.queue_job(job.index());
    }

    /// Queues several ready jobs, waking at most one worker per job.
    ///
    /// # Panics
    ///
    /// Panics if a handle belongs to a different job system.
    pub fn queue_jobs(&self, jobs: &[JobHandle]) {
        let indices: Vec<u32> = jobs
            .iter()
            .map(|job| {
                self.assert_owned(&job.shared);
                job.index()
            })
            .collect();
        self.shared.queue_jobs(&indices);
    }

    /// Claims a free barrier.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::BarrierPoolExhausted`] when all barriers are
    /// in use.
    pub fn create_barrier(&self) -> Result<BarrierHandle, JobSystemError> {
        for (index, barrier) in (0u32..).zip(self.shared.barriers.iter()) {
            if let Some(generation) = barrier.try_claim() {
                return Ok(BarrierHandle {
                    shared: Arc::clone(&self.shared),
                    index,
                    generation,
                });
            }
        }
        log_warn!(capacity = self.config.max_barriers, "barrier pool exhausted");
        Err(JobSystemError::BarrierPoolExhausted {
            capacity: self.config.max_barriers,
        })
    }

    /// Returns an empty barrier to the pool.
    ///
    /// # Errors
    ///
    /// Gives the handle back in [`BarrierNotEmpty`] while the barrier still
    /// tracks jobs; wait for them first.
    ///
    /// # Panics
    ///
    /// Panics if the barrier belongs to a different job system.
    pub fn destroy_barrier(&self, barrier: BarrierHandle) -> Result<(), BarrierNotEmpty> {
        self.assert_owned(&barrier.shared);
        if !barrier.is_empty() {
            return Err(BarrierNotEmpty(barrier));
        }
        barrier.barrier().release_claim();
        Ok(())
    }

    /// Blocks until every job added to `barrier` has finished, executing ready
    /// jobs of that barrier on the calling thread in the meantime.
    ///
    /// Only one thread may wait on a given barrier at a time.
    ///
    /// # Panics
    ///
    /// Panics if the barrier belongs to a different job system.
    pub fn wait_for_jobs(&self, barrier: &BarrierHandle) {
        self.assert_owned(&barrier.shared);
        enter_span!(TRACE, "wait_for_jobs", barrier = barrier.index());
        barrier.barrier().wait(&self.shared);
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Threads that can execute jobs at once: the workers plus the waiting thread.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.threads.len() + 1
    }

    /// Stops the workers and starts `num_threads` new ones (`None` =
    /// autodetect). Jobs still in the queue run on the calling thread first.
    ///
    /// Must not be called while jobs are being created or executed.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::TooManyThreads`] above the configured
    /// `max_threads` (the current workers keep running), or
    /// [`JobSystemError::ThreadSpawn`].
    pub fn set_num_threads(&mut self, num_threads: Option<usize>) -> Result<(), JobSystemError> {
        let requested = num_threads.unwrap_or_else(default_thread_count);
        let max = self.shared.queue.max_workers();
        if requested > max {
            return Err(JobSystemError::TooManyThreads { requested, max });
        }
        self.stop_threads();
        self.start_threads(requested)
    }

    /// Configuration the system was built with.
    #[must_use]
    pub fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    /// Free job slots.
    #[must_use]
    pub fn available_jobs(&self) -> usize {
        self.shared.jobs.available()
    }

    /// Jobs whose function panicked since the system was created.
    #[must_use]
    pub fn panicked_jobs(&self) -> usize {
        self.shared.panicked_jobs.load(Ordering::Relaxed)
    }

    fn start_threads(&mut self, count: usize) -> Result<(), JobSystemError> {
        let max = self.shared.queue.max_workers();
        if count > max {
            return Err(JobSystemError::TooManyThreads { requested: count, max });
        }
        if count == 0 {
            return Ok(());
        }

        self.shared.quit.store(false, Ordering::Release);
        self.shared.queue.reset(count);
        self.shared.num_threads.store(count, Ordering::Release);

        for worker in 0..count {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("Worker {}", worker + 1))
                .spawn(move || shared.worker_main(worker));
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    log_error!(worker, error = %err, "failed to spawn worker thread");
                    self.stop_threads();
                    return Err(JobSystemError::ThreadSpawn(err));
                }
            }
        }
        log_debug!(threads = count, "worker threads started");
        Ok(())
    }

    fn stop_threads(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        self.shared.quit.store(true, Ordering::Release);
        self.shared.semaphore.release(to_permits(self.threads.len()));
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log_error!("worker thread panicked outside a job");
            }
        }
        self.shared.num_threads.store(0, Ordering::Release);

        // Whatever is still queued runs here.
        let shared = &self.shared;
        shared.queue.drain(|index| {
            shared.execute_job(index);
            shared.release_job(index);
        });
        shared.queue.reset(0);
        log_debug!("worker threads stopped");
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.stop_threads();
        #[cfg(feature = "tracing")]
        {
            let leaked = self.shared.barriers.iter().filter(|barrier| barrier.is_in_use()).count();
            if leaked > 0 {
                log_warn!(leaked, "job system dropped with barriers still in use");
            }
        }
    }
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("num_threads", &self.threads.len())
            .field("available_jobs", &self.available_jobs())
            .field("queue", &self.shared.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
