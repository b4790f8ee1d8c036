use core::fmt;
use std::sync::Arc;

use super::color::Color;
use super::job::Job;
use super::system::Shared;

/// Reference-counted handle to a job.
///
/// The job's slot stays allocated while any handle, the work queue or a
/// barrier refers to it. Cloning a handle adds a reference, dropping it
/// removes one, and the last reference returns the slot to the pool.
///
/// Handles keep their job system's shared state alive, so a job whose
/// function captures a handle to itself (or a cycle of jobs that never
/// run) is never freed.
pub struct JobHandle {
    pub(crate) shared: Arc<Shared>,
    index: u32,
    generation: u32,
}

impl JobHandle {
    /// Wraps a freshly constructed job, taking one reference.
    pub(crate) fn new(shared: Arc<Shared>, index: u32) -> Self {
        let job = shared.job(index);
        job.add_ref();
        let generation = job.generation();
        Self {
            shared,
            index,
            generation,
        }
    }

    #[inline]
    fn job(&self) -> &Job {
        let job = self.shared.job(self.index);
        debug_assert_eq!(job.generation(), self.generation, "stale job handle");
        job
    }

    /// Slot index of the job in the job pool.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Name given at creation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.job().name()
    }

    /// Color given at creation.
    #[must_use]
    pub fn color(&self) -> Color {
        self.job().color()
    }

    /// `true` once the job's function has returned (or panicked).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.job().is_done()
    }

    /// `true` while every dependency is satisfied and the job has not started.
    #[must_use]
    pub fn can_be_executed(&self) -> bool {
        self.job().can_be_executed()
    }

    /// Adds `count` dependencies.
    ///
    /// Only legal while the job still has at least one unsatisfied
    /// dependency; a job that reached zero may already be running.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the job is queued, running or done.
    pub fn add_dependency(&self, count: u32) {
        self.job().add_dependency(count);
    }

    /// Removes one dependency, queuing the job if it became ready.
    pub fn remove_dependency(&self) {
        self.remove_dependencies(1);
    }

    /// Removes `count` dependencies, queuing the job if it became ready.
    pub fn remove_dependencies(&self, count: u32) {
        if self.job().remove_dependency(count) {
            self.shared.queue_job(self.index);
        }
    }

    /// Removes `count` dependencies from each job and queues all jobs that
    /// became ready with a single wake-up of the workers.
    ///
    /// # Panics
    ///
    /// Panics if the handles belong to different job systems.
    pub fn remove_dependency_batch(handles: &[JobHandle], count: u32) {
        let Some(first) = handles.first() else {
            return;
        };
        let ready: Vec<u32> = handles
            .iter()
            .filter(|handle| {
                assert!(
                    Arc::ptr_eq(&handle.shared, &first.shared),
                    "handles belong to different job systems"
                );
                handle.job().remove_dependency(count)
            })
            .map(JobHandle::index)
            .collect();
        if !ready.is_empty() {
            first.shared.queue_jobs(&ready);
        }
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        self.job().add_ref();
        Self {
            shared: Arc::clone(&self.shared),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.shared.release_job(self.index);
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.index == other.index
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("job", self.job())
            .finish()
    }
}
