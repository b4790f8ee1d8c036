//! Job system configuration.
//!
//! Everything the system preallocates is sized here: the job pool, the
//! barrier array, the work queue and each barrier's ring. Configurations can
//! be built in code or loaded from JSON.

use serde::{Deserialize, Serialize};

use crate::alloc::free_list::INVALID_INDEX;
use crate::error::JobSystemError;

/// Default number of job slots.
pub const DEFAULT_MAX_JOBS: u32 = 2048;
/// Default number of barriers.
pub const DEFAULT_MAX_BARRIERS: u32 = 8;
/// Default work queue length.
pub const DEFAULT_QUEUE_LENGTH: usize = 1024;
/// Default number of jobs a single barrier can track.
pub const DEFAULT_BARRIER_CAPACITY: usize = 1024;

/// Number of worker threads used when none is configured: one per hardware
/// thread, minus the thread that waits on barriers.
#[must_use]
pub fn default_thread_count() -> usize {
    hardware_threads().saturating_sub(1)
}

fn hardware_threads() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Sizes and thread counts for a [`JobSystem`](crate::JobSystem).
///
/// Missing JSON fields take their default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Job pool capacity: jobs alive at the same time.
    pub max_jobs: u32,
    /// Barriers that can exist at the same time.
    pub max_barriers: u32,
    /// Worker threads; `None` picks [`default_thread_count`].
    pub num_threads: Option<usize>,
    /// Upper bound for `set_num_threads`; `None` means the larger of
    /// `num_threads` and the hardware thread count.
    pub max_threads: Option<usize>,
    /// Work queue length, a power of two.
    pub queue_length: usize,
    /// Jobs one barrier can track before it is waited on, a power of two.
    pub barrier_capacity: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            max_barriers: DEFAULT_MAX_BARRIERS,
            num_threads: None,
            max_threads: None,
            queue_length: DEFAULT_QUEUE_LENGTH,
            barrier_capacity: DEFAULT_BARRIER_CAPACITY,
        }
    }
}

impl JobSystemConfig {
    /// Default configuration with the given pool sizes.
    #[must_use]
    pub fn new(max_jobs: u32, max_barriers: u32) -> Self {
        Self {
            max_jobs,
            max_barriers,
            ..Self::default()
        }
    }

    /// Sets the worker thread count (`None` = autodetect).
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: Option<usize>) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Sets the upper bound for later `set_num_threads` calls.
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Sets the work queue length.
    #[must_use]
    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Sets the per-barrier ring capacity.
    #[must_use]
    pub fn with_barrier_capacity(mut self, barrier_capacity: usize) -> Self {
        self.barrier_capacity = barrier_capacity;
        self
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::ConfigParse`] on malformed JSON and
    /// [`JobSystemError::InvalidConfig`] when a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, JobSystemError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::ConfigParse`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String, JobSystemError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Thread count the system starts with.
    #[must_use]
    pub fn resolved_num_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(default_thread_count)
    }

    /// Largest thread count the system can ever run.
    #[must_use]
    pub fn resolved_max_threads(&self) -> usize {
        self.max_threads
            .unwrap_or_else(|| self.resolved_num_threads().max(hardware_threads()))
    }

    /// Checks every value against the limits of the data structures.
    ///
    /// # Errors
    ///
    /// Returns [`JobSystemError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), JobSystemError> {
        if self.max_jobs == 0 || self.max_jobs >= INVALID_INDEX {
            return Err(JobSystemError::InvalidConfig("max_jobs must be in 1..u32::MAX"));
        }
        if self.max_barriers == 0 || self.max_barriers >= u32::MAX - 1 {
            return Err(JobSystemError::InvalidConfig("max_barriers must be in 1..u32::MAX - 1"));
        }
        if !self.queue_length.is_power_of_two() {
            return Err(JobSystemError::InvalidConfig("queue_length must be a power of two"));
        }
        if !self.barrier_capacity.is_power_of_two() {
            return Err(JobSystemError::InvalidConfig("barrier_capacity must be a power of two"));
        }
        if self.resolved_num_threads() > self.resolved_max_threads() {
            return Err(JobSystemError::InvalidConfig("num_threads exceeds max_threads"));
        }
        Ok(())
    }
}
