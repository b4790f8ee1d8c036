//! Error types returned by the job system.

use core::fmt;

use crate::scheduler::BarrierHandle;

/// Errors reported by the job system.
#[derive(Debug)]
#[non_exhaustive]
pub enum JobSystemError {
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
    /// Every job slot is in use.
    JobPoolExhausted {
        /// Configured `max_jobs`.
        capacity: u32,
    },
    /// Every barrier is in use.
    BarrierPoolExhausted {
        /// Configured `max_barriers`.
        capacity: u32,
    },
    /// More worker threads were requested than the queue has heads for.
    TooManyThreads {
        /// Threads asked for.
        requested: usize,
        /// Configured `max_threads`.
        max: usize,
    },
    /// The OS refused to start a worker thread.
    ThreadSpawn(std::io::Error),
    /// A configuration document could not be parsed or written.
    ConfigParse(serde_json::Error),
}

impl fmt::Display for JobSystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid job system configuration: {reason}"),
            Self::JobPoolExhausted { capacity } => {
                write!(f, "job pool exhausted: all {capacity} jobs are in use")
            }
            Self::BarrierPoolExhausted { capacity } => {
                write!(f, "barrier pool exhausted: all {capacity} barriers are in use")
            }
            Self::TooManyThreads { requested, max } => {
                write!(f, "requested {requested} worker threads but at most {max} are supported")
            }
            Self::ThreadSpawn(_) => f.write_str("failed to spawn worker thread"),
            Self::ConfigParse(_) => f.write_str("failed to parse job system configuration"),
        }
    }
}

impl std::error::Error for JobSystemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ThreadSpawn(err) => Some(err),
            Self::ConfigParse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for JobSystemError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigParse(err)
    }
}

/// Returned by [`JobSystem::destroy_barrier`](crate::JobSystem::destroy_barrier)
/// when the barrier still tracks jobs. Carries the handle back to the caller.
pub struct BarrierNotEmpty(pub BarrierHandle);

impl BarrierNotEmpty {
    /// Recovers the barrier handle.
    #[must_use]
    pub fn into_inner(self) -> BarrierHandle {
        self.0
    }
}

impl fmt::Debug for BarrierNotEmpty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BarrierNotEmpty").field(&self.0).finish()
    }
}

impl fmt::Display for BarrierNotEmpty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "barrier {} still tracks {} jobs; wait for them before destroying it",
            self.0.index(),
            self.0.len()
        )
    }
}

impl std::error::Error for BarrierNotEmpty {}
