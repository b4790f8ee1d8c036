//! # `forkjoin` - fork-join job system
//!
//! A job scheduler for CPU-bound pipelines such as physics simulation steps:
//! many short jobs run on a fixed pool of worker threads while the submitting
//! thread waits on a *barrier* for a group of them, executing that group's
//! ready jobs itself instead of sleeping.
//!
//! ## Building blocks
//!
//! - **Semaphore** ([`concurrency::sync::semaphore`]): a counting semaphore
//!   that only talks to the OS when a thread actually blocks. The futex /
//!   `WaitOnAddress` backend is used where available, a mutex + condvar one
//!   elsewhere or with the `portable-semaphore` feature.
//! - **Job pool** ([`alloc::free_list`]): a fixed-size lock-free free list
//!   over a preallocated array. Its head is tagged to defeat ABA.
//! - **Jobs** ([`JobHandle`]): a function, a dependency counter that doubles
//!   as the execution state, a barrier link and a reference count. A job runs
//!   exactly once, and only after its dependency count reached zero.
//! - **Work queue**: a power-of-two ring of job indices with one shared tail and
//!   one head per worker. Every worker scans the same window and claims jobs
//!   by swapping their slot to empty, so idle workers pick up whatever any
//!   thread queued.
//! - **Barriers** ([`BarrierHandle`]): a ring of the jobs in one fork-join
//!   group plus a semaphore that finishing jobs release.
//!
//! ## Guarantees
//!
//! - A job never starts before all of its dependencies have been removed.
//! - A job's function runs at most once; a panic inside it is caught, logged,
//!   and the job still counts as done.
//! - [`JobSystem::wait_for_jobs`] returns only after every job added to the
//!   barrier has executed and reported completion.
//! - No ordering between independently ready jobs.
//!
//! ## Example
//!
//! ```rust
//! use forkjoin::{Color, JobSystem, JobSystemConfig};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let system = JobSystem::new(JobSystemConfig::new(128, 4).with_num_threads(Some(3))).unwrap();
//! let value = Arc::new(AtomicU32::new(1));
//!
//! // `double` may only run after `increment` finished.
//! let double = {
//!     let value = value.clone();
//!     system
//!         .create_job("double", Color::BLUE, move || {
//!             value.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v * 2)).unwrap();
//!         }, 1)
//!         .unwrap()
//! };
//! let increment = {
//!     let value = value.clone();
//!     let double = double.clone();
//!     system
//!         .create_job("increment", Color::GREEN, move || {
//!             value.fetch_add(1, Ordering::AcqRel);
//!             double.remove_dependency();
//!         }, 0)
//!         .unwrap()
//! };
//!
//! let barrier = system.create_barrier().unwrap();
//! barrier.add_jobs(&[increment, double]);
//! system.wait_for_jobs(&barrier);
//! system.destroy_barrier(barrier).unwrap();
//!
//! assert_eq!(value.load(Ordering::Acquire), 4);
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
mod log;

pub mod alloc;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod scheduler;

pub use alloc::FreeList;
pub use concurrency::sync::{CondvarSemaphore, RawSemaphore, Semaphore};
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
pub use concurrency::sync::FutexSemaphore;
pub use config::JobSystemConfig;
pub use error::{BarrierNotEmpty, JobSystemError};
pub use scheduler::{BarrierHandle, Color, JobHandle, JobSystem};

// Compile-time checks on the public types.
const _: () = {
    use core::mem;

    // Handles are an `Arc` plus index and generation.
    assert!(mem::size_of::<JobHandle>() == mem::size_of::<usize>() + 8);
    assert!(mem::size_of::<BarrierHandle>() == mem::size_of::<usize>() + 8);

    // Colors pack into one word of job state.
    assert!(mem::size_of::<Color>() == mem::size_of::<u32>());

    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<JobSystem>();
    assert_send_sync::<JobHandle>();
    assert_send_sync::<BarrierHandle>();
    assert_send_sync::<Semaphore>();
};
