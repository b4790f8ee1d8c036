//! Jobs, barriers and the thread pool that runs them.
//!
//! - [`JobSystem`] owns the job pool, the barriers and the worker threads.
//! - [`JobHandle`] keeps a job alive and exposes dependency counting.
//! - [`BarrierHandle`] groups jobs so a thread can wait for all of them.

mod barrier;
mod color;
mod handle;
mod job;
mod queue;
mod system;

pub use barrier::BarrierHandle;
pub use color::Color;
pub use handle::JobHandle;
pub use system::JobSystem;
