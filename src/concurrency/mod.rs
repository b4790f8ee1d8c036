//! Low-level synchronization used by the scheduler.

pub mod sync;
