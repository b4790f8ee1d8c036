//! Fixed-capacity object pools.

pub mod free_list;

pub use free_list::FreeList;
