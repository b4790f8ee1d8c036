//! Counting semaphores.
//!
//! Both implementations keep the invariant `value() == releases - acquires`
//! and only involve the operating system when a thread actually has to
//! block. [`Semaphore`] names the backend picked for the current build.

use core::fmt;

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
use std::sync::OnceLock;

#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicI32, Ordering},
    Condvar, Mutex,
};
#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Condvar, Mutex,
};

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
use core::sync::atomic::AtomicU32;

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
use crossbeam_utils::CachePadded;

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
use super::{wait_on_u32, wake_u32};

/// Operations every semaphore backend provides.
///
/// `count` must be non-zero for both `acquire` and `release`.
pub trait RawSemaphore: Default + Send + Sync {
    /// Adds `count` permits, waking blocked acquirers as needed.
    fn release(&self, count: u32);

    /// Takes `count` permits, blocking until they are available.
    fn acquire(&self, count: u32);

    /// Current count. Negative while acquirers are waiting (futex backend).
    fn value(&self) -> i32;
}

/// Backend chosen for this build.
#[cfg(all(
    not(loom),
    not(feature = "portable-semaphore"),
    any(target_os = "linux", windows)
))]
pub type Semaphore = FutexSemaphore;

/// Backend chosen for this build.
#[cfg(not(all(
    not(loom),
    not(feature = "portable-semaphore"),
    any(target_os = "linux", windows)
)))]
pub type Semaphore = CondvarSemaphore;

#[inline]
fn permits(count: u32) -> i32 {
    debug_assert!(count > 0, "semaphore count must be non-zero");
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Semaphore with an atomic fast path and an address-wait slow path.
///
/// The signed `count` goes negative while threads are waiting. A release only
/// reaches the wait object when it observes a negative count, and it posts
/// exactly as many OS permits as there are waiters it satisfies. The wait
/// object itself is allocated the first time anybody blocks.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
pub struct FutexSemaphore {
    count: CachePadded<AtomicI32>,
    waiters: OnceLock<Box<WaitObject>>,
}

/// OS-level permits that blocked acquirers sleep on.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
struct WaitObject {
    available: AtomicU32,
}

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
impl WaitObject {
    fn post(&self, count: u32) {
        self.available.fetch_add(count, Ordering::Release);
        wake_u32(&self.available, count);
    }

    fn wait(&self) {
        loop {
            let available = self.available.load(Ordering::Acquire);
            if available == 0 {
                wait_on_u32(&self.available, 0);
                continue;
            }
            if self
                .available
                .compare_exchange_weak(available, available - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
impl FutexSemaphore {
    /// Creates a semaphore with a count of zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicI32::new(0)),
            waiters: OnceLock::new(),
        }
    }

    fn wait_object(&self) -> &WaitObject {
        self.waiters.get_or_init(|| {
            Box::new(WaitObject {
                available: AtomicU32::new(0),
            })
        })
    }
}

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
impl Default for FutexSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
impl RawSemaphore for FutexSemaphore {
    fn release(&self, count: u32) {
        let count = permits(count);
        let old = self.count.fetch_add(count, Ordering::Release);
        if old < 0 {
            let new = old + count;
            let wake = new.min(0) - old;
            self.wait_object().post(wake.unsigned_abs());
        }
    }

    fn acquire(&self, count: u32) {
        let count = permits(count);
        let old = self.count.fetch_sub(count, Ordering::Acquire);
        let new = old - count;
        if new < 0 {
            let wait = old.min(0) - new;
            let waiters = self.wait_object();
            for _ in 0..wait {
                waiters.wait();
            }
        }
    }

    fn value(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
impl fmt::Debug for FutexSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutexSemaphore")
            .field("value", &self.value())
            .field("contended", &self.waiters.get().is_some())
            .finish()
    }
}

/// Semaphore built on a mutex and a condition variable.
///
/// Available on every platform and the only backend loom can model. The count
/// is mirrored in an atomic so that [`RawSemaphore::value`] does not lock; it
/// never goes negative because acquirers wait before subtracting.
pub struct CondvarSemaphore {
    lock: Mutex<()>,
    cond: Condvar,
    count: AtomicI32,
}

impl CondvarSemaphore {
    /// Creates a semaphore with a count of zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            count: AtomicI32::new(0),
        }
    }
}

impl Default for CondvarSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSemaphore for CondvarSemaphore {
    fn release(&self, count: u32) {
        let count = permits(count);
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.count.fetch_add(count, Ordering::Release);
        if count == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    fn acquire(&self, count: u32) {
        let count = permits(count);
        let mut guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while self.count.load(Ordering::Acquire) < count {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.count.fetch_sub(count, Ordering::Relaxed);
    }

    fn value(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CondvarSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondvarSemaphore")
            .field("value", &self.value())
            .finish()
    }
}
