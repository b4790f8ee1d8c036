//! Blocking primitives used by the scheduler.
//!
//! The free functions park a thread on a 32-bit word until another thread
//! changes it and wakes the address. They map onto `futex(2)` on Linux and
//! `WaitOnAddress` on Windows; other platforms (and loom builds) only get the
//! condition-variable semaphore.

pub mod semaphore;

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
pub use semaphore::FutexSemaphore;
pub use semaphore::{CondvarSemaphore, RawSemaphore, Semaphore};

#[cfg(all(not(loom), any(target_os = "linux", windows)))]
use core::sync::atomic::AtomicU32;

#[cfg(all(not(loom), target_os = "linux"))]
use core::sync::atomic::Ordering;

#[cfg(all(not(loom), windows))]
use windows_sys::Win32::System::Threading::{WaitOnAddress, WakeByAddressAll, WakeByAddressSingle};

#[cfg(all(not(loom), target_os = "linux"))]
use libc::{SYS_futex, FUTEX_PRIVATE_FLAG, FUTEX_WAIT, FUTEX_WAKE};

#[cfg(all(not(loom), target_os = "linux"))]
#[inline]
fn futex_wait(addr: &AtomicU32, expected: u32) {
    // SAFETY: `addr` points at a live, aligned u32 for the duration of the call.
    // Spurious returns (EINTR, EAGAIN) are handled by the callers' retry loops.
    unsafe {
        libc::syscall(
            SYS_futex,
            addr.as_ptr(),
            FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(all(not(loom), target_os = "linux"))]
#[inline]
fn futex_wake(addr: &AtomicU32, count: i32) {
    // SAFETY: waking never dereferences the address beyond hashing it.
    unsafe {
        libc::syscall(SYS_futex, addr.as_ptr(), FUTEX_WAKE | FUTEX_PRIVATE_FLAG, count);
    }
}

/// Blocks while `addr` still holds `expected`.
///
/// May return spuriously; callers re-check their condition.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
#[inline]
pub fn wait_on_u32(addr: &AtomicU32, expected: u32) {
    #[cfg(windows)]
    // SAFETY: both pointers reference live u32 values of the declared size.
    unsafe {
        let expected_ptr = core::ptr::addr_of!(expected).cast();
        let size = core::mem::size_of::<u32>();
        WaitOnAddress(addr.as_ptr().cast(), expected_ptr, size, u32::MAX);
    }
    #[cfg(target_os = "linux")]
    {
        if addr.load(Ordering::Acquire) == expected {
            futex_wait(addr, expected);
        }
    }
}

/// Wakes one thread blocked in [`wait_on_u32`] on `addr`.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
#[inline]
pub fn wake_one_u32(addr: &AtomicU32) {
    #[cfg(windows)]
    // SAFETY: the address is only used as a key.
    unsafe {
        WakeByAddressSingle(addr.as_ptr().cast());
    }
    #[cfg(target_os = "linux")]
    futex_wake(addr, 1);
}

/// Wakes up to `count` threads blocked on `addr`.
///
/// Windows has no counted wake, so anything above one wakes every waiter and
/// the surplus go back to sleep after re-checking.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
#[inline]
pub fn wake_u32(addr: &AtomicU32, count: u32) {
    match count {
        0 => {}
        1 => wake_one_u32(addr),
        #[cfg(target_os = "linux")]
        n => futex_wake(addr, i32::try_from(n).unwrap_or(i32::MAX)),
        #[cfg(windows)]
        _ => wake_all_u32(addr),
    }
}

/// Wakes every thread blocked on `addr`.
#[cfg(all(not(loom), any(target_os = "linux", windows)))]
#[inline]
pub fn wake_all_u32(addr: &AtomicU32) {
    #[cfg(windows)]
    // SAFETY: the address is only used as a key.
    unsafe {
        WakeByAddressAll(addr.as_ptr().cast());
    }
    #[cfg(target_os = "linux")]
    futex_wake(addr, i32::MAX);
}
