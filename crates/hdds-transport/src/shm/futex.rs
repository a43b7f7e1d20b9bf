// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process synchronization.
//!
//! # CRITICAL: SHARED vs PRIVATE
//!
//! The mutex and condition variable words live in `MAP_SHARED` segments, so
//! this module uses `FUTEX_WAIT` (0) and `FUTEX_WAKE` (1). The `_PRIVATE`
//! variants only wake threads of the calling process.

use std::io;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;

/// Outcome of a [`futex_wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexWait {
    /// Woken by `futex_wake` (or spuriously)
    Woken,
    /// Word did not hold the expected value, no sleep happened
    ValueChanged,
    /// Timeout elapsed
    TimedOut,
    /// Interrupted by a signal
    Interrupted,
}

/// Sleep while `*addr == expected`, for at most `timeout`.
///
/// `addr` must stay valid for the whole wait; for inter-process use it must
/// point into a shared mapping.
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the syscall and
    // ts_ptr is either null or points to a timespec on this stack frame.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        )
    };

    if ret == 0 {
        return FutexWait::Woken;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => FutexWait::ValueChanged,
        Some(libc::ETIMEDOUT) => FutexWait::TimedOut,
        Some(libc::EINTR) => FutexWait::Interrupted,
        // Any other errno (EFAULT/EINVAL) is treated as a spurious wakeup;
        // callers re-check state and deadlines in a loop.
        _ => FutexWait::Woken,
    }
}

/// Wake up to `count` waiters blocked on `addr`. Returns how many were woken.
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: FUTEX_WAKE only reads the address to find the wait queue.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake a single waiter
#[inline]
pub fn futex_wake_one(addr: &AtomicU32) -> i32 {
    futex_wake(addr, 1)
}

/// Wake all waiters
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}
