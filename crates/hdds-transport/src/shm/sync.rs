// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process mutex and condition variable.
//!
//! Both types are plain `#[repr(C)]` words placed inside a shared segment.
//! An all-zero bit pattern is a valid unlocked mutex / fresh condvar, so a
//! freshly truncated segment needs no initialization pass.
//!
//! # Mutex states
//!
//! ```text
//! 0 = unlocked
//! 1 = locked, no waiters
//! 2 = locked, waiters may be sleeping on the futex
//! ```
//!
//! Acquisition is always bounded. When the deadline passes the owner pid is
//! checked: a dead owner yields [`ShmError::StaleLock`], a live one
//! [`ShmError::Timeout`]. The lock is never broken automatically.

use super::futex::{futex_wait, futex_wake_all, futex_wake_one, FutexWait};
use super::{deadline_after, is_process_alive, this_process_pid, Result, ShmError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Futex-based mutex usable across processes.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    state: AtomicU32,
    /// pid of the current holder (0 = none or not yet published)
    owner: AtomicU32,
}

impl ShmMutex {
    /// Unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU32::new(0),
        }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.acquired(Duration::ZERO))
    }

    /// Acquire, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `StaleLock` if the deadline passed and the holder process is gone
    /// - `Timeout` if the deadline passed and the holder is alive
    pub fn lock_timeout(&self, timeout: Duration) -> Result<ShmMutexGuard<'_>> {
        self.lock_before(deadline_after(timeout), timeout)
    }

    fn lock_before(
        &self,
        deadline: Instant,
        relock_timeout: Duration,
    ) -> Result<ShmMutexGuard<'_>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(self.acquired(relock_timeout));
        }

        loop {
            // Swapping in CONTENDED either takes the lock or announces a waiter
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(self.acquired(relock_timeout));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.expired());
            }
            futex_wait(&self.state, CONTENDED, Some(deadline - now));
        }
    }

    /// True while some thread or process holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// pid of the current holder, if published.
    #[must_use]
    pub fn owner_pid(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn acquired(&self, relock_timeout: Duration) -> ShmMutexGuard<'_> {
        self.owner.store(this_process_pid(), Ordering::Relaxed);
        ShmMutexGuard {
            mutex: self,
            relock_timeout,
        }
    }

    fn expired(&self) -> ShmError {
        match self.owner_pid() {
            Some(pid) if !is_process_alive(pid) => {
                log::warn!("[SHM] lock held by dead process {}", pid);
                ShmError::StaleLock { pid }
            }
            _ => ShmError::Timeout,
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake_one(&self.state);
        }
    }
}

/// RAII guard; releases the [`ShmMutex`] on drop.
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    /// Bound reused when a condvar wait reacquires the lock
    relock_timeout: Duration,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Sequence-counter condition variable paired with a [`ShmMutex`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmCondvar {
    seq: AtomicU32,
}

impl ShmCondvar {
    /// Fresh condvar.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    /// Release the guard, sleep until notified or `timeout`, then reacquire.
    ///
    /// Returns the reacquired guard and whether the wait timed out. Spurious
    /// wakeups are possible; callers re-check their predicate.
    ///
    /// # Errors
    ///
    /// See [`Self::wait_until`].
    pub fn wait_timeout<'a>(
        &self,
        guard: ShmMutexGuard<'a>,
        timeout: Duration,
    ) -> Result<(ShmMutexGuard<'a>, bool)> {
        self.wait_until(guard, deadline_after(timeout))
    }

    /// [`Self::wait_timeout`] with an absolute deadline.
    ///
    /// # Errors
    ///
    /// Reacquisition ends at `deadline` at the latest (sooner if the guard
    /// was taken with a shorter lock timeout) and fails like
    /// [`ShmMutex::lock_timeout`]. Past the deadline one attempt is made.
    pub fn wait_until<'a>(
        &self,
        guard: ShmMutexGuard<'a>,
        deadline: Instant,
    ) -> Result<(ShmMutexGuard<'a>, bool)> {
        let mutex = guard.mutex;
        let relock_timeout = guard.relock_timeout;
        let seq = self.seq.load(Ordering::Acquire);
        drop(guard);

        let remaining = deadline.saturating_duration_since(Instant::now());
        let timed_out = remaining.is_zero()
            || futex_wait(&self.seq, seq, Some(remaining)) == FutexWait::TimedOut;

        let relock_deadline = deadline.min(deadline_after(relock_timeout));
        let guard = mutex.lock_before(relock_deadline, relock_timeout)?;
        Ok((guard, timed_out))
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_one(&self.seq);
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let m = ShmMutex::new();
        {
            let _g = m.lock_timeout(Duration::from_millis(10)).expect("lock");
            assert!(m.is_locked());
            assert_eq!(m.owner_pid(), Some(this_process_pid()));
        }
        assert!(!m.is_locked());
        assert_eq!(m.owner_pid(), None);
    }

    #[test]
    fn test_try_lock_fails_when_held() {
        let m = ShmMutex::new();
        let _g = m.try_lock().expect("first try_lock");
        assert!(m.try_lock().is_none());
    }

    #[test]
    fn test_timeout_with_live_owner() {
        let m = Arc::new(ShmMutex::new());
        let _g = m.lock_timeout(Duration::from_millis(10)).expect("lock");

        let m2 = Arc::clone(&m);
        let result = thread::spawn(move || m2.lock_timeout(Duration::from_millis(30)).map(|_| ()))
            .join()
            .expect("thread panicked");
        assert!(matches!(result, Err(ShmError::Timeout)));
    }

    #[test]
    fn test_stale_lock_detected() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let dead_pid = child.id();
        child.wait().expect("wait child");

        let m = ShmMutex::new();
        m.state.store(LOCKED, Ordering::Relaxed);
        m.owner.store(dead_pid, Ordering::Relaxed);

        let result = m.lock_timeout(Duration::from_millis(20)).map(|_| ());
        assert!(matches!(result, Err(ShmError::StaleLock { pid }) if pid == dead_pid));
        // Still held: no automatic lock breaking
        assert!(m.is_locked());
    }

    #[test]
    fn test_contended_handoff() {
        let m = Arc::new(ShmMutex::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _g = m.lock_timeout(Duration::from_secs(5)).expect("lock");
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn test_condvar_wait_and_notify() {
        let shared = Arc::new((ShmMutex::new(), ShmCondvar::new(), AtomicBool::new(false)));
        let shared2 = Arc::clone(&shared);

        let waiter = thread::spawn(move || {
            let (m, cv, ready) = &*shared2;
            let mut guard = m.lock_timeout(Duration::from_secs(1)).expect("lock");
            while !ready.load(Ordering::Acquire) {
                let (g, _timed_out) = cv
                    .wait_timeout(guard, Duration::from_secs(2))
                    .expect("wait");
                guard = g;
            }
            true
        });

        thread::sleep(Duration::from_millis(20));
        {
            let (m, cv, ready) = &*shared;
            let _g = m.lock_timeout(Duration::from_secs(1)).expect("lock");
            ready.store(true, Ordering::Release);
            cv.notify_all();
        }
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn test_condvar_relock_ends_at_deadline() {
        let shared = Arc::new((ShmMutex::new(), ShmCondvar::new()));
        let (m, cv) = &*shared;
        let guard = m.lock_timeout(Duration::from_secs(5)).expect("lock");

        // Takes the lock as soon as the waiter releases it, then sits on it
        let holder = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (m, _) = &*shared;
                let _g = m.lock_timeout(Duration::from_secs(5)).expect("holder lock");
                thread::sleep(Duration::from_millis(400));
            })
        };
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        let result = cv
            .wait_until(guard, Instant::now() + Duration::from_millis(30))
            .map(|_| ());
        assert!(matches!(result, Err(ShmError::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(300));
        holder.join().expect("holder panicked");
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let m = ShmMutex::new();
        let cv = ShmCondvar::new();
        let guard = m.lock_timeout(Duration::MAX).expect("lock");
        cv.notify_all();
        drop(guard);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_condvar_timeout() {
        let m = ShmMutex::new();
        let cv = ShmCondvar::new();
        let guard = m.lock_timeout(Duration::from_millis(100)).expect("lock");
        let (_guard, timed_out) = cv
            .wait_timeout(guard, Duration::from_millis(20))
            .expect("wait");
        assert!(timed_out);
        assert!(m.is_locked());
    }
}
