// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory transport counters.
//!
//! One instance per transport, shared with its port readers and writer.
//! All counters use `Relaxed` ordering and are eventually consistent.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one shared-memory transport.
#[derive(Debug, Default)]
pub struct ShmMetrics {
    writes: AtomicU64,
    reads: AtomicU64,
    send_timeouts: AtomicU64,
    stale_locks: AtomicU64,
    port_reopens: AtomicU64,
}

impl ShmMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            send_timeouts: AtomicU64::new(0),
            stale_locks: AtomicU64::new(0),
            port_reopens: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_reads(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_send_timeouts(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_stale_locks(&self) {
        self.stale_locks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_port_reopens(&self) {
        self.port_reopens.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.writes.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.send_timeouts.store(0, Ordering::Relaxed);
        self.stale_locks.store(0, Ordering::Relaxed);
        self.port_reopens.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> ShmMetricsSnapshot {
        ShmMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            stale_locks: self.stale_locks.load(Ordering::Relaxed),
            port_reopens: self.port_reopens.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ShmMetrics`] (non-atomic, for reporting).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmMetricsSnapshot {
    /// Messages pushed into destination ports
    pub writes: u64,
    /// Messages popped by input channels
    pub reads: u64,
    /// Sends that gave up on a full port
    pub send_timeouts: u64,
    /// Lock acquisitions that hit a dead owner
    pub stale_locks: u64,
    /// Cached destination ports dropped and reopened
    pub port_reopens: u64,
}

impl fmt::Display for ShmMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SHM[writes={}, reads={}, timeouts={}, stale={}, reopens={}]",
            self.writes, self.reads, self.send_timeouts, self.stale_locks, self.port_reopens
        )
    }
}
