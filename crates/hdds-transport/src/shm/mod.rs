// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared Memory (SHM) primitives for intra-host zero-copy communication.
//!
//! # Architecture
//!
//! ```text
//! +------------------+                          +------------------+
//! |   Process A      |        /hdds_port7411    |   Process B      |
//! |   PortWriter  ---+--> [ SegmentHeader     ] |                  |
//! |                  |    [ PortHeader (root) ] +--> PortReader    |
//! |                  |    [ slot 0..capacity  ] |    (InputChannel)|
//! +------------------+    futex mutex/condvar   +------------------+
//! ```
//!
//! - [`SharedSegment`]: named POSIX segment, offset addressing, identity,
//!   cross-process [`ShmMutex`] / [`ShmCondvar`] pair in its header
//! - [`ShmPort`]: bounded message queue living inside one segment
//! - [`SharedMem`]: transport-wide subsystem creating port readers and writers
//!
//! Every cross-process structure refers to other parts of the segment through
//! [`Offset`] values, never through pointers: each process maps the segment at
//! a different base address.

mod futex;
mod manager;
mod metrics;
mod port;
mod segment;
mod sync;

pub use futex::{futex_wait, futex_wake, FutexWait};
pub use manager::{unicast_port_name, PortReader, PortWriter, SharedMem, SharedMemConfig};
pub use metrics::{ShmMetrics, ShmMetricsSnapshot};
pub use port::{port_segment_size, ShmPort};
pub use segment::{Offset, SegmentId, SharedSegment};
pub use sync::{ShmCondvar, ShmMutex, ShmMutexGuard};

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

/// Longest wait any bounded operation schedules (one day).
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors that can occur in SHM operations
#[derive(Debug)]
pub enum ShmError {
    /// A segment with this name already exists
    AlreadyExists(String),

    /// Segment not found
    NotFound(String),

    /// Existing segment has a different size than requested
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Offset or address outside the mapped segment
    OutOfRange { offset: u64, size: usize },

    /// Deadline expired (lock acquisition, full or empty port)
    Timeout,

    /// Cross-process mutex held by a process that no longer exists
    StaleLock { pid: u32 },

    /// OS refused to provide the segment storage or mapping
    ResourceExhausted { name: String, source: io::Error },

    /// Segment open failed for a reason other than absence
    SegmentOpen(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment contents do not match the expected layout
    Corruption(String),

    /// Payload larger than a port slot
    PayloadTooLarge { size: usize, capacity: usize },

    /// Port was closed by its reader
    PortClosed,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists(name) => write!(f, "Segment already exists: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::SizeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "Segment {name} has size {actual} bytes, expected {expected}"
            ),
            Self::OutOfRange { offset, size } => {
                write!(f, "Offset {offset} outside segment of {size} bytes")
            }
            Self::Timeout => write!(f, "Shared memory operation timed out"),
            Self::StaleLock { pid } => {
                write!(f, "Segment lock held by terminated process {pid}")
            }
            Self::ResourceExhausted { name, source } => {
                write!(f, "Cannot allocate shared memory for {name}: {source}")
            }
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::Corruption(what) => write!(f, "Segment corruption detected: {what}"),
            Self::PayloadTooLarge { size, capacity } => write!(
                f,
                "Payload too large: {size} bytes exceeds slot capacity {capacity}"
            ),
            Self::PortClosed => write!(f, "Port closed by its reader"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ResourceExhausted { source, .. } => Some(source),
            Self::SegmentOpen(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for SHM operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Process id of the caller.
#[must_use]
pub fn this_process_pid() -> u32 {
    std::process::id()
}

/// Deadline `timeout` from now, capped at [`MAX_WAIT`] so huge values such
/// as `Duration::MAX` cannot overflow `Instant`.
#[must_use]
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_WAIT)).unwrap_or(now)
}

/// Check whether a process is still running.
///
/// `kill(pid, 0)` performs permission and existence checks only. `EPERM`
/// means the process exists but belongs to another user.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 sends nothing; the call only validates the target pid.
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_alive() {
        assert!(is_process_alive(this_process_pid()));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        let far = deadline_after(Duration::MAX);
        assert!(far >= before + MAX_WAIT);
        assert!(deadline_after(Duration::ZERO) <= Instant::now());
    }

    #[test]
    fn test_invalid_pids_not_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::OutOfRange {
            offset: 9000,
            size: 4096,
        };
        assert_eq!(err.to_string(), "Offset 9000 outside segment of 4096 bytes");
        assert_eq!(
            ShmError::StaleLock { pid: 42 }.to_string(),
            "Segment lock held by terminated process 42"
        );
    }
}
