// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory port: a bounded message queue inside one segment.
//!
//! # Memory Layout
//!
//! ```text
//! SegmentHeader | PortHeader (root) | slot 0 | slot 1 | ... | slot N-1
//!                                     slot = [len: u32 LE][payload ...]
//! ```
//!
//! Writers from any process push under the segment mutex; the owning
//! reader pops. Both sides sleep on the segment condvar when the queue is
//! full (writers) or empty (reader). Every location is an [`Offset`].

use super::segment::{Offset, SharedSegment, HEADER_SIZE};
use super::{deadline_after, Result, ShmError};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// "PORT"
const PORT_MAGIC: u32 = 0x504F_5254;
const SLOT_LEN_PREFIX: usize = mem::size_of::<u32>();
const SLOT_ALIGN: usize = 8;
const ROOT_WAIT: Duration = Duration::from_millis(200);

#[repr(C, align(64))]
struct PortHeader {
    magic: AtomicU32,
    capacity: AtomicU32,
    slot_size: AtomicU32,
    closed: AtomicU32,
    /// Next slot to pop (monotonic)
    head: AtomicU64,
    /// Next slot to push (monotonic)
    tail: AtomicU64,
    /// Offset of slot 0
    slots: AtomicU64,
}

fn slot_stride(max_message_size: usize) -> usize {
    (SLOT_LEN_PREFIX + max_message_size).next_multiple_of(SLOT_ALIGN)
}

/// Segment size needed for a port of `capacity` messages of up to
/// `max_message_size` bytes.
#[must_use]
pub fn port_segment_size(capacity: u32, max_message_size: u32) -> usize {
    HEADER_SIZE
        + mem::size_of::<PortHeader>()
        + mem::align_of::<PortHeader>()
        + capacity as usize * slot_stride(max_message_size as usize)
}

/// Handle on a port segment (owner or writer side).
pub struct ShmPort {
    segment: SharedSegment,
    header: NonNull<PortHeader>,
    slots: Offset,
    capacity: u64,
    slot_size: usize,
    stride: u64,
    lock_timeout: Duration,
}

// SAFETY: `header` points into `segment`, which lives as long as the port;
// PortHeader is made only of atomics.
unsafe impl Send for ShmPort {}
unsafe impl Sync for ShmPort {}

impl std::fmt::Debug for ShmPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmPort")
            .field("name", &self.segment.name())
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("len", &self.len())
            .finish()
    }
}

impl ShmPort {
    /// Create the port segment `name`.
    ///
    /// A leftover segment whose creator died is removed and replaced.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a live process owns the name, plus any segment
    /// creation error.
    pub fn create(
        name: &str,
        capacity: u32,
        max_message_size: u32,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let size = port_segment_size(capacity, max_message_size);
        let segment = match SharedSegment::create(name, size) {
            Err(ShmError::AlreadyExists(_)) if SharedSegment::remove_if_stale(name)? => {
                SharedSegment::create(name, size)?
            }
            other => other?,
        };

        let header_off =
            segment.allocate(mem::size_of::<PortHeader>(), mem::align_of::<PortHeader>())?;
        let stride = slot_stride(max_message_size as usize);
        let slots = segment.allocate(capacity as usize * stride, SLOT_ALIGN)?;

        // SAFETY: header_off was allocated for a PortHeader with its
        // alignment; zeroed memory is a valid PortHeader.
        let header = unsafe { segment.at::<PortHeader>(header_off)? };
        header.capacity.store(capacity, Ordering::Relaxed);
        header.slot_size.store(max_message_size, Ordering::Relaxed);
        header.slots.store(slots.get(), Ordering::Relaxed);
        header.magic.store(PORT_MAGIC, Ordering::Relaxed);
        segment.set_root(header_off);

        log::debug!(
            "[SHM] port {} ready: {} slots x {} bytes",
            name,
            capacity,
            max_message_size
        );
        Self::attach(segment, lock_timeout)
    }

    /// Open an existing port segment.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `Corruption` if it is not a port.
    pub fn open(name: &str, lock_timeout: Duration) -> Result<Self> {
        let segment = SharedSegment::open(name)?;
        Self::attach(segment, lock_timeout)
    }

    fn attach(segment: SharedSegment, lock_timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + ROOT_WAIT;
        let root = loop {
            match segment.root() {
                Some(root) => break root,
                None if Instant::now() >= deadline => {
                    return Err(ShmError::Corruption(format!(
                        "{}: no port header published",
                        segment.name()
                    )))
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        };

        // SAFETY: root offset was published by the creator after laying out
        // a PortHeader there; `at` re-checks bounds and alignment.
        let header = unsafe { segment.at::<PortHeader>(root)? };
        if header.magic.load(Ordering::Acquire) != PORT_MAGIC {
            return Err(ShmError::Corruption(format!(
                "{}: not a port segment",
                segment.name()
            )));
        }

        let capacity = u64::from(header.capacity.load(Ordering::Relaxed));
        let slot_size = header.slot_size.load(Ordering::Relaxed) as usize;
        let stride = slot_stride(slot_size) as u64;
        let slots = Offset(header.slots.load(Ordering::Relaxed));
        let end = slots.get().saturating_add(capacity.saturating_mul(stride));
        if capacity == 0 || end > segment.size() as u64 {
            return Err(ShmError::Corruption(format!(
                "{}: slot array does not fit segment",
                segment.name()
            )));
        }

        let header = NonNull::from(header);
        Ok(Self {
            segment,
            header,
            slots,
            capacity,
            slot_size,
            stride,
            lock_timeout,
        })
    }

    fn header(&self) -> &PortHeader {
        // SAFETY: see the Send/Sync justification above.
        unsafe { self.header.as_ref() }
    }

    fn slot(&self, index: u64) -> Offset {
        self.slots.add((index % self.capacity) * self.stride)
    }

    /// Lock bound for an operation ending at `deadline`.
    fn lock_bound(&self, deadline: Instant) -> Duration {
        self.lock_timeout
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    /// Append one message, waiting up to `timeout` for a free slot.
    ///
    /// Never blocks past `timeout`: lock acquisition is bounded by the
    /// smaller of `timeout` and the port's lock timeout.
    ///
    /// # Errors
    ///
    /// - `PayloadTooLarge` if `data` exceeds the slot size
    /// - `PortClosed` once the owner closed the port
    /// - `Timeout` if the port stayed full
    /// - `StaleLock` / `Timeout` from lock acquisition
    pub fn push(&self, data: &[u8], timeout: Duration) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(ShmError::PayloadTooLarge {
                size: data.len(),
                capacity: self.slot_size,
            });
        }

        let deadline = deadline_after(timeout);
        let hdr = self.header();
        let mut guard = self.segment.mutex().lock_timeout(self.lock_bound(deadline))?;
        loop {
            if hdr.closed.load(Ordering::Acquire) != 0 {
                return Err(ShmError::PortClosed);
            }
            let head = hdr.head.load(Ordering::Relaxed);
            let tail = hdr.tail.load(Ordering::Relaxed);
            if tail - head < self.capacity {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ShmError::Timeout);
            }
            guard = self.segment.condvar().wait_until(guard, deadline)?.0;
        }

        let tail = hdr.tail.load(Ordering::Relaxed);
        let slot = self.slot(tail);
        let len = data.len() as u32;
        self.segment.write_bytes(slot, &len.to_le_bytes())?;
        self.segment
            .write_bytes(slot.add(SLOT_LEN_PREFIX as u64), data)?;
        hdr.tail.store(tail + 1, Ordering::Release);
        drop(guard);

        self.segment.condvar().notify_all();
        Ok(())
    }

    /// Pop the oldest message into `buf`, waiting up to `timeout`.
    ///
    /// Returns `Ok(false)` if the port stayed empty.
    ///
    /// # Errors
    ///
    /// `PortClosed` once closed and drained; lock errors; `Corruption` on
    /// an impossible length prefix.
    pub fn pop_into(&self, buf: &mut Vec<u8>, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout);
        let hdr = self.header();
        // A live holder outlasting our deadline just means nothing arrived
        let mut guard = match self.segment.mutex().lock_timeout(self.lock_bound(deadline)) {
            Ok(guard) => guard,
            Err(ShmError::Timeout) => return Ok(false),
            Err(e) => return Err(e),
        };
        loop {
            let head = hdr.head.load(Ordering::Relaxed);
            let tail = hdr.tail.load(Ordering::Relaxed);
            if head < tail {
                break;
            }
            if hdr.closed.load(Ordering::Acquire) != 0 {
                return Err(ShmError::PortClosed);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            guard = match self.segment.condvar().wait_until(guard, deadline) {
                Ok((guard, _)) => guard,
                Err(ShmError::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            };
        }

        let head = hdr.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        let mut len = [0u8; SLOT_LEN_PREFIX];
        self.segment.read_bytes(slot, &mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > self.slot_size {
            return Err(ShmError::Corruption(format!(
                "{}: slot length {} exceeds {}",
                self.segment.name(),
                len,
                self.slot_size
            )));
        }
        buf.resize(len, 0);
        self.segment
            .read_bytes(slot.add(SLOT_LEN_PREFIX as u64), buf)?;
        hdr.head.store(head + 1, Ordering::Release);
        drop(guard);

        self.segment.condvar().notify_all();
        Ok(true)
    }

    /// Mark the port closed and wake every waiter.
    pub fn close(&self) {
        self.header().closed.store(1, Ordering::Release);
        self.segment.condvar().notify_all();
    }

    /// True once [`Self::close`] was called by any process.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    /// Messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Acquire);
        let head = hdr.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    /// True when no message is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Largest message a slot accepts.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.slot_size
    }

    /// Underlying segment.
    #[must_use]
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}
