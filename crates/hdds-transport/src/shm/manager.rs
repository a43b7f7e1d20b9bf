// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-wide shared-memory subsystem.
//!
//! [`SharedMem`] hands out the two sides of a port:
//!
//! - [`PortReader`]: owns the port segment behind an input channel and
//!   unlinks it on release
//! - [`PortWriter`]: pushes to destination ports, caching every port it has
//!   opened
//!
//! # Segment Naming
//!
//! ```text
//! unicast   SHM:[U]:7411  ->  /hdds_port7411
//! multicast SHM:[M]:7400  ->  /hdds_port7400_m<pid>_<n>   (one per reader)
//! ```
//!
//! Multicast delivery fans out to every reader segment of the port.

use super::metrics::ShmMetrics;
use super::port::ShmPort;
use super::segment::SharedSegment;
use super::{deadline_after, this_process_pid, Result, ShmError};
use crate::config::{SharedMemTransportDescriptor, SEGMENT_PREFIX};
use crate::locator::Locator;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROBE_SEGMENT_SIZE: usize = 4096;

static MULTICAST_READER_SEQ: AtomicU32 = AtomicU32::new(0);

/// Sizing and timing of shared-memory ports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedMemConfig {
    /// Messages per port
    pub port_queue_capacity: u32,
    /// Upper bound for any reader's slot size
    pub max_message_size: u32,
    /// Bound on segment mutex acquisition
    pub lock_timeout: Duration,
}

impl From<&SharedMemTransportDescriptor> for SharedMemConfig {
    fn from(d: &SharedMemTransportDescriptor) -> Self {
        Self {
            port_queue_capacity: d.port_queue_capacity,
            max_message_size: d.max_message_size,
            lock_timeout: d.lock_timeout,
        }
    }
}

impl Default for SharedMemConfig {
    fn default() -> Self {
        Self::from(&SharedMemTransportDescriptor::default())
    }
}

/// Segment name of the unicast port for `port`.
#[must_use]
pub fn unicast_port_name(port: u16) -> String {
    format!("/{SEGMENT_PREFIX}port{port}")
}

fn multicast_member_prefix(port: u16) -> String {
    format!("{SEGMENT_PREFIX}port{port}_m")
}

fn new_multicast_member_name(port: u16) -> String {
    let seq = MULTICAST_READER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "/{}{}_{}",
        multicast_member_prefix(port),
        this_process_pid(),
        seq
    )
}

/// Shared-memory subsystem of one transport.
#[derive(Debug)]
pub struct SharedMem {
    config: SharedMemConfig,
    metrics: Arc<ShmMetrics>,
}

impl SharedMem {
    /// Check that shared memory is usable on this host.
    ///
    /// # Errors
    ///
    /// Whatever prevented creating (or removing) a probe segment.
    pub fn new(config: SharedMemConfig) -> Result<Self> {
        let probe = format!(
            "/{}probe_{}_{}",
            SEGMENT_PREFIX,
            this_process_pid(),
            uuid::Uuid::new_v4().simple()
        );
        let segment = SharedSegment::create(&probe, PROBE_SEGMENT_SIZE)?;
        drop(segment);
        SharedSegment::remove(&probe)?;

        log::debug!(
            "[SHM] subsystem ready (queue={}, max_msg={}, lock_timeout={:?})",
            config.port_queue_capacity,
            config.max_message_size,
            config.lock_timeout
        );
        Ok(Self {
            config,
            metrics: Arc::new(ShmMetrics::new()),
        })
    }

    /// Create the port behind an input channel on `locator`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a live process already reads this unicast port.
    pub fn create_reader(&self, locator: &Locator, max_message_size: u32) -> Result<PortReader> {
        let port = locator.physical_port();
        let name = if locator.is_multicast() {
            new_multicast_member_name(port)
        } else {
            unicast_port_name(port)
        };
        let slot_size = max_message_size.min(self.config.max_message_size);
        let shm_port = ShmPort::create(
            &name,
            self.config.port_queue_capacity,
            slot_size,
            self.config.lock_timeout,
        )?;
        log::debug!("[SHM] reader {} on {}", name, locator);
        Ok(PortReader {
            port: shm_port,
            name,
            locator: *locator,
            metrics: Arc::clone(&self.metrics),
            released: AtomicBool::new(false),
        })
    }

    /// Create a writer able to reach any port on this host.
    #[must_use]
    pub fn create_writer(&self) -> PortWriter {
        PortWriter {
            ports: DashMap::new(),
            lock_timeout: self.config.lock_timeout,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Counters shared by every reader and writer of this subsystem.
    #[must_use]
    pub fn metrics(&self) -> &Arc<ShmMetrics> {
        &self.metrics
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SharedMemConfig {
        &self.config
    }
}

/// Owner side of a port.
#[derive(Debug)]
pub struct PortReader {
    port: ShmPort,
    name: String,
    locator: Locator,
    metrics: Arc<ShmMetrics>,
    released: AtomicBool,
}

impl PortReader {
    /// Pop one message into `buf`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// `PortClosed` after [`Self::release`]; lock and corruption errors.
    pub fn receive(&self, buf: &mut Vec<u8>, timeout: Duration) -> Result<bool> {
        match self.port.pop_into(buf, timeout) {
            Ok(true) => {
                self.metrics.inc_reads();
                Ok(true)
            }
            Err(e @ ShmError::StaleLock { .. }) => {
                self.metrics.inc_stale_locks();
                Err(e)
            }
            other => other,
        }
    }

    /// Locator this reader serves.
    #[must_use]
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Segment name of the port.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.port.len()
    }

    /// Close the port (waking a blocked `receive`) and unlink its name.
    /// Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.port.close();
        if let Err(e) = SharedSegment::remove(&self.name) {
            log::warn!("[SHM] cannot remove port segment {}: {}", self.name, e);
        }
    }
}

impl Drop for PortReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Writer side: pushes into destination ports.
#[derive(Debug)]
pub struct PortWriter {
    /// Opened destination ports, keyed by segment name
    ports: DashMap<String, Arc<ShmPort>>,
    lock_timeout: Duration,
    metrics: Arc<ShmMetrics>,
}

impl PortWriter {
    /// Deliver `data` to the port(s) behind `destination`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no reader serves a unicast destination
    /// - `Timeout` if a destination port stayed full
    /// - `PayloadTooLarge` if `data` exceeds the reader's slot size
    pub fn write(&self, data: &[u8], destination: &Locator, timeout: Duration) -> Result<()> {
        let deadline = deadline_after(timeout);
        let port = destination.physical_port();

        if !destination.is_multicast() {
            return self.write_to(&unicast_port_name(port), data, deadline);
        }

        let prefix = multicast_member_prefix(port);
        let members = SharedSegment::list(&prefix);
        self.prune_members(&prefix, &members);

        // Fan out; report the first failure after trying every member
        let mut first_err = None;
        for name in members {
            if let Err(e) = self.write_to(&name, data, deadline) {
                log::debug!("[SHM] multicast member {} skipped: {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn write_to(&self, name: &str, data: &[u8], deadline: Instant) -> Result<()> {
        // A closed cached port means its reader went away (maybe recreated)
        for attempt in 0..2 {
            let port = self.port(name)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match port.push(data, remaining) {
                Ok(()) => {
                    self.metrics.inc_writes();
                    return Ok(());
                }
                Err(ShmError::PortClosed) if attempt == 0 => {
                    self.ports.remove(name);
                    self.metrics.inc_port_reopens();
                }
                // Reader crashed; a restarted one owns a new segment by now
                Err(ShmError::Timeout) if attempt == 0 && port.segment().is_stale() => {
                    self.ports.remove(name);
                    self.metrics.inc_port_reopens();
                }
                Err(e) => {
                    match e {
                        ShmError::Timeout => self.metrics.inc_send_timeouts(),
                        ShmError::StaleLock { .. } => self.metrics.inc_stale_locks(),
                        ShmError::PortClosed => {
                            self.ports.remove(name);
                        }
                        _ => {}
                    }
                    return Err(e);
                }
            }
        }
        Err(ShmError::PortClosed)
    }

    /// Forget cached members of a multicast group that left or closed.
    fn prune_members(&self, prefix: &str, members: &[String]) {
        let cached = format!("/{prefix}");
        self.ports.retain(|name, port| {
            !name.starts_with(&cached) || (!port.is_closed() && members.contains(name))
        });
    }

    fn port(&self, name: &str) -> Result<Arc<ShmPort>> {
        if let Some(port) = self.ports.get(name) {
            return Ok(Arc::clone(port.value()));
        }
        let port = Arc::new(ShmPort::open(name, self.lock_timeout)?);
        if port.segment().is_stale() {
            log::debug!("[SHM] destination {} belongs to a dead process", name);
            if let Err(e) = SharedSegment::remove_if_stale(name) {
                log::warn!("[SHM] cannot remove stale segment {}: {}", name, e);
            }
            return Err(ShmError::NotFound(name.to_string()));
        }
        self.ports.insert(name.to_string(), Arc::clone(&port));
        Ok(port)
    }

    /// Number of cached destination ports.
    #[must_use]
    pub fn cached_ports(&self) -> usize {
        self.ports.len()
    }

    /// Drop every cached destination port.
    pub fn clear(&self) {
        self.ports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SharedMemConfig {
        SharedMemConfig {
            port_queue_capacity: 4,
            max_message_size: 256,
            lock_timeout: Duration::from_millis(500),
        }
    }

    fn test_port() -> u32 {
        // Outside the RTPS range so parallel suites do not collide
        fastrand::u32(40_000..60_000)
    }

    #[test]
    fn test_unicast_round_trip() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm(test_port());
        let reader = shm.create_reader(&locator, 128).expect("reader");
        let writer = shm.create_writer();

        writer
            .write(b"payload", &locator, Duration::from_millis(100))
            .expect("write");
        let mut buf = Vec::new();
        assert!(reader.receive(&mut buf, Duration::from_millis(100)).expect("receive"));
        assert_eq!(buf, b"payload");
        assert_eq!(writer.cached_ports(), 1);

        let snap = shm.metrics().snapshot();
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.reads, 1);
    }

    #[test]
    fn test_write_without_reader_is_not_found() {
        let shm = SharedMem::new(config()).expect("shm available");
        let writer = shm.create_writer();
        assert!(matches!(
            writer.write(b"x", &Locator::shm(test_port()), Duration::from_millis(10)),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_reader_rejected() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm(test_port());
        let _reader = shm.create_reader(&locator, 64).expect("reader");
        assert!(matches!(
            shm.create_reader(&locator, 64),
            Err(ShmError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_release_unlinks_and_writer_reopens() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm(test_port());
        let writer = shm.create_writer();

        let first = shm.create_reader(&locator, 64).expect("reader");
        writer
            .write(b"a", &locator, Duration::from_millis(50))
            .expect("first write");
        first.release();
        assert!(!SharedSegment::exists(first.name()));

        let second = shm.create_reader(&locator, 64).expect("recreated reader");
        writer
            .write(b"b", &locator, Duration::from_millis(50))
            .expect("write after reopen");
        let mut buf = Vec::new();
        assert!(second.receive(&mut buf, Duration::from_millis(50)).expect("receive"));
        assert_eq!(buf, b"b");
        assert_eq!(shm.metrics().snapshot().port_reopens, 1);
    }

    #[test]
    fn test_multicast_fan_out() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm_multicast(test_port());
        let a = shm.create_reader(&locator, 64).expect("reader a");
        let b = shm.create_reader(&locator, 64).expect("reader b");
        assert_ne!(a.name(), b.name());

        shm.create_writer()
            .write(b"announce", &locator, Duration::from_millis(50))
            .expect("multicast write");

        let mut buf = Vec::new();
        assert!(a.receive(&mut buf, Duration::from_millis(50)).expect("a"));
        assert_eq!(buf, b"announce");
        assert!(b.receive(&mut buf, Duration::from_millis(50)).expect("b"));
        assert_eq!(buf, b"announce");
    }

    #[test]
    fn test_departed_multicast_members_leave_cache() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm_multicast(test_port());
        let writer = shm.create_writer();

        for _ in 0..20 {
            let member = shm.create_reader(&locator, 64).expect("member");
            writer
                .write(b"hello", &locator, Duration::from_millis(50))
                .expect("write to member");
            drop(member);
        }

        let live = shm.create_reader(&locator, 64).expect("live member");
        writer
            .write(b"hello", &locator, Duration::from_millis(50))
            .expect("write to live member");
        assert_eq!(writer.cached_ports(), 1);

        let mut buf = Vec::new();
        assert!(live.receive(&mut buf, Duration::from_millis(50)).expect("receive"));
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_stale_destination_is_removed() {
        let shm = SharedMem::new(config()).expect("shm available");
        let port = test_port();
        let name = unicast_port_name(port as u16);
        let orphan = ShmPort::create(&name, 4, 64, Duration::from_millis(500)).expect("orphan port");

        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("reap");
        orphan.segment().set_creator_pid(dead_pid);

        let writer = shm.create_writer();
        assert!(matches!(
            writer.write(b"x", &Locator::shm(port), Duration::from_millis(10)),
            Err(ShmError::NotFound(_))
        ));
        assert!(!SharedSegment::exists(&name));
        assert_eq!(writer.cached_ports(), 0);
    }

    #[test]
    fn test_unbounded_send_timeout() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm(test_port());
        let reader = shm.create_reader(&locator, 64).expect("reader");
        shm.create_writer()
            .write(b"no deadline", &locator, Duration::MAX)
            .expect("write");
        let mut buf = Vec::new();
        assert!(reader.receive(&mut buf, Duration::MAX).expect("receive"));
        assert_eq!(buf, b"no deadline");
    }

    #[test]
    fn test_full_port_counts_timeout() {
        let shm = SharedMem::new(config()).expect("shm available");
        let locator = Locator::shm(test_port());
        let _reader = shm.create_reader(&locator, 64).expect("reader");
        let writer = shm.create_writer();
        for _ in 0..4 {
            writer.write(b"fill", &locator, Duration::ZERO).expect("fill");
        }
        assert!(matches!(
            writer.write(b"over", &locator, Duration::from_millis(10)),
            Err(ShmError::Timeout)
        ));
        assert_eq!(shm.metrics().snapshot().send_timeouts, 1);
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(unicast_port_name(7411), "/hdds_port7411");
        assert!(new_multicast_member_name(7400).starts_with("/hdds_port7400_m"));
    }
}
