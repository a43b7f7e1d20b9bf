// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport configuration - single source of truth for constants.
//!
//! - **Static**: RTPS port formula constants, default multicast group,
//!   message and queue sizing.
//! - **Descriptors**: per-transport configuration structs with `Default`
//!   values, `with_*` setters and environment overrides.
//!
//! # Example
//!
//! ```
//! use hdds_transport::config::SharedMemTransportDescriptor;
//! use std::time::Duration;
//!
//! let descriptor = SharedMemTransportDescriptor::default()
//!     .with_port_queue_capacity(64)
//!     .with_lock_timeout(Duration::from_millis(250));
//! assert_eq!(descriptor.port_queue_capacity, 64);
//! ```

use std::time::Duration;

// =======================================================================
// RTPS v2.5 Port Mapping (OMG DDS-RTPS v2.5 Sec.9.6.1.1)
// =======================================================================

/// RTPS v2.5 base port (IANA registered)
pub const PORT_BASE: u32 = 7400;

/// Maximum domain ID (`domain_id` valid range: 0..=232)
pub const MAX_DOMAIN_ID: u32 = 232;

/// Maximum participant ID (`participant_id` valid range: 0..=119)
pub const MAX_PARTICIPANT_ID: u32 = 119;

/// Domain gain: `PORT_BASE + DOMAIN_ID_GAIN x domain_id`
pub const DOMAIN_ID_GAIN: u32 = 250;

/// Participant gain: `base + PARTICIPANT_ID_GAIN x participant_id`
pub const PARTICIPANT_ID_GAIN: u32 = 2;

/// Offset d0: metatraffic multicast
pub const OFFSET_D0: u32 = 0;

/// Offset d1: metatraffic unicast
pub const OFFSET_D1: u32 = 10;

/// Offset d2: user data multicast
pub const OFFSET_D2: u32 = 1;

/// Offset d3: user data unicast
pub const OFFSET_D3: u32 = 11;

/// Standard RTPS multicast IP address (239.255.0.1)
pub const MULTICAST_IP: [u8; 4] = [239, 255, 0, 1];

// =======================================================================
// Message & Resource Sizing
// =======================================================================

/// Largest RTPS message accepted by default (UDP payload limit minus headers)
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65_500;

/// Number of candidate ports generated for a zero-port initial peer
pub const DEFAULT_MAX_INITIAL_PEERS_RANGE: u32 = 4;

/// Default number of messages a shared-memory port can hold
pub const DEFAULT_PORT_QUEUE_CAPACITY: u32 = 512;

/// Upper bound on any blocking cross-process lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on a single `send` call
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll period of input channel receive loops.
///
/// Bounds how long `disable()` takes to be observed by a receive thread.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prefix shared by every segment created by this crate (without leading `/`)
pub const SEGMENT_PREFIX: &str = "hdds_";

// =======================================================================
// Shared memory transport descriptor
// =======================================================================

/// Shared memory transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedMemTransportDescriptor {
    /// Largest message a port slot can hold
    pub max_message_size: u32,

    /// Messages buffered per port before writers block
    pub port_queue_capacity: u32,

    /// Candidate ports generated for zero-port initial peers
    pub max_initial_peers_range: u32,

    /// Bound on cross-process mutex acquisition (stale lock detection)
    pub lock_timeout: Duration,
}

impl Default for SharedMemTransportDescriptor {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            port_queue_capacity: DEFAULT_PORT_QUEUE_CAPACITY,
            max_initial_peers_range: DEFAULT_MAX_INITIAL_PEERS_RANGE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl SharedMemTransportDescriptor {
    /// Set maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set port queue capacity.
    #[must_use]
    pub fn with_port_queue_capacity(mut self, capacity: u32) -> Self {
        self.port_queue_capacity = capacity;
        self
    }

    /// Set initial peers range.
    #[must_use]
    pub fn with_max_initial_peers_range(mut self, range: u32) -> Self {
        self.max_initial_peers_range = range;
        self
    }

    /// Set lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Build from defaults, then apply environment overrides.
    ///
    /// Recognized variables:
    /// - `HDDS_SHM_MAX_MESSAGE_SIZE` (bytes)
    /// - `HDDS_SHM_QUEUE_CAPACITY` (messages)
    /// - `HDDS_SHM_LOCK_TIMEOUT_MS` (milliseconds)
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut descriptor = Self::default();
        if let Some(v) = env_u32("HDDS_SHM_MAX_MESSAGE_SIZE") {
            descriptor.max_message_size = v;
        }
        if let Some(v) = env_u32("HDDS_SHM_QUEUE_CAPACITY") {
            descriptor.port_queue_capacity = v;
        }
        if let Some(v) = env_u32("HDDS_SHM_LOCK_TIMEOUT_MS") {
            descriptor.lock_timeout = Duration::from_millis(u64::from(v));
        }
        descriptor
    }
}

// =======================================================================
// UDPv4 transport descriptor
// =======================================================================

/// UDPv4 transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpTransportDescriptor {
    /// Largest datagram sent or received
    pub max_message_size: u32,

    /// Candidate ports generated for zero-port initial peers
    pub max_initial_peers_range: u32,

    /// Kernel send buffer size (0 = OS default)
    pub send_buffer_size: u32,

    /// Kernel receive buffer size (0 = OS default)
    pub receive_buffer_size: u32,

    /// Multicast TTL for outgoing datagrams
    pub multicast_ttl: u32,
}

impl Default for UdpTransportDescriptor {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_initial_peers_range: DEFAULT_MAX_INITIAL_PEERS_RANGE,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            multicast_ttl: 1,
        }
    }
}

impl UdpTransportDescriptor {
    /// Set maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set initial peers range.
    #[must_use]
    pub fn with_max_initial_peers_range(mut self, range: u32) -> Self {
        self.max_initial_peers_range = range;
        self
    }

    /// Set kernel socket buffer sizes.
    #[must_use]
    pub fn with_buffer_sizes(mut self, send: u32, receive: u32) -> Self {
        self.send_buffer_size = send;
        self.receive_buffer_size = receive;
        self
    }

    /// Build from defaults, then apply `HDDS_MULTICAST_TTL` if set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut descriptor = Self::default();
        if let Some(v) = env_u32("HDDS_MULTICAST_TTL") {
            descriptor.multicast_ttl = v;
        }
        descriptor
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("[CONFIG] ignoring {}={:?}: not a u32", name, raw);
            None
        }
    }
}
