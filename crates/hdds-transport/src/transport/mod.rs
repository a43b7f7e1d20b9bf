// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable RTPS transports.
//!
//! Every physical transport implements [`TransportInterface`]: it owns the
//! input channels opened on its locators, creates sender resources for the
//! caller's pool, and completes locators with RTPS well-known ports.
//!
//! # Modules
//!
//! - `channel` - input channel lifecycle and receive thread
//! - `shared_mem` - intra-host transport over shared-memory ports (Linux)
//! - `udp` - UDPv4 transport over `socket2`
//!
//! # Input channel lifecycle
//!
//! ```text
//! Closed --open_input_channel--> Active --close_input_channel--> Closed
//!                                  |  disable -> release -> clear -> drop
//! ```

pub mod channel;
#[cfg(target_os = "linux")]
pub mod shared_mem;
pub mod udp;

pub use channel::{ChannelRegistry, ChannelResource, ChannelState, MessageSource};
#[cfg(target_os = "linux")]
pub use shared_mem::{SharedMemSenderResource, SharedMemTransport};
pub use udp::{UdpSenderResource, UdpV4Transport};

use crate::locator::{Locator, LocatorKind, LOCATOR_PORT_INVALID};
use crate::ports::PortParameters;
use crate::selector::{self, LocatorSelector};
#[cfg(target_os = "linux")]
use crate::shm::ShmError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by transports.
#[derive(Debug)]
pub enum TransportError {
    /// Locator kind not handled by this transport
    UnsupportedLocator(Locator),

    /// Shared memory failure
    #[cfg(target_os = "linux")]
    Shm(ShmError),

    /// Socket or thread I/O failure
    Io(io::Error),

    /// Transport used before a successful `init`
    NotInitialized,

    /// Descriptor value rejected by `init`
    InvalidConfig(String),

    /// Buffer larger than the transport accepts
    MessageTooLarge { size: usize, max: usize },

    /// Sender resource belongs to another transport kind
    InvalidSender(LocatorKind),

    /// Domain ID outside 0..=232
    InvalidDomainId(u32),

    /// Participant ID outside 0..=119
    InvalidParticipantId(u32),

    /// Computed port does not fit 16 bits
    PortOutOfRange(u32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedLocator(loc) => write!(f, "Unsupported locator: {loc}"),
            #[cfg(target_os = "linux")]
            Self::Shm(e) => write!(f, "Shared memory error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NotInitialized => write!(f, "Transport not initialized"),
            Self::InvalidConfig(what) => write!(f, "Invalid transport configuration: {what}"),
            Self::MessageTooLarge { size, max } => {
                write!(f, "Message of {size} bytes exceeds maximum {max}")
            }
            Self::InvalidSender(kind) => write!(f, "Sender resource of kind {kind} not usable here"),
            Self::InvalidDomainId(id) => write!(f, "Invalid domain ID {id} (max 232)"),
            Self::InvalidParticipantId(id) => write!(f, "Invalid participant ID {id} (max 119)"),
            Self::PortOutOfRange(port) => write!(f, "Port {port} exceeds 65535"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Shm(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
impl From<ShmError> for TransportError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Callback receiving every message delivered on an input channel.
///
/// Invoked on the channel's receive thread; never after the channel was
/// disabled.
pub trait TransportReceiver: Send + Sync {
    /// One message arrived on `local` from `remote`.
    fn on_data_received(&self, data: &[u8], local: &Locator, remote: &Locator);
}

impl<F> TransportReceiver for F
where
    F: Fn(&[u8], &Locator, &Locator) + Send + Sync,
{
    fn on_data_received(&self, data: &[u8], local: &Locator, remote: &Locator) {
        self(data, local, remote);
    }
}

/// Outbound handle stored in the caller's sender pool.
#[derive(Debug)]
pub enum SenderResource {
    /// Shared-memory port writer
    #[cfg(target_os = "linux")]
    SharedMem(SharedMemSenderResource),
    /// UDPv4 socket
    Udp(UdpSenderResource),
}

impl SenderResource {
    /// Kind of locators this sender reaches.
    #[must_use]
    pub fn kind(&self) -> LocatorKind {
        match self {
            #[cfg(target_os = "linux")]
            Self::SharedMem(_) => LocatorKind::Shm,
            Self::Udp(_) => LocatorKind::UdpV4,
        }
    }

    /// Shared-memory view, if this is a shared-memory sender.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn as_shared_mem(&self) -> Option<&SharedMemSenderResource> {
        match self {
            Self::SharedMem(s) => Some(s),
            _ => None,
        }
    }

    /// UDP view, if this is a UDP sender.
    #[must_use]
    pub fn as_udp(&self) -> Option<&UdpSenderResource> {
        match self {
            Self::Udp(s) => Some(s),
            #[cfg(target_os = "linux")]
            _ => None,
        }
    }
}

/// Per-kind transport contract.
pub trait TransportInterface: Send + Sync {
    /// Locator kind served.
    fn kind(&self) -> LocatorKind;

    /// Allocate transport-wide resources. The transport is unusable if this
    /// fails.
    fn init(&mut self) -> Result<()>;

    /// True when `locator` has this transport's kind.
    fn is_locator_supported(&self, locator: &Locator) -> bool {
        locator.kind == self.kind()
    }

    /// Input locators share a channel when kind and physical port agree.
    fn do_input_locators_match(&self, a: &Locator, b: &Locator) -> bool {
        a.kind == b.kind && a.physical_port() == b.physical_port()
    }

    /// True if an active input channel is registered for `locator`.
    fn is_input_channel_open(&self, locator: &Locator) -> bool;

    /// Build a channel bound to `locator`. Ownership goes to the caller; the
    /// channel is not registered.
    ///
    /// # Errors
    ///
    /// `UnsupportedLocator`, `NotInitialized`, or resource creation failure.
    fn create_input_channel_resource(
        &self,
        locator: &Locator,
        is_multicast: bool,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<ChannelResource>;

    /// Create and register a channel unless one is already open.
    ///
    /// # Errors
    ///
    /// As [`Self::create_input_channel_resource`]; the registry is unchanged
    /// on failure.
    fn open_input_channel(
        &self,
        locator: &Locator,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<()>;

    /// Close every channel on `locator`. Returns `false` if none was open.
    fn close_input_channel(&self, locator: &Locator) -> bool;

    /// Make sure `senders` holds a sender of this kind (reuse first).
    ///
    /// # Errors
    ///
    /// `UnsupportedLocator` or sender creation failure; `senders` is
    /// unchanged on error.
    fn open_output_channel(&self, senders: &mut Vec<SenderResource>, locator: &Locator)
        -> Result<()>;

    /// Local counterpart of a remote locator: same kind and port, no
    /// address. Invalid locator for unsupported kinds.
    fn remote_to_main_local(&self, remote: &Locator) -> Locator {
        if !self.is_locator_supported(remote) {
            return Locator::invalid();
        }
        let mut local = *remote;
        local.set_invalid_address();
        local
    }

    /// Locator to use for reaching `remote`, `None` if unsupported.
    fn transform_remote_locator(&self, remote: &Locator) -> Option<Locator> {
        self.is_locator_supported(remote).then_some(*remote)
    }

    /// Write `buffer` to `destination` through `sender`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// `UnsupportedLocator`, `InvalidSender`, `MessageTooLarge`, or the
    /// underlying I/O error (including timeout).
    fn send(
        &self,
        sender: &SenderResource,
        buffer: &[u8],
        destination: &Locator,
        only_multicast_purpose: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Largest buffer `send` accepts.
    fn max_message_size(&self) -> u32;

    /// Candidate count for zero-port initial peers.
    fn max_initial_peers_range(&self) -> u32;

    /// Assign the metatraffic multicast port if unset.
    fn fill_metatraffic_multicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
    ) {
        if locator.port == LOCATOR_PORT_INVALID {
            locator.port = params.multicast_port(domain_id);
        }
    }

    /// Assign the metatraffic unicast port if unset.
    fn fill_metatraffic_unicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
        participant_id: u32,
    ) {
        if locator.port == LOCATOR_PORT_INVALID {
            locator.port = params.unicast_port(domain_id, participant_id);
        }
    }

    /// Assign the user data unicast port if unset.
    fn fill_unicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
        participant_id: u32,
    ) {
        if locator.port == LOCATOR_PORT_INVALID {
            locator.port = params.user_unicast_port(domain_id, participant_id);
        }
    }

    /// Expand an initial peer into concrete locators appended to `out`.
    ///
    /// A zero port yields one candidate per participant id in
    /// `0..max_initial_peers_range()`; any other port is kept as is.
    fn configure_initial_peer_locator(
        &self,
        locator: &Locator,
        params: &PortParameters,
        domain_id: u32,
        out: &mut Vec<Locator>,
    ) {
        if locator.port != LOCATOR_PORT_INVALID {
            out.push(*locator);
            return;
        }
        out.extend((0..self.max_initial_peers_range()).map(|i| {
            let mut peer = *locator;
            peer.port = params.unicast_port(domain_id, i);
            peer
        }));
    }

    /// Run one selection pass with this transport's support predicate.
    fn select_locators(&self, selector: &mut LocatorSelector) {
        selector::select_locators(selector, |l| self.is_locator_supported(l));
    }

    /// Close every input channel still registered.
    fn shutdown(&self);
}
