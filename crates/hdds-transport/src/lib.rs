// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HDDS Transport - RTPS transport layer
//!
//! Moves serialized RTPS messages between participants through pluggable
//! physical transports, including an intra-host shared-memory channel.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                     Participant layer (external)                    |
//! |        locators in  |  buffers out  |  receiver callbacks           |
//! +---------------------------------------------------------------------+
//! |   NetworkFactory  ->  LocatorSelector (one pass per transport)      |
//! +---------------------------------------------------------------------+
//! |   TransportInterface                                                |
//! |     SharedMemTransport (Linux)        UdpV4Transport                |
//! |     ChannelResource / SenderResource                                |
//! +---------------------------------------------------------------------+
//! |   shm: SharedSegment | ShmPort | ShmMutex/ShmCondvar (futex)        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdds_transport::config::{SharedMemTransportDescriptor, UdpTransportDescriptor};
//! use hdds_transport::transport::{SharedMemTransport, UdpV4Transport};
//! use hdds_transport::{Locator, LocatorSelector, LocatorSelectorEntry, NetworkFactory};
//! use std::time::Duration;
//!
//! let mut factory = NetworkFactory::new();
//! factory.register_transport(Box::new(SharedMemTransport::new(
//!     SharedMemTransportDescriptor::from_env(),
//! )))?;
//! factory.register_transport(Box::new(UdpV4Transport::new(UdpTransportDescriptor::from_env())))?;
//!
//! let remote = Locator::shm(7413);
//! let mut senders = Vec::new();
//! factory.build_send_resources(&mut senders, &remote);
//!
//! let mut selector = LocatorSelector::new();
//! selector.add_entry(LocatorSelectorEntry::new([7; 16], vec![remote], vec![]));
//! selector.reset(true);
//! factory.select_locators(&mut selector);
//! factory.send(&senders, b"RTPS...", &selector, Duration::from_millis(100))?;
//! # Ok::<(), hdds_transport::TransportError>(())
//! ```
//!
//! ## Modules Overview
//!
//! - [`locator`] - locator value type and kinds
//! - [`transport`] - transport contract, channels, shared-memory and UDP transports
//! - [`selector`] - locator selection algorithm
//! - [`network`] - transport registry
//! - [`shm`] - shared-memory segments and ports (Linux)
//! - [`config`] / [`ports`] - constants, descriptors, RTPS port formula

pub mod config;
pub mod locator;
pub mod network;
pub mod ports;
pub mod selector;
#[cfg(target_os = "linux")]
pub mod shm;
pub mod transport;

pub use locator::{Locator, LocatorKind};
pub use network::NetworkFactory;
pub use ports::{PortMapping, PortParameters};
pub use selector::{LocatorSelector, LocatorSelectorEntry};
pub use transport::{
    ChannelResource, SenderResource, TransportError, TransportInterface, TransportReceiver,
};
