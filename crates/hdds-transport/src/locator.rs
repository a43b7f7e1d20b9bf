// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS locators.
//!
//! # Wire Format
//!
//! ```text
//! struct Locator_t {
//!     long kind;           // 4 bytes: LOCATOR_KIND_*
//!     unsigned long port;  // 4 bytes
//!     octet address[16];   // 16 bytes: IPv4 (last 4), IPv6, or SHM flags
//! };
//! ```
//!
//! Shared-memory locators carry no host address. Byte 0 of the address is
//! `b'M'` for multicast SHM locators and `b'U'` for unicast ones.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

/// Invalid port value (also means "not yet assigned").
pub const LOCATOR_PORT_INVALID: u32 = 0;

/// Locator address length (16 bytes).
pub const LOCATOR_ADDRESS_LEN: usize = 16;

const SHM_MULTICAST_FLAG: u8 = b'M';
const SHM_UNICAST_FLAG: u8 = b'U';

/// Transport kind of a locator (RTPS `LOCATOR_KIND_*` values).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum LocatorKind {
    /// Invalid locator.
    Invalid = -1,
    /// Reserved.
    Reserved = 0,
    /// UDP over IPv4.
    UdpV4 = 1,
    /// UDP over IPv6.
    UdpV6 = 2,
    /// TCP over IPv4 (vendor extension).
    TcpV4 = 4,
    /// TCP over IPv6 (vendor extension).
    TcpV6 = 8,
    /// Shared memory (vendor extension).
    Shm = 16,
}

impl LocatorKind {
    /// Map a raw wire value to a kind. Unknown values map to `Invalid`.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Reserved,
            1 => Self::UdpV4,
            2 => Self::UdpV6,
            4 => Self::TcpV4,
            8 => Self::TcpV6,
            16 => Self::Shm,
            _ => Self::Invalid,
        }
    }

    /// Raw wire value.
    #[must_use]
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "INVALID",
            Self::Reserved => "RESERVED",
            Self::UdpV4 => "UDPv4",
            Self::UdpV6 => "UDPv6",
            Self::TcpV4 => "TCPv4",
            Self::TcpV6 => "TCPv6",
            Self::Shm => "SHM",
        };
        f.write_str(s)
    }
}

/// Endpoint address: transport kind, port, kind-specific address payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Transport kind
    pub kind: LocatorKind,
    /// Port number (0 = not yet assigned)
    pub port: u32,
    /// Address bytes (interpretation depends on `kind`)
    pub address: [u8; LOCATOR_ADDRESS_LEN],
}

impl Locator {
    /// Create a locator from components.
    #[must_use]
    pub const fn new(kind: LocatorKind, port: u32, address: [u8; LOCATOR_ADDRESS_LEN]) -> Self {
        Self {
            kind,
            port,
            address,
        }
    }

    /// Create an invalid locator.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            kind: LocatorKind::Invalid,
            port: LOCATOR_PORT_INVALID,
            address: [0u8; LOCATOR_ADDRESS_LEN],
        }
    }

    /// UDPv4 locator (IPv4 address in the last 4 bytes).
    #[must_use]
    pub fn udp_v4(addr: Ipv4Addr, port: u32) -> Self {
        let mut address = [0u8; LOCATOR_ADDRESS_LEN];
        address[12..16].copy_from_slice(&addr.octets());
        Self::new(LocatorKind::UdpV4, port, address)
    }

    /// UDPv6 locator.
    #[must_use]
    pub fn udp_v6(addr: Ipv6Addr, port: u32) -> Self {
        Self::new(LocatorKind::UdpV6, port, addr.octets())
    }

    /// Unicast shared-memory locator.
    #[must_use]
    pub fn shm(port: u32) -> Self {
        let mut address = [0u8; LOCATOR_ADDRESS_LEN];
        address[0] = SHM_UNICAST_FLAG;
        Self::new(LocatorKind::Shm, port, address)
    }

    /// Multicast shared-memory locator.
    #[must_use]
    pub fn shm_multicast(port: u32) -> Self {
        let mut address = [0u8; LOCATOR_ADDRESS_LEN];
        address[0] = SHM_MULTICAST_FLAG;
        Self::new(LocatorKind::Shm, port, address)
    }

    /// Port used to bind the physical resource (lower 16 bits).
    ///
    /// TCP locators keep a logical port in the upper half; every other kind
    /// stores a plain 16-bit port, so the projection is the identity for them.
    #[inline]
    #[must_use]
    pub fn physical_port(&self) -> u16 {
        (self.port & 0xFFFF) as u16
    }

    /// Zero the address payload, keeping kind and port.
    pub fn set_invalid_address(&mut self) {
        self.address = [0u8; LOCATOR_ADDRESS_LEN];
    }

    /// True if the address payload is all zeros.
    #[must_use]
    pub fn is_address_unset(&self) -> bool {
        self.address.iter().all(|b| *b == 0)
    }

    /// True unless kind is `Invalid` or `Reserved`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, LocatorKind::Invalid | LocatorKind::Reserved)
    }

    /// True for multicast UDP groups and multicast SHM locators.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        match self.kind {
            LocatorKind::UdpV4 | LocatorKind::TcpV4 => self.ipv4().is_multicast(),
            LocatorKind::UdpV6 | LocatorKind::TcpV6 => Ipv6Addr::from(self.address).is_multicast(),
            LocatorKind::Shm => self.address[0] == SHM_MULTICAST_FLAG,
            LocatorKind::Invalid | LocatorKind::Reserved => false,
        }
    }

    /// IPv4 address stored in the last 4 bytes.
    #[must_use]
    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.address[12],
            self.address[13],
            self.address[14],
            self.address[15],
        )
    }

    /// Store an IPv4 address in the last 4 bytes.
    pub fn set_ipv4(&mut self, addr: Ipv4Addr) {
        self.address = [0u8; LOCATOR_ADDRESS_LEN];
        self.address[12..16].copy_from_slice(&addr.octets());
    }

    /// Socket address for UDPv4 locators.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            LocatorKind::UdpV4 => Some(SocketAddr::V4(SocketAddrV4::new(
                self.ipv4(),
                self.physical_port(),
            ))),
            _ => None,
        }
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocatorKind::UdpV4 | LocatorKind::TcpV4 => {
                write!(f, "{}:[{}]:{}", self.kind, self.ipv4(), self.port)
            }
            LocatorKind::UdpV6 | LocatorKind::TcpV6 => {
                write!(f, "{}:[{}]:{}", self.kind, Ipv6Addr::from(self.address), self.port)
            }
            LocatorKind::Shm => {
                let flag = if self.is_multicast() { "M" } else { "U" };
                write!(f, "SHM:[{}]:{}", flag, self.port)
            }
            LocatorKind::Invalid | LocatorKind::Reserved => write!(f, "{}:{}", self.kind, self.port),
        }
    }
}
