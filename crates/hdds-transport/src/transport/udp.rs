// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDPv4 transport.
//!
//! Input channels bind `0.0.0.0:<port>` with `SO_REUSEADDR` and join the
//! group for multicast locators. A sender resource wraps one socket bound
//! to an ephemeral port, shared by every destination.

use super::channel::{ChannelRegistry, ChannelResource, MessageSource};
use super::{Result, SenderResource, TransportError, TransportInterface, TransportReceiver};
use crate::config::{UdpTransportDescriptor, MULTICAST_IP, RECEIVE_POLL_INTERVAL};
use crate::locator::{Locator, LocatorKind, LOCATOR_PORT_INVALID};
use crate::ports::PortParameters;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Largest UDP payload over IPv4
const MAX_UDP_PAYLOAD: u32 = 65_507;

/// Smallest socket timeout (zero means "block forever" to the OS)
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

/// Pooled UDP sending socket.
#[derive(Debug, Clone)]
pub struct UdpSenderResource {
    socket: Arc<UdpSocket>,
}

impl UdpSenderResource {
    fn new(descriptor: &UdpTransportDescriptor) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if descriptor.send_buffer_size > 0 {
            socket.set_send_buffer_size(descriptor.send_buffer_size as usize)?;
        }
        socket.set_multicast_ttl_v4(descriptor.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&bind.into())?;
        Ok(Self {
            socket: Arc::new(socket.into()),
        })
    }

    /// Local address of the sending socket.
    ///
    /// # Errors
    ///
    /// Propagates `getsockname` failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Receive side of a UDP input channel.
struct UdpSource {
    socket: UdpSocket,
    max_message_size: usize,
    released: AtomicBool,
}

impl MessageSource for UdpSource {
    fn receive(&self, buf: &mut Vec<u8>, timeout: Duration) -> Result<Option<Locator>> {
        if self.released.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))?;
        buf.resize(self.max_message_size, 0);
        match self.socket.recv_from(buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                let remote = match from {
                    SocketAddr::V4(a) => Locator::udp_v4(*a.ip(), u32::from(a.port())),
                    SocketAddr::V6(a) => Locator::udp_v6(*a.ip(), u32::from(a.port())),
                };
                Ok(Some(remote))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                buf.clear();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

/// Transport over UDP/IPv4.
pub struct UdpV4Transport {
    descriptor: UdpTransportDescriptor,
    initialized: bool,
    /// Registered input channels
    input_channels: ChannelRegistry,
}

impl std::fmt::Debug for UdpV4Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpV4Transport")
            .field("descriptor", &self.descriptor)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl UdpV4Transport {
    /// Uninitialized transport; call [`TransportInterface::init`] before use.
    #[must_use]
    pub fn new(descriptor: UdpTransportDescriptor) -> Self {
        Self {
            descriptor,
            initialized: false,
            input_channels: ChannelRegistry::new(),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn descriptor(&self) -> &UdpTransportDescriptor {
        &self.descriptor
    }

    /// Number of registered input channels.
    #[must_use]
    pub fn input_channel_count(&self) -> usize {
        self.input_channels.len()
    }

    fn check_ready(&self, locator: &Locator) -> Result<()> {
        if !self.is_locator_supported(locator) {
            return Err(TransportError::UnsupportedLocator(*locator));
        }
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        Ok(())
    }

    fn bind_input(&self, locator: &Locator, is_multicast: bool) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if self.descriptor.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(self.descriptor.receive_buffer_size as usize)?;
        }
        let bind = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            locator.physical_port(),
        ));
        socket.bind(&bind.into())?;
        if is_multicast {
            socket.join_multicast_v4(&locator.ipv4(), &Ipv4Addr::UNSPECIFIED)?;
            log::debug!("[UDP] joined {} on port {}", locator.ipv4(), locator.physical_port());
        }
        socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
        Ok(socket.into())
    }
}

impl TransportInterface for UdpV4Transport {
    fn kind(&self) -> LocatorKind {
        LocatorKind::UdpV4
    }

    fn init(&mut self) -> Result<()> {
        let max = self.descriptor.max_message_size;
        if max == 0 || max > MAX_UDP_PAYLOAD {
            let err = TransportError::InvalidConfig(format!(
                "max_message_size {max} outside 1..={MAX_UDP_PAYLOAD}"
            ));
            log::error!("[UDP] transport init failed: {}", err);
            return Err(err);
        }
        self.initialized = true;
        log::info!("[UDP] transport initialized");
        Ok(())
    }

    fn is_input_channel_open(&self, locator: &Locator) -> bool {
        if !self.is_locator_supported(locator) {
            return false;
        }
        self.input_channels.is_open(locator)
    }

    fn create_input_channel_resource(
        &self,
        locator: &Locator,
        is_multicast: bool,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<ChannelResource> {
        self.check_ready(locator)?;
        let max_message_size = max_message_size.min(self.descriptor.max_message_size);
        let socket = self.bind_input(locator, is_multicast)?;
        let source = UdpSource {
            socket,
            max_message_size: max_message_size as usize,
            released: AtomicBool::new(false),
        };
        ChannelResource::new(*locator, max_message_size, Arc::new(source), receiver)
    }

    fn open_input_channel(
        &self,
        locator: &Locator,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<()> {
        self.check_ready(locator)?;
        self.input_channels
            .open_with(locator, || {
                self.create_input_channel_resource(
                    locator,
                    locator.is_multicast(),
                    max_message_size,
                    receiver,
                )
            })
            .map_err(|e| {
                log::warn!("[UDP] cannot open input channel {}: {}", locator, e);
                e
            })
    }

    fn close_input_channel(&self, locator: &Locator) -> bool {
        self.input_channels.close(locator)
    }

    fn open_output_channel(
        &self,
        senders: &mut Vec<SenderResource>,
        locator: &Locator,
    ) -> Result<()> {
        self.check_ready(locator)?;
        if senders.iter().any(|s| s.kind() == LocatorKind::UdpV4) {
            return Ok(());
        }
        let sender = UdpSenderResource::new(&self.descriptor).map_err(|e| {
            log::warn!("[UDP] cannot create sender socket: {}", e);
            e
        })?;
        senders.push(SenderResource::Udp(sender));
        Ok(())
    }

    fn send(
        &self,
        sender: &SenderResource,
        buffer: &[u8],
        destination: &Locator,
        only_multicast_purpose: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.check_ready(destination)?;
        let sender = sender
            .as_udp()
            .ok_or(TransportError::InvalidSender(sender.kind()))?;
        let max = self.descriptor.max_message_size as usize;
        if buffer.len() > max {
            log::warn!(
                "[UDP] dropping {} byte message to {}: exceeds {}",
                buffer.len(),
                destination,
                max
            );
            return Err(TransportError::MessageTooLarge {
                size: buffer.len(),
                max,
            });
        }
        if only_multicast_purpose && !destination.is_multicast() {
            log::trace!("[UDP] skip unicast {} for multicast-only send", destination);
            return Ok(());
        }

        let addr = destination
            .to_socket_addr()
            .ok_or(TransportError::UnsupportedLocator(*destination))?;
        sender
            .socket
            .set_write_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))?;
        let sent = sender.socket.send_to(buffer, addr).map_err(|e| {
            log::debug!("[UDP] send to {} failed: {}", addr, e);
            e
        })?;
        if sent != buffer.len() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram: {sent} of {} bytes", buffer.len()),
            )));
        }
        Ok(())
    }

    fn max_message_size(&self) -> u32 {
        self.descriptor.max_message_size
    }

    fn max_initial_peers_range(&self) -> u32 {
        self.descriptor.max_initial_peers_range
    }

    /// Also fills the default RTPS multicast group when the address is unset.
    fn fill_metatraffic_multicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
    ) {
        if locator.port == LOCATOR_PORT_INVALID {
            locator.port = params.multicast_port(domain_id);
        }
        if locator.is_address_unset() {
            locator.set_ipv4(Ipv4Addr::from(MULTICAST_IP));
        }
    }

    fn shutdown(&self) {
        self.input_channels.shutdown();
    }
}

impl Drop for UdpV4Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_oversize_messages() {
        let mut udp = UdpV4Transport::new(UdpTransportDescriptor::default().with_max_message_size(70_000));
        assert!(matches!(udp.init(), Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_multicast_fill_sets_default_group() {
        let udp = UdpV4Transport::new(UdpTransportDescriptor::default());
        let mut loc = Locator::new(LocatorKind::UdpV4, 0, [0; 16]);
        udp.fill_metatraffic_multicast_locator(&mut loc, &PortParameters::default(), 0);
        assert_eq!(loc.port, 7400);
        assert_eq!(loc.ipv4(), Ipv4Addr::new(239, 255, 0, 1));

        let mut custom = Locator::udp_v4(Ipv4Addr::new(239, 1, 2, 3), 9000);
        udp.fill_metatraffic_multicast_locator(&mut custom, &PortParameters::default(), 0);
        assert_eq!(custom.port, 9000);
        assert_eq!(custom.ipv4(), Ipv4Addr::new(239, 1, 2, 3));
    }

    #[test]
    fn test_send_requires_init() {
        let udp = UdpV4Transport::new(UdpTransportDescriptor::default());
        let mut senders = Vec::new();
        let dest = Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411);
        assert!(matches!(
            udp.open_output_channel(&mut senders, &dest),
            Err(TransportError::NotInitialized)
        ));
    }
}
