// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory transport.
//!
//! Input channels own a port segment named after their locator's physical
//! port; every sender resource wraps one [`PortWriter`] able to reach any
//! port on the host.
//!
//! # Example
//!
//! ```no_run
//! use hdds_transport::config::SharedMemTransportDescriptor;
//! use hdds_transport::transport::{SharedMemTransport, TransportInterface};
//! use hdds_transport::Locator;
//! use std::sync::Arc;
//!
//! let mut shm = SharedMemTransport::new(SharedMemTransportDescriptor::default());
//! shm.init().expect("shared memory available");
//!
//! let local = Locator::shm(7411);
//! shm.open_input_channel(&local, 65_500, Arc::new(|data: &[u8], _: &Locator, _: &Locator| {
//!     println!("received {} bytes", data.len());
//! }))
//! .expect("open input channel");
//! ```

use super::channel::{ChannelRegistry, ChannelResource, MessageSource};
use super::{Result, SenderResource, TransportError, TransportInterface, TransportReceiver};
use crate::config::SharedMemTransportDescriptor;
use crate::locator::{Locator, LocatorKind};
use crate::shm::{PortReader, PortWriter, SharedMem, SharedMemConfig, ShmMetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;

/// Pooled handle writing into shared-memory ports.
#[derive(Debug, Clone)]
pub struct SharedMemSenderResource {
    writer: Arc<PortWriter>,
}

impl SharedMemSenderResource {
    /// Underlying port writer.
    #[must_use]
    pub fn writer(&self) -> &PortWriter {
        &self.writer
    }
}

impl MessageSource for PortReader {
    /// Shared-memory messages carry no origin; the remote locator is
    /// `SHM:[U]:0`.
    fn receive(&self, buf: &mut Vec<u8>, timeout: Duration) -> Result<Option<Locator>> {
        match PortReader::receive(self, buf, timeout)? {
            true => Ok(Some(Locator::shm(0))),
            false => Ok(None),
        }
    }

    fn release(&self) {
        PortReader::release(self);
    }
}

/// Transport over intra-host shared-memory ports.
pub struct SharedMemTransport {
    descriptor: SharedMemTransportDescriptor,
    shared_mem: Option<SharedMem>,
    /// Registered input channels
    input_channels: ChannelRegistry,
}

impl std::fmt::Debug for SharedMemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemTransport")
            .field("descriptor", &self.descriptor)
            .field("initialized", &self.shared_mem.is_some())
            .finish()
    }
}

impl SharedMemTransport {
    /// Uninitialized transport; call [`TransportInterface::init`] before use.
    #[must_use]
    pub fn new(descriptor: SharedMemTransportDescriptor) -> Self {
        Self {
            descriptor,
            shared_mem: None,
            input_channels: ChannelRegistry::new(),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn descriptor(&self) -> &SharedMemTransportDescriptor {
        &self.descriptor
    }

    /// Counters, once initialized.
    #[must_use]
    pub fn metrics(&self) -> Option<ShmMetricsSnapshot> {
        self.shared_mem.as_ref().map(|shm| shm.metrics().snapshot())
    }

    /// Number of registered input channels.
    #[must_use]
    pub fn input_channel_count(&self) -> usize {
        self.input_channels.len()
    }

    fn shared_mem(&self) -> Result<&SharedMem> {
        self.shared_mem.as_ref().ok_or(TransportError::NotInitialized)
    }

    fn check_supported(&self, locator: &Locator) -> Result<()> {
        if self.is_locator_supported(locator) {
            Ok(())
        } else {
            Err(TransportError::UnsupportedLocator(*locator))
        }
    }
}

impl TransportInterface for SharedMemTransport {
    fn kind(&self) -> LocatorKind {
        LocatorKind::Shm
    }

    fn init(&mut self) -> Result<()> {
        if self.descriptor.port_queue_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "port_queue_capacity must be > 0".into(),
            ));
        }
        if self.descriptor.max_message_size == 0 {
            return Err(TransportError::InvalidConfig(
                "max_message_size must be > 0".into(),
            ));
        }
        match SharedMem::new(SharedMemConfig::from(&self.descriptor)) {
            Ok(shm) => {
                self.shared_mem = Some(shm);
                log::info!("[SHM] transport initialized");
                Ok(())
            }
            Err(e) => {
                log::error!("[SHM] transport init failed: {}", e);
                Err(e.into())
            }
        }
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
        self.check_supported(locator)?;
        let shm = self.shared_mem()?;
        if is_multicast != locator.is_multicast() {
            // The segment layout follows the locator kind
            log::debug!(
                "[SHM] {} opened as {}; using the locator's kind",
                locator,
                if is_multicast { "multicast" } else { "unicast" }
            );
        }
        let reader = shm.create_reader(locator, max_message_size)?;
        let max_message_size = max_message_size.min(self.descriptor.max_message_size);
        ChannelResource::new(*locator, max_message_size, Arc::new(reader), receiver)
    }

    fn open_input_channel(
        &self,
        locator: &Locator,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<()> {
        self.check_supported(locator)?;
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
                log::warn!("[SHM] cannot open input channel {}: {}", locator, e);
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
        self.check_supported(locator)?;
        if senders.iter().any(|s| s.kind() == LocatorKind::Shm) {
            return Ok(());
        }
        let writer = self.shared_mem()?.create_writer();
        senders.push(SenderResource::SharedMem(SharedMemSenderResource {
            writer: Arc::new(writer),
        }));
        Ok(())
    }

    fn send(
        &self,
        sender: &SenderResource,
        buffer: &[u8],
        destination: &Locator,
        _only_multicast_purpose: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.check_supported(destination)?;
        let sender = sender
            .as_shared_mem()
            .ok_or(TransportError::InvalidSender(sender.kind()))?;
        let max = self.descriptor.max_message_size as usize;
        if buffer.len() > max {
            log::warn!(
                "[SHM] dropping {} byte message to {}: exceeds {}",
                buffer.len(),
                destination,
                max
            );
            return Err(TransportError::MessageTooLarge {
                size: buffer.len(),
                max,
            });
        }
        sender
            .writer
            .write(buffer, destination, timeout)
            .map_err(|e| {
                log::debug!("[SHM] send to {} failed: {}", destination, e);
                e.into()
            })
    }

    fn max_message_size(&self) -> u32 {
        self.descriptor.max_message_size
    }

    fn max_initial_peers_range(&self) -> u32 {
        self.descriptor.max_initial_peers_range
    }

    fn shutdown(&self) {
        self.input_channels.shutdown();
    }
}

impl Drop for SharedMemTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
