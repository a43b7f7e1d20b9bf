// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of transports used by a participant.
//!
//! [`NetworkFactory`] owns one initialized transport per locator kind and
//! routes every locator-level request to the transport that supports it.
//!
//! # Send path
//!
//! ```text
//! selector.reset / enable        (participant layer)
//! factory.select_locators(sel)   one pass per transport
//! factory.send(senders, buf, sel)
//!     for each chosen locator -> owning transport -> pooled sender of its kind
//! ```

use crate::locator::{Locator, LocatorKind};
use crate::ports::PortParameters;
use crate::selector::LocatorSelector;
use crate::transport::{Result, SenderResource, TransportError, TransportInterface, TransportReceiver};
use std::sync::Arc;
use std::time::Duration;

/// Transport registry of one participant.
#[derive(Default)]
pub struct NetworkFactory {
    transports: Vec<Box<dyn TransportInterface>>,
}

impl std::fmt::Debug for NetworkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<LocatorKind> = self.transports.iter().map(|t| t.kind()).collect();
        f.debug_struct("NetworkFactory").field("transports", &kinds).finish()
    }
}

impl NetworkFactory {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize `transport` and register it.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a transport of the same kind is registered, or the
    /// `init` error (the transport is dropped).
    pub fn register_transport(&mut self, mut transport: Box<dyn TransportInterface>) -> Result<()> {
        let kind = transport.kind();
        if self.transports.iter().any(|t| t.kind() == kind) {
            return Err(TransportError::InvalidConfig(format!(
                "a {kind} transport is already registered"
            )));
        }
        if let Err(e) = transport.init() {
            log::error!("[NET] {} transport rejected: {}", kind, e);
            return Err(e);
        }
        log::info!("[NET] registered {} transport", kind);
        self.transports.push(transport);
        Ok(())
    }

    /// Number of registered transports.
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    fn owner(&self, locator: &Locator) -> Option<&dyn TransportInterface> {
        self.transports
            .iter()
            .find(|t| t.is_locator_supported(locator))
            .map(|t| t.as_ref())
    }

    /// True if some registered transport handles `locator`.
    #[must_use]
    pub fn is_locator_supported(&self, locator: &Locator) -> bool {
        self.owner(locator).is_some()
    }

    /// Open the input channel for `locator`. Returns `false` if no transport
    /// supports it or opening failed (logged).
    pub fn build_receiver_resources(
        &self,
        locator: &Locator,
        max_message_size: u32,
        receiver: Arc<dyn TransportReceiver>,
    ) -> bool {
        let Some(transport) = self.owner(locator) else {
            log::debug!("[NET] no transport for input locator {}", locator);
            return false;
        };
        match transport.open_input_channel(locator, max_message_size, receiver) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[NET] input channel {} not opened: {}", locator, e);
                false
            }
        }
    }

    /// Close the input channel for `locator`. Returns `false` if none was open.
    pub fn close_receiver_resources(&self, locator: &Locator) -> bool {
        self.owner(locator)
            .is_some_and(|t| t.close_input_channel(locator))
    }

    /// Make sure `senders` can reach `locator`. Returns `false` if no
    /// transport supports it or sender creation failed (logged).
    pub fn build_send_resources(&self, senders: &mut Vec<SenderResource>, locator: &Locator) -> bool {
        let Some(transport) = self.owner(locator) else {
            return false;
        };
        match transport.open_output_channel(senders, locator) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[NET] sender for {} not created: {}", locator, e);
                false
            }
        }
    }

    /// Start a new selection and let every transport choose its locators.
    pub fn select_locators(&self, selector: &mut LocatorSelector) {
        selector.selection_start();
        for transport in &self.transports {
            transport.select_locators(selector);
        }
    }

    /// Send `buffer` to every locator chosen in `selector`.
    ///
    /// Returns how many locators were written. Individual failures are
    /// logged; the first one is returned only if nothing was delivered.
    ///
    /// # Errors
    ///
    /// The first per-locator error when no locator was reached.
    pub fn send(
        &self,
        senders: &[SenderResource],
        buffer: &[u8],
        selector: &LocatorSelector,
        timeout: Duration,
    ) -> Result<usize> {
        let mut delivered = 0;
        let mut first_err = None;

        for locator in selector.selected_locators() {
            match self.send_to(senders, buffer, &locator, timeout) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::debug!("[NET] send to {} failed: {}", locator, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    /// Send `buffer` to one locator through the pooled sender of its kind.
    ///
    /// # Errors
    ///
    /// `UnsupportedLocator` if no transport or sender matches, else the
    /// transport's send error.
    pub fn send_to(
        &self,
        senders: &[SenderResource],
        buffer: &[u8],
        locator: &Locator,
        timeout: Duration,
    ) -> Result<()> {
        let transport = self
            .owner(locator)
            .ok_or(TransportError::UnsupportedLocator(*locator))?;
        let sender = senders
            .iter()
            .find(|s| s.kind() == transport.kind())
            .ok_or(TransportError::UnsupportedLocator(*locator))?;
        transport.send(sender, buffer, locator, false, timeout)
    }

    /// Locator to use for reaching `remote`, from the first transport
    /// accepting it.
    #[must_use]
    pub fn transform_remote_locator(&self, remote: &Locator) -> Option<Locator> {
        self.transports
            .iter()
            .find_map(|t| t.transform_remote_locator(remote))
    }

    /// Local counterpart of `remote`; invalid if unsupported.
    #[must_use]
    pub fn remote_to_main_local(&self, remote: &Locator) -> Locator {
        self.owner(remote)
            .map_or_else(Locator::invalid, |t| t.remote_to_main_local(remote))
    }

    /// Complete a metatraffic multicast locator. `false` if unsupported.
    pub fn fill_default_metatraffic_multicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
    ) -> bool {
        let Some(transport) = self.owner(locator) else {
            return false;
        };
        transport.fill_metatraffic_multicast_locator(locator, params, domain_id);
        true
    }

    /// Complete a metatraffic unicast locator. `false` if unsupported.
    pub fn fill_default_metatraffic_unicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
        participant_id: u32,
    ) -> bool {
        let Some(transport) = self.owner(locator) else {
            return false;
        };
        transport.fill_metatraffic_unicast_locator(locator, params, domain_id, participant_id);
        true
    }

    /// Complete a user data unicast locator. `false` if unsupported.
    pub fn fill_default_unicast_locator(
        &self,
        locator: &mut Locator,
        params: &PortParameters,
        domain_id: u32,
        participant_id: u32,
    ) -> bool {
        let Some(transport) = self.owner(locator) else {
            return false;
        };
        transport.fill_unicast_locator(locator, params, domain_id, participant_id);
        true
    }

    /// Expand an initial peer into `out`. `false` if unsupported.
    pub fn configure_initial_peer_locator(
        &self,
        locator: &Locator,
        params: &PortParameters,
        domain_id: u32,
        out: &mut Vec<Locator>,
    ) -> bool {
        let Some(transport) = self.owner(locator) else {
            return false;
        };
        transport.configure_initial_peer_locator(locator, params, domain_id, out);
        true
    }

    /// Smallest `max_message_size` across transports (0 when empty).
    #[must_use]
    pub fn max_message_size(&self) -> u32 {
        self.transports
            .iter()
            .map(|t| t.max_message_size())
            .min()
            .unwrap_or(0)
    }

    /// Close every input channel of every transport.
    pub fn shutdown(&self) {
        for transport in &self.transports {
            transport.shutdown();
        }
        log::debug!("[NET] shutdown complete");
    }
}
