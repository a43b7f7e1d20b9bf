// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS v2.5 Port Mapping
//!
//! Implements the OMG DDS-RTPS v2.5 well-known port formula (Sec.9.6.1.1):
//!
//! ```text
//! metatraffic multicast = PB + DG x domain + d0
//! metatraffic unicast   = PB + DG x domain + d1 + PG x participant
//! user multicast        = PB + DG x domain + d2
//! user unicast          = PB + DG x domain + d3 + PG x participant
//! ```

use crate::config::{
    DOMAIN_ID_GAIN, MAX_DOMAIN_ID, MAX_PARTICIPANT_ID, OFFSET_D0, OFFSET_D1, OFFSET_D2, OFFSET_D3,
    PARTICIPANT_ID_GAIN, PORT_BASE,
};
use crate::transport::TransportError;

/// Parameters of the well-known port formula.
///
/// Supplied by the participant layer; transports only evaluate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortParameters {
    /// Port base (PB)
    pub port_base: u32,
    /// Domain ID gain (DG)
    pub domain_id_gain: u32,
    /// Participant ID gain (PG)
    pub participant_id_gain: u32,
    /// Metatraffic multicast offset
    pub offset_d0: u32,
    /// Metatraffic unicast offset
    pub offset_d1: u32,
    /// User data multicast offset
    pub offset_d2: u32,
    /// User data unicast offset
    pub offset_d3: u32,
}

impl Default for PortParameters {
    fn default() -> Self {
        Self {
            port_base: PORT_BASE,
            domain_id_gain: DOMAIN_ID_GAIN,
            participant_id_gain: PARTICIPANT_ID_GAIN,
            offset_d0: OFFSET_D0,
            offset_d1: OFFSET_D1,
            offset_d2: OFFSET_D2,
            offset_d3: OFFSET_D3,
        }
    }
}

impl PortParameters {
    fn domain_base(&self, domain_id: u32) -> u32 {
        self.port_base
            .wrapping_add(self.domain_id_gain.wrapping_mul(domain_id))
    }

    /// Metatraffic (discovery) multicast port.
    #[must_use]
    pub fn multicast_port(&self, domain_id: u32) -> u32 {
        self.domain_base(domain_id).wrapping_add(self.offset_d0)
    }

    /// Metatraffic (discovery) unicast port.
    #[must_use]
    pub fn unicast_port(&self, domain_id: u32, participant_id: u32) -> u32 {
        self.domain_base(domain_id)
            .wrapping_add(self.offset_d1)
            .wrapping_add(self.participant_id_gain.wrapping_mul(participant_id))
    }

    /// User data multicast port.
    #[must_use]
    pub fn user_multicast_port(&self, domain_id: u32) -> u32 {
        self.domain_base(domain_id).wrapping_add(self.offset_d2)
    }

    /// User data unicast port.
    #[must_use]
    pub fn user_unicast_port(&self, domain_id: u32, participant_id: u32) -> u32 {
        self.domain_base(domain_id)
            .wrapping_add(self.offset_d3)
            .wrapping_add(self.participant_id_gain.wrapping_mul(participant_id))
    }

    /// Validated port set for one participant.
    pub fn mapping(&self, domain_id: u32, participant_id: u32) -> Result<PortMapping, TransportError> {
        if domain_id > MAX_DOMAIN_ID {
            return Err(TransportError::InvalidDomainId(domain_id));
        }
        if participant_id > MAX_PARTICIPANT_ID {
            return Err(TransportError::InvalidParticipantId(participant_id));
        }

        let mapping = PortMapping {
            metatraffic_multicast: self.multicast_port(domain_id),
            metatraffic_unicast: self.unicast_port(domain_id, participant_id),
            user_multicast: self.user_multicast_port(domain_id),
            user_unicast: self.user_unicast_port(domain_id, participant_id),
        };

        // Custom gains can push ports past the u16 range
        if mapping.max_port() > u32::from(u16::MAX) {
            return Err(TransportError::PortOutOfRange(mapping.max_port()));
        }
        Ok(mapping)
    }
}

/// Port set for a participant in a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Multicast port for SPDP discovery
    pub metatraffic_multicast: u32,
    /// Unicast port for metatraffic
    pub metatraffic_unicast: u32,
    /// Multicast port for user data
    pub user_multicast: u32,
    /// Unicast port for user data
    pub user_unicast: u32,
}

impl PortMapping {
    fn max_port(&self) -> u32 {
        self.metatraffic_multicast
            .max(self.metatraffic_unicast)
            .max(self.user_multicast)
            .max(self.user_unicast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_calculation_domain_0() {
        let params = PortParameters::default();
        let p0 = params
            .mapping(0, 0)
            .expect("port calculation should succeed for domain 0, participant 0");
        assert_eq!(p0.metatraffic_multicast, 7400);
        assert_eq!(p0.metatraffic_unicast, 7410);
        assert_eq!(p0.user_multicast, 7401);
        assert_eq!(p0.user_unicast, 7411);

        let p1 = params
            .mapping(0, 1)
            .expect("port calculation should succeed for domain 0, participant 1");
        assert_eq!(p1.metatraffic_multicast, 7400);
        assert_eq!(p1.metatraffic_unicast, 7412);
        assert_eq!(p1.user_unicast, 7413);
    }

    #[test]
    fn test_port_calculation_domain_1() {
        let params = PortParameters::default();
        let p0 = params
            .mapping(1, 0)
            .expect("port calculation should succeed for domain 1, participant 0");
        assert_eq!(p0.metatraffic_multicast, 7650);
        assert_eq!(p0.metatraffic_unicast, 7660);
        assert_eq!(p0.user_unicast, 7661);
    }

    #[test]
    fn test_invalid_domain_id() {
        let result = PortParameters::default().mapping(233, 0);
        assert!(matches!(result, Err(TransportError::InvalidDomainId(233))));
    }

    #[test]
    fn test_invalid_participant_id() {
        let result = PortParameters::default().mapping(0, 120);
        assert!(matches!(result, Err(TransportError::InvalidParticipantId(120))));
    }

    #[test]
    fn test_custom_gain_overflow_rejected() {
        let params = PortParameters {
            domain_id_gain: 1000,
            ..PortParameters::default()
        };
        assert!(matches!(
            params.mapping(200, 0),
            Err(TransportError::PortOutOfRange(_))
        ));
    }

    #[test]
    fn test_unicast_port_steps_by_participant_gain() {
        let params = PortParameters::default();
        let ports: Vec<u32> = (0..3).map(|i| params.unicast_port(0, i)).collect();
        assert_eq!(ports, vec![7410, 7412, 7414]);
    }
}
