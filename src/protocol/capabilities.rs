//! Capabilities exchanged during negotiation.
//!
//! The client offers a dialect list and capability bits in the negotiate
//! request; the server answers with the dialect it picked and its own bits.
//! Both sides then work from the intersection.

use serde::{Deserialize, Serialize};

use super::frame::MAX_PREFIX_LENGTH;

/// Dialect 2.1 (no extended security blobs)
pub const DIALECT_2_1: u16 = 0x0210;
/// Dialect 3.0
pub const DIALECT_3_0: u16 = 0x0300;
/// Dialect 3.1
pub const DIALECT_3_1: u16 = 0x0311;

/// Dialects this implementation speaks, most preferred first
pub const SUPPORTED_DIALECTS: [u16; 3] = [DIALECT_3_1, DIALECT_3_0, DIALECT_2_1];

/// Capability bitmask (32 bits)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags(u32);

#[allow(missing_docs)]
impl CapabilityFlags {
    /// Authentication uses negotiate/challenge/authenticate blobs
    pub const EXTENDED_SECURITY: u32 = 1 << 0;
    /// Keyed (HMAC) challenge response instead of the legacy hash
    pub const KEYED_RESPONSE: u32 = 1 << 1;
    /// Frames larger than the default maximum
    pub const LARGE_FRAMES: u32 = 1 << 2;
    /// Server may send unsolicited notifications
    pub const NOTIFICATIONS: u32 = 1 << 3;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn with(mut self, flag: u32) -> Self {
        self.0 |= flag;
        self
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Bits both sides advertise.
    pub fn intersect(&self, other: &CapabilityFlags) -> CapabilityFlags {
        Self(self.0 & other.0)
    }
}

/// Signing policy advertised by one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMode {
    /// Willing to sign
    pub signing_enabled: bool,
    /// Insists on signing
    pub signing_required: bool,
}

impl SecurityMode {
    const ENABLED: u8 = 0x01;
    const REQUIRED: u8 = 0x02;

    /// Willing but not insisting
    pub fn enabled() -> Self {
        Self {
            signing_enabled: true,
            signing_required: false,
        }
    }

    /// Insisting on signing
    pub fn required() -> Self {
        Self {
            signing_enabled: true,
            signing_required: true,
        }
    }

    /// Decode from the wire byte
    pub fn from_byte(b: u8) -> Self {
        Self {
            signing_enabled: b & (Self::ENABLED | Self::REQUIRED) != 0,
            signing_required: b & Self::REQUIRED != 0,
        }
    }

    /// Encode to the wire byte
    pub fn as_byte(&self) -> u8 {
        let mut b = 0;
        if self.signing_enabled {
            b |= Self::ENABLED;
        }
        if self.signing_required {
            b |= Self::REQUIRED;
        }
        b
    }
}

/// One side's advertised capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Dialects in preference order (server side: the one it speaks)
    pub dialects: Vec<u16>,
    /// Capability bits
    pub flags: CapabilityFlags,
    /// Signing policy
    pub security: SecurityMode,
    /// Largest frame body this side accepts
    pub max_frame_size: u32,
    /// Largest number of requests this side allows in flight
    pub max_in_flight: u16,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            dialects: SUPPORTED_DIALECTS.to_vec(),
            flags: CapabilityFlags::new()
                .with(CapabilityFlags::EXTENDED_SECURITY)
                .with(CapabilityFlags::KEYED_RESPONSE)
                .with(CapabilityFlags::LARGE_FRAMES)
                .with(CapabilityFlags::NOTIFICATIONS),
            security: SecurityMode::enabled(),
            max_frame_size: crate::protocol::DEFAULT_MAX_FRAME_SIZE as u32,
            max_in_flight: 50,
        }
    }
}

impl Capabilities {
    /// Set the dialect list
    pub fn with_dialects(mut self, dialects: Vec<u16>) -> Self {
        self.dialects = dialects;
        self
    }

    /// Replace capability bits
    pub fn with_flags(mut self, flags: CapabilityFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace signing policy
    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Set frame and in-flight limits. The frame limit is capped at what a
    /// length prefix can carry.
    pub fn with_limits(mut self, max_frame_size: u32, max_in_flight: u16) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_PREFIX_LENGTH as u32);
        self.max_in_flight = max_in_flight;
        self
    }

    /// Advertised frame limit, capped at the largest prefix length
    pub fn frame_limit(&self) -> usize {
        (self.max_frame_size as usize).min(MAX_PREFIX_LENGTH)
    }

    /// Check if dialect is offered
    pub fn supports(&self, dialect: u16) -> bool {
        self.dialects.contains(&dialect)
    }

    /// Pick the first dialect in our preference order the peer also offers.
    pub fn select_dialect(&self, peer: &Capabilities) -> Option<u16> {
        self.dialects.iter().copied().find(|d| peer.supports(*d))
    }

    /// Negotiate with the peer's advertisement
    pub fn negotiate(&self, peer: &Capabilities) -> Option<NegotiatedCaps> {
        let dialect = self.select_dialect(peer)?;
        let mut flags = self.flags.intersect(&peer.flags);

        // Blob-based authentication arrived with 3.0
        if dialect < DIALECT_3_0 {
            flags = CapabilityFlags::from_bits(
                flags.bits()
                    & !(CapabilityFlags::EXTENDED_SECURITY | CapabilityFlags::KEYED_RESPONSE),
            );
        }

        let signing_required = self.security.signing_required || peer.security.signing_required;
        if signing_required && !(self.security.signing_enabled && peer.security.signing_enabled) {
            return None;
        }

        Some(NegotiatedCaps {
            dialect,
            flags,
            signing: signing_required,
            max_frame_size: self.frame_limit().min(peer.frame_limit()),
            max_in_flight: usize::from(self.max_in_flight.min(peer.max_in_flight).max(1)),
        })
    }
}

/// Result of capability negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCaps {
    /// Agreed dialect
    pub dialect: u16,
    /// Capability bits both sides share
    pub flags: CapabilityFlags,
    /// Either side requires signing
    pub signing: bool,
    /// Smaller of the two frame limits
    pub max_frame_size: usize,
    /// Smaller of the two in-flight limits
    pub max_in_flight: usize,
}

impl NegotiatedCaps {
    /// Authentication goes through negotiate/challenge/authenticate blobs
    pub fn extended_security(&self) -> bool {
        self.flags.has(CapabilityFlags::EXTENDED_SECURITY)
    }

    /// Challenge response uses the keyed variant
    pub fn keyed_response(&self) -> bool {
        self.flags.has(CapabilityFlags::KEYED_RESPONSE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_negotiation() {
        let client = Capabilities::default();
        let server = Capabilities::default().with_dialects(vec![DIALECT_3_0, DIALECT_2_1]);

        // First common dialect in the client's preference order
        assert_eq!(client.select_dialect(&server), Some(DIALECT_3_0));
    }

    #[test]
    fn test_no_common_dialect() {
        let client = Capabilities::default().with_dialects(vec![DIALECT_3_1]);
        let server = Capabilities::default().with_dialects(vec![DIALECT_2_1]);
        assert!(client.negotiate(&server).is_none());
    }

    #[test]
    fn test_legacy_dialect_drops_extended_security() {
        let client = Capabilities::default();
        let server = Capabilities::default().with_dialects(vec![DIALECT_2_1]);

        let negotiated = client.negotiate(&server).unwrap();
        assert_eq!(negotiated.dialect, DIALECT_2_1);
        assert!(!negotiated.extended_security());
        assert!(!negotiated.keyed_response());
        assert!(negotiated.flags.has(CapabilityFlags::LARGE_FRAMES));
    }

    #[test]
    fn test_limits_take_minimum() {
        let client = Capabilities::default().with_limits(1 << 20, 64);
        let server = Capabilities::default().with_limits(1 << 16, 8);

        let negotiated = client.negotiate(&server).unwrap();
        assert_eq!(negotiated.max_frame_size, 1 << 16);
        assert_eq!(negotiated.max_in_flight, 8);
    }

    #[test]
    fn test_frame_limit_fits_prefix() {
        let capped = Capabilities::default().with_limits(u32::MAX, 8);
        assert_eq!(capped.max_frame_size as usize, MAX_PREFIX_LENGTH);

        // A peer advertising more than 24 bits is clamped during negotiation
        let mut peer = Capabilities::default();
        peer.max_frame_size = 0x0100_0010;
        let negotiated = capped.negotiate(&peer).unwrap();
        assert_eq!(negotiated.max_frame_size, MAX_PREFIX_LENGTH);
    }

    #[test]
    fn test_signing_requirement() {
        let client = Capabilities::default();
        let server = Capabilities::default().with_security(SecurityMode::required());
        assert!(client.negotiate(&server).unwrap().signing);

        let unwilling = Capabilities::default().with_security(SecurityMode::default());
        assert!(unwilling.negotiate(&server).is_none());
    }

    #[test]
    fn test_security_mode_byte() {
        for mode in [
            SecurityMode::default(),
            SecurityMode::enabled(),
            SecurityMode::required(),
        ] {
            assert_eq!(SecurityMode::from_byte(mode.as_byte()), mode);
        }
    }
}
