//! Zenoh endpoint identifiers and roles.

use std::fmt;

use rand::Rng;

/// Maximum length of a ZenohID in bytes.
pub const ZID_LENGTH: usize = 16;

/// 16-byte identifier of a local or remote Zenoh endpoint, nonzero.
///
/// On the wire a ZenohID may be encoded with trailing zero bytes stripped;
/// in memory it is always the full 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZenohId([u8; ZID_LENGTH]);

impl ZenohId {
    /// Generate a fresh random id. Guaranteed nonzero.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; ZID_LENGTH];
            rng.fill(&mut bytes);
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Build an id from raw bytes. Returns `None` for the all-zero id.
    #[must_use]
    pub fn from_bytes(bytes: [u8; ZID_LENGTH]) -> Option<Self> {
        if bytes.iter().all(|b| *b == 0) {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Build an id from a wire slice of 1..=16 bytes, zero-padded on the right.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.is_empty() || slice.len() > ZID_LENGTH {
            return None;
        }
        let mut bytes = [0u8; ZID_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Self::from_bytes(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ZID_LENGTH] {
        &self.0
    }

    /// Number of significant bytes: full length minus trailing zeros,
    /// at least one. This drives the wire `zid_len` nibble.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        let trailing = self.0.iter().rev().take_while(|b| **b == 0).count();
        (ZID_LENGTH - trailing).max(1)
    }

    /// The significant prefix encoded on the wire.
    #[must_use]
    pub fn wire_bytes(&self) -> &[u8] {
        &self.0[..self.wire_len()]
    }
}

impl fmt::Display for ZenohId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().rev() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ZenohId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZenohId({self})")
    }
}

/// Role descriptor of a Zenoh endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhatAmI {
    Router,
    Peer,
    Client,
}

impl WhatAmI {
    /// Wire encoding used in Init/Join/Hello low bits.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Router => 0b00,
            Self::Peer => 0b01,
            Self::Client => 0b10,
        }
    }

    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value & 0b11 {
            0b00 => Some(Self::Router),
            0b01 => Some(Self::Peer),
            0b10 => Some(Self::Client),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Peer => "peer",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for WhatAmI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmap of WhatAmI interests, used by Scout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhatAmIMatcher(pub u8);

impl WhatAmIMatcher {
    pub const ROUTER: u8 = 0b001;
    pub const PEER: u8 = 0b010;
    pub const CLIENT: u8 = 0b100;

    #[must_use]
    pub const fn router_or_peer() -> Self {
        Self(Self::ROUTER | Self::PEER)
    }

    #[must_use]
    pub const fn matches(self, role: WhatAmI) -> bool {
        let bit = match role {
            WhatAmI::Router => Self::ROUTER,
            WhatAmI::Peer => Self::PEER,
            WhatAmI::Client => Self::CLIENT,
        };
        self.0 & bit != 0
    }
}

/// Session-local entity id, allocated per declaration.
pub type EntityId = u32;

/// Globally unique entity id: the owning endpoint plus its local entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityGlobalId {
    pub zid: ZenohId,
    pub eid: EntityId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_nonzero_and_distinct() {
        let a = ZenohId::random();
        let b = ZenohId::random();
        assert!(a.as_bytes().iter().any(|x| *x != 0));
        assert_ne!(a, b);
    }

    #[test]
    fn wire_len_strips_trailing_zeros() {
        let mut bytes = [0u8; ZID_LENGTH];
        bytes[0] = 0xAA;
        bytes[1] = 0xBB;
        let id = ZenohId::from_bytes(bytes).unwrap();
        assert_eq!(id.wire_len(), 2);
        assert_eq!(id.wire_bytes(), &[0xAA, 0xBB]);

        let full = ZenohId::from_bytes([0xFF; ZID_LENGTH]).unwrap();
        assert_eq!(full.wire_len(), ZID_LENGTH);
    }

    #[test]
    fn zero_id_rejected() {
        assert!(ZenohId::from_bytes([0u8; ZID_LENGTH]).is_none());
        assert!(ZenohId::from_slice(&[]).is_none());
    }

    #[test]
    fn whatami_wire_roundtrip() {
        for w in [WhatAmI::Router, WhatAmI::Peer, WhatAmI::Client] {
            assert_eq!(WhatAmI::from_wire(w.to_wire()), Some(w));
        }
        assert_eq!(WhatAmI::from_wire(0b11), None);
    }

    #[test]
    fn matcher_bits() {
        let m = WhatAmIMatcher::router_or_peer();
        assert!(m.matches(WhatAmI::Router));
        assert!(m.matches(WhatAmI::Peer));
        assert!(!m.matches(WhatAmI::Client));
    }
}
