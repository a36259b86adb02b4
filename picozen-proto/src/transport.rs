//! Transport and scouting message types: the session-management half of
//! the protocol.
//!
//! Init and Open ack-ness is carried in the variant (`InitSyn` vs
//! `InitAck`), not in a stored flag byte, so impossible flag
//! combinations are unrepresentable.

use bytes::Bytes;
use picozen_core::id::{WhatAmI, WhatAmIMatcher, ZenohId};
use picozen_core::locator::Locator;
use smallvec::SmallVec;

use crate::network::NetworkMessage;

/// Message list of one Frame; almost always a single message.
pub type FrameMessages = SmallVec<[NetworkMessage; 1]>;

/// Protocol version spoken by this implementation.
pub const PROTO_VERSION: u8 = 0x06;

/// Default sequence-number resolution exponent: sn live in Z/2^28.
pub const SN_RESOLUTION_EXP_DEFAULT: u8 = 28;

/// Maximum on-wire length of one serialized transport message.
pub const BATCH_SIZE_MAX: u16 = u16::MAX;

/// Bytes reserved for a fragment header when budgeting fragment payloads.
pub const FRAGMENT_HEADER_SIZE: usize = 12;

/// Upper bound on the reassembled size of a fragmented message.
pub const FRAG_MAX_SIZE: usize = 300_000;

/// Transport message ids (low 5 bits of the header).
pub mod mid {
    pub const OAM: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const OPEN: u8 = 0x02;
    pub const CLOSE: u8 = 0x03;
    pub const KEEP_ALIVE: u8 = 0x04;
    pub const FRAME: u8 = 0x05;
    pub const FRAGMENT: u8 = 0x06;
    pub const JOIN: u8 = 0x07;
    // Scouting shares the id space on its own channel
    pub const SCOUT: u8 = 0x01;
    pub const HELLO: u8 = 0x02;
}

/// Transport message flags (high 3 bits of the header).
pub mod flag {
    /// Extensions follow.
    pub const Z: u8 = 0x80;
    /// Init/Open: message is an acknowledgment.
    pub const A: u8 = 0x20;
    /// Init/Join: size parameters present.
    pub const S: u8 = 0x40;
    /// Open/Join: lease is in seconds, not milliseconds.
    pub const T: u8 = 0x20;
    /// Join uses bit 0x20 for T; Open uses 0x40.
    pub const T_OPEN: u8 = 0x40;
    /// Frame/Fragment: reliable channel.
    pub const R: u8 = 0x20;
    /// Fragment: more fragments follow.
    pub const M: u8 = 0x40;
    /// Close: whole-session close rather than link-only.
    pub const S_CLOSE: u8 = 0x20;
    /// Scout: ZenohID present.
    pub const I: u8 = 0x08;
    /// Hello: locator list present.
    pub const L: u8 = 0x20;
}

/// Close reasons carried by a Close message.
pub mod close_reason {
    pub const GENERIC: u8 = 0x00;
    pub const UNSUPPORTED: u8 = 0x01;
    pub const INVALID: u8 = 0x02;
    pub const MAX_TRANSPORTS: u8 = 0x03;
    pub const MAX_LINKS: u8 = 0x04;
    pub const EXPIRED: u8 = 0x05;
}

/// Sequence-number resolution: sn arithmetic happens in Z/2^exp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnResolution(pub u8);

impl Default for SnResolution {
    fn default() -> Self {
        Self(SN_RESOLUTION_EXP_DEFAULT)
    }
}

impl SnResolution {
    /// The modulus `2^exp`.
    #[must_use]
    pub fn modulus(self) -> u64 {
        1u64 << u32::from(self.0.min(63))
    }

    /// Mask selecting valid sequence numbers.
    #[must_use]
    pub fn mask(self) -> u64 {
        self.modulus() - 1
    }
}

/// Negotiable size parameters exchanged in Init and Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeParams {
    pub sn_resolution: SnResolution,
    pub batch_size: u16,
}

impl Default for SizeParams {
    fn default() -> Self {
        Self {
            sn_resolution: SnResolution::default(),
            batch_size: BATCH_SIZE_MAX,
        }
    }
}

impl SizeParams {
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// One (reliable, best-effort) initial-sn pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnPair {
    pub reliable: u64,
    pub best_effort: u64,
}

/// Initial sequence numbers advertised by a Join: one pair, or eight
/// when the sender shapes traffic into priority conduits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConduitSnList {
    Plain(SnPair),
    Qos([SnPair; 8]),
}

impl ConduitSnList {
    /// The pair actually used by this implementation: the plain one, or
    /// the first priority conduit.
    #[must_use]
    pub fn plain(&self) -> SnPair {
        match self {
            Self::Plain(p) => *p,
            Self::Qos(ps) => ps[0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scout {
    pub version: u8,
    pub what: WhatAmIMatcher,
    pub zid: Option<ZenohId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: ZenohId,
    pub locators: Vec<Locator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: ZenohId,
    pub lease_ms: u64,
    pub size_params: SizeParams,
    pub next_sn: ConduitSnList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSyn {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: ZenohId,
    pub size_params: SizeParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitAck {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: ZenohId,
    pub size_params: SizeParams,
    pub cookie: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSyn {
    pub lease_ms: u64,
    pub initial_sn: u64,
    pub cookie: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAck {
    pub lease_ms: u64,
    pub initial_sn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    pub reason: u8,
    /// Whole-session close; clear means link-only.
    pub session: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sn: u64,
    pub reliable: bool,
    pub messages: FrameMessages,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sn: u64,
    pub reliable: bool,
    pub more: bool,
    pub payload: Bytes,
}

/// Messages exchanged on the scouting channel. They reuse the low mid
/// values of Init/Open, so they decode through their own entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoutingMessage {
    Scout(Scout),
    Hello(Hello),
}

impl ScoutingMessage {
    #[must_use]
    pub fn make_scout(what: WhatAmIMatcher, zid: Option<ZenohId>) -> Self {
        Self::Scout(Scout {
            version: PROTO_VERSION,
            what,
            zid,
        })
    }

    #[must_use]
    pub fn make_hello(whatami: WhatAmI, zid: ZenohId, locators: Vec<Locator>) -> Self {
        Self::Hello(Hello {
            version: PROTO_VERSION,
            whatami,
            zid,
            locators,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Join(Join),
    InitSyn(InitSyn),
    InitAck(InitAck),
    OpenSyn(OpenSyn),
    OpenAck(OpenAck),
    Close(Close),
    KeepAlive,
    Frame(Frame),
    Fragment(Fragment),
}

impl TransportMessage {
    #[must_use]
    pub fn make_join(
        whatami: WhatAmI,
        zid: ZenohId,
        lease_ms: u64,
        size_params: SizeParams,
        next_sn: ConduitSnList,
    ) -> Self {
        Self::Join(Join {
            version: PROTO_VERSION,
            whatami,
            zid,
            lease_ms,
            size_params,
            next_sn,
        })
    }

    #[must_use]
    pub fn make_init_syn(whatami: WhatAmI, zid: ZenohId, size_params: SizeParams) -> Self {
        Self::InitSyn(InitSyn {
            version: PROTO_VERSION,
            whatami,
            zid,
            size_params,
        })
    }

    #[must_use]
    pub fn make_init_ack(
        whatami: WhatAmI,
        zid: ZenohId,
        size_params: SizeParams,
        cookie: Bytes,
    ) -> Self {
        Self::InitAck(InitAck {
            version: PROTO_VERSION,
            whatami,
            zid,
            size_params,
            cookie,
        })
    }

    #[must_use]
    pub fn make_open_syn(lease_ms: u64, initial_sn: u64, cookie: Bytes) -> Self {
        Self::OpenSyn(OpenSyn {
            lease_ms,
            initial_sn,
            cookie,
        })
    }

    #[must_use]
    pub fn make_open_ack(lease_ms: u64, initial_sn: u64) -> Self {
        Self::OpenAck(OpenAck {
            lease_ms,
            initial_sn,
        })
    }

    #[must_use]
    pub fn make_close(reason: u8, session: bool) -> Self {
        Self::Close(Close { reason, session })
    }

    #[must_use]
    pub fn make_keep_alive() -> Self {
        Self::KeepAlive
    }

    #[must_use]
    pub fn make_frame(
        sn: u64,
        reliable: bool,
        messages: impl Into<FrameMessages>,
    ) -> Self {
        Self::Frame(Frame {
            sn,
            reliable,
            messages: messages.into(),
        })
    }

    #[must_use]
    pub fn make_fragment(sn: u64, reliable: bool, more: bool, payload: Bytes) -> Self {
        Self::Fragment(Fragment {
            sn,
            reliable,
            more,
            payload,
        })
    }
}
