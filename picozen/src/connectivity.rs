//! Connectivity events: PUT/DELETE notifications on transport-peer and
//! link lifecycle, fanned out to registered listeners.

use picozen_core::id::{WhatAmI, ZenohId};

/// Whether the event reports an appearance or a disappearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEventKind {
    Put,
    Delete,
}

/// Which transport variant a peer was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportVariant {
    Unicast,
    Multicast,
    RawEth,
}

impl TransportVariant {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Multicast => "multicast",
            Self::RawEth => "raweth",
        }
    }
}

/// A transport peer appeared or was lost.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub kind: ConnectivityEventKind,
    pub variant: TransportVariant,
    pub zid: ZenohId,
    pub whatami: Option<WhatAmI>,
}

/// Introspection data for one link, also used by the admin space.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub mtu: u16,
    pub is_streamed: bool,
    pub is_reliable: bool,
}

/// A link of a transport peer came up or went down.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub kind: ConnectivityEventKind,
    pub zid: ZenohId,
    pub link: LinkInfo,
}

/// Handle to a registered connectivity listener; dropping it
/// unregisters the listener.
pub struct ListenerHandle {
    pub(crate) session: std::sync::Weak<crate::session::SessionInner>,
    pub(crate) id: picozen_core::id::EntityId,
    pub(crate) link_listener: bool,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_connectivity_listener(self.id, self.link_listener);
        }
    }
}
