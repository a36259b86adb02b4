//! Abstract link contract.
//!
//! Concrete link drivers (TCP, UDP unicast/multicast, TLS, WebSocket,
//! serial, Bluetooth, raw-Ethernet) live outside the core. The transport
//! layer consumes them solely through this contract: a capability tuple,
//! an MTU, and blocking-style async read/write primitives. Framing and
//! reassembly are the transport's job, never the link's.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ZResult;
use crate::locator::Locator;

/// How the link addresses its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransport {
    Unicast,
    Multicast,
    RawEth,
}

/// Whether the link preserves message boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFlow {
    /// One message per datagram; no length prefix on the wire.
    Datagram,
    /// Byte stream; each serialized message is length-prefixed.
    Stream,
}

/// Capability tuple advertised by every concrete link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapabilities {
    pub transport: LinkTransport,
    pub flow: LinkFlow,
    pub is_reliable: bool,
}

impl LinkCapabilities {
    #[must_use]
    pub const fn is_streamed(&self) -> bool {
        matches!(self.flow, LinkFlow::Stream)
    }

    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        matches!(self.transport, LinkTransport::Multicast | LinkTransport::RawEth)
    }
}

/// A bidirectional byte pipe owned by a transport.
///
/// All methods take `&self`: implementations manage their own interior
/// mutability so a single link can be shared between the read task and
/// concurrent senders.
#[async_trait]
pub trait Link: Send + Sync {
    /// Capability tuple of this link.
    fn capabilities(&self) -> LinkCapabilities;

    /// Maximum transmission unit in bytes.
    fn mtu(&self) -> u16;

    /// Locator of the local end, when known.
    fn src(&self) -> Option<Locator>;

    /// Locator of the remote end, when known.
    fn dst(&self) -> Option<Locator>;

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns the byte count and, on datagram multicast links, the
    /// address of the sending peer. A return of 0 is peer-initiated close.
    async fn read(&self, buf: &mut [u8]) -> ZResult<(usize, Option<String>)>;

    /// Read exactly `buf.len()` bytes or fail.
    async fn read_exact(&self, buf: &mut [u8]) -> ZResult<()>;

    /// Write up to `buf.len()` bytes, returning the count written.
    async fn write(&self, buf: &[u8]) -> ZResult<usize>;

    /// Write the whole buffer or fail.
    async fn write_all(&self, buf: &[u8]) -> ZResult<()>;

    /// Close the link. Further reads and writes fail.
    async fn close(&self) -> ZResult<()>;
}

/// Factory for links, injected by the embedding application.
///
/// The core never opens sockets itself: session open resolves its
/// `connect`/`listen`/multicast locators through this trait.
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Open an outgoing link towards `locator`.
    async fn open_link(&self, locator: &Locator) -> ZResult<Arc<dyn Link>>;

    /// Start listening on `locator` for incoming links.
    async fn listen(&self, locator: &Locator) -> ZResult<Box<dyn LinkListener>>;
}

/// Accept side of a listening locator.
#[async_trait]
pub trait LinkListener: Send {
    /// Wait for the next incoming link.
    async fn accept(&mut self) -> ZResult<Arc<dyn Link>>;

    /// The locator this listener is bound to.
    fn locator(&self) -> Locator;
}
