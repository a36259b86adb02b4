//! In-process links: a loopback [`LinkManager`] connecting sessions of
//! the same process without touching the network.
//!
//! `tcp/...` locators behave as reliable byte streams matched with a
//! registered listener; `udp/...` locators behave as an unreliable
//! datagram group shared by every member that opened the same locator.
//! Useful for tests and for co-located pipelines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use picozen_core::error::{ZError, ZResult};
use picozen_core::link::{
    Link, LinkCapabilities, LinkFlow, LinkListener, LinkManager, LinkTransport,
};
use picozen_core::locator::{Locator, Protocol};

type Datagram = (Bytes, Option<String>);

const STREAM_MTU: u16 = u16::MAX;
const GROUP_MTU: u16 = 8192;

enum Outbox {
    /// Point-to-point: bytes go straight to the peer's inbox.
    Direct(Sender<Datagram>),
    /// Group: bytes fan out to every other member.
    Group { hub: Arc<Hub>, member: u64 },
}

struct Hub {
    members: Mutex<HashMap<u64, Sender<Datagram>>>,
    next_member: AtomicU64,
}

impl Hub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(HashMap::new()),
            next_member: AtomicU64::new(1),
        })
    }

    fn join(self: &Arc<Self>, inbox_tx: Sender<Datagram>) -> u64 {
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        self.members.lock().insert(member, inbox_tx);
        member
    }

    fn leave(&self, member: u64) {
        self.members.lock().remove(&member);
    }

    fn broadcast(&self, from: u64, bytes: &[u8]) {
        let targets: Vec<Sender<Datagram>> = {
            let members = self.members.lock();
            members
                .iter()
                .filter(|(id, _)| **id != from)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        let addr = format!("inproc/{from}");
        for tx in targets {
            let _ = tx.send((Bytes::copy_from_slice(bytes), Some(addr.clone())));
        }
    }
}

/// One in-process link endpoint.
pub struct MemoryLink {
    capabilities: LinkCapabilities,
    mtu: u16,
    src: Option<Locator>,
    dst: Option<Locator>,
    inbox: Receiver<Datagram>,
    outbox: Mutex<Option<Outbox>>,
    /// Carries nothing; dropping its sender unblocks a pending read.
    shutdown_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    /// Leftover of a partially consumed stream chunk.
    stream_rest: Mutex<Bytes>,
    closed: AtomicBool,
    /// Shared loss budget: while positive, writes vanish. Lets tests
    /// reproduce lossy networks deterministically.
    loss_budget: Option<Arc<AtomicU64>>,
}

impl MemoryLink {
    fn new(
        capabilities: LinkCapabilities,
        mtu: u16,
        src: Option<Locator>,
        dst: Option<Locator>,
        inbox: Receiver<Datagram>,
        outbox: Outbox,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        Arc::new(Self {
            capabilities,
            mtu,
            src,
            dst,
            inbox,
            outbox: Mutex::new(Some(outbox)),
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            stream_rest: Mutex::new(Bytes::new()),
            closed: AtomicBool::new(false),
            loss_budget: None,
        })
    }

    fn new_lossy(
        capabilities: LinkCapabilities,
        mtu: u16,
        src: Option<Locator>,
        dst: Option<Locator>,
        inbox: Receiver<Datagram>,
        outbox: Outbox,
        loss_budget: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        Arc::new(Self {
            capabilities,
            mtu,
            src,
            dst,
            inbox,
            outbox: Mutex::new(Some(outbox)),
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            stream_rest: Mutex::new(Bytes::new()),
            closed: AtomicBool::new(false),
            loss_budget: Some(loss_budget),
        })
    }

    /// A connected stream pair, no listener involved.
    #[must_use]
    pub fn stream_pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        let caps = LinkCapabilities {
            transport: LinkTransport::Unicast,
            flow: LinkFlow::Stream,
            is_reliable: true,
        };
        let a = Self::new(caps, STREAM_MTU, None, None, a_rx, Outbox::Direct(b_tx));
        let b = Self::new(caps, STREAM_MTU, None, None, b_rx, Outbox::Direct(a_tx));
        (a, b)
    }

    fn take_from(&self, bytes: Bytes, buf: &mut [u8]) -> usize {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        if n < bytes.len() && self.capabilities.is_streamed() {
            *self.stream_rest.lock() = bytes.slice(n..);
        }
        n
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn src(&self) -> Option<Locator> {
        self.src.clone()
    }

    fn dst(&self) -> Option<Locator> {
        self.dst.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> ZResult<(usize, Option<String>)> {
        use futures::FutureExt;

        if self.closed.load(Ordering::Acquire) {
            return Ok((0, None));
        }
        {
            let mut rest = self.stream_rest.lock();
            if !rest.is_empty() {
                let pending = std::mem::take(&mut *rest);
                drop(rest);
                return Ok((self.take_from(pending, buf), None));
            }
        }
        futures::select! {
            msg = self.inbox.recv_async().fuse() => match msg {
                Ok((bytes, addr)) => Ok((self.take_from(bytes, buf), addr)),
                Err(_) => Ok((0, None)),
            },
            _ = self.shutdown_rx.recv_async().fuse() => Ok((0, None)),
        }
    }

    async fn read_exact(&self, buf: &mut [u8]) -> ZResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let (n, _) = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ZError::LinkClosed);
            }
            filled += n;
        }
        Ok(())
    }

    async fn write(&self, buf: &[u8]) -> ZResult<usize> {
        self.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn write_all(&self, buf: &[u8]) -> ZResult<()> {
        if let Some(budget) = &self.loss_budget {
            // Simulated loss: the bytes evaporate but the write succeeds.
            let mut remaining = budget.load(Ordering::Acquire);
            while remaining > 0 {
                match budget.compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        trace!(len = buf.len(), "dropping write on lossy link");
                        return Ok(());
                    }
                    Err(actual) => remaining = actual,
                }
            }
        }
        let guard = self.outbox.lock();
        match guard.as_ref() {
            None => Err(ZError::LinkClosed),
            Some(Outbox::Direct(tx)) => tx
                .send((Bytes::copy_from_slice(buf), None))
                .map_err(|_| ZError::LinkClosed),
            Some(Outbox::Group { hub, member }) => {
                hub.broadcast(*member, buf);
                Ok(())
            }
        }
    }

    async fn close(&self) -> ZResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!("closing in-process link");
        // Dropping the outbox EOFs the peer (stream) or leaves the group.
        if let Some(Outbox::Group { hub, member }) = self.outbox.lock().take() {
            hub.leave(member);
        }
        // Dropping the shutdown sender releases any blocked reader.
        self.shutdown_tx.lock().take();
        Ok(())
    }
}

struct MemoryListener {
    rx: Receiver<Arc<dyn Link>>,
    locator: Locator,
}

#[async_trait]
impl LinkListener for MemoryListener {
    async fn accept(&mut self) -> ZResult<Arc<dyn Link>> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| ZError::LinkClosed)
    }

    fn locator(&self) -> Locator {
        self.locator.clone()
    }
}

/// In-process link factory.
///
/// Clone handles share the same namespace of listeners and groups.
#[derive(Clone, Default)]
pub struct MemoryLinkManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    listeners: Mutex<HashMap<String, Sender<Arc<dyn Link>>>>,
    groups: Mutex<HashMap<String, Arc<Hub>>>,
    /// Shared by every link this manager creates.
    loss_budget: Arc<AtomicU64>,
}

impl MemoryLinkManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently drop the next `count` writes across the links created by
    /// this manager. Reproduces lossy networks in tests.
    pub fn inject_loss(&self, count: u64) {
        self.inner.loss_budget.fetch_add(count, Ordering::AcqRel);
    }

    fn join_group(&self, locator: &Locator) -> Arc<dyn Link> {
        let hub = self
            .inner
            .groups
            .lock()
            .entry(locator.to_string())
            .or_insert_with(Hub::new)
            .clone();
        let (inbox_tx, inbox_rx) = flume::unbounded();
        let member = hub.join(inbox_tx);
        let caps = LinkCapabilities {
            transport: LinkTransport::Multicast,
            flow: LinkFlow::Datagram,
            is_reliable: false,
        };
        MemoryLink::new_lossy(
            caps,
            GROUP_MTU,
            Some(locator.clone()),
            Some(locator.clone()),
            inbox_rx,
            Outbox::Group { hub, member },
            self.inner.loss_budget.clone(),
        )
    }
}

#[async_trait]
impl LinkManager for MemoryLinkManager {
    async fn open_link(&self, locator: &Locator) -> ZResult<Arc<dyn Link>> {
        match locator.protocol {
            Protocol::Udp => Ok(self.join_group(locator)),
            _ => {
                let accept_tx = self
                    .inner
                    .listeners
                    .lock()
                    .get(&locator.to_string())
                    .cloned()
                    .ok_or(ZError::TransportNotAvailable)?;
                let (a_tx, a_rx) = flume::unbounded();
                let (b_tx, b_rx) = flume::unbounded();
                let caps = LinkCapabilities {
                    transport: LinkTransport::Unicast,
                    flow: LinkFlow::Stream,
                    is_reliable: true,
                };
                let local = MemoryLink::new_lossy(
                    caps,
                    STREAM_MTU,
                    None,
                    Some(locator.clone()),
                    a_rx,
                    Outbox::Direct(b_tx),
                    self.inner.loss_budget.clone(),
                );
                let remote = MemoryLink::new_lossy(
                    caps,
                    STREAM_MTU,
                    Some(locator.clone()),
                    None,
                    b_rx,
                    Outbox::Direct(a_tx),
                    self.inner.loss_budget.clone(),
                );
                accept_tx
                    .send(remote)
                    .map_err(|_| ZError::TransportNotAvailable)?;
                Ok(local)
            }
        }
    }

    async fn listen(&self, locator: &Locator) -> ZResult<Box<dyn LinkListener>> {
        let (tx, rx) = flume::unbounded();
        self.inner
            .listeners
            .lock()
            .insert(locator.to_string(), tx);
        Ok(Box::new(MemoryListener {
            rx,
            locator: locator.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn stream_pair_carries_bytes_in_order() {
        block_on(async {
            let (a, b) = MemoryLink::stream_pair();
            a.write_all(b"hello ").await.unwrap();
            a.write_all(b"world").await.unwrap();

            let mut buf = [0u8; 6];
            b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello ");
            let mut buf = [0u8; 5];
            b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"world");
        });
    }

    #[test]
    fn partial_reads_keep_the_rest() {
        block_on(async {
            let (a, b) = MemoryLink::stream_pair();
            a.write_all(b"abcdef").await.unwrap();
            let mut buf = [0u8; 4];
            let (n, _) = b.read(&mut buf).await.unwrap();
            assert_eq!((n, &buf[..n]), (4, &b"abcd"[..]));
            let (n, _) = b.read(&mut buf).await.unwrap();
            assert_eq!((n, &buf[..n]), (2, &b"ef"[..]));
        });
    }

    #[test]
    fn close_reads_as_eof() {
        block_on(async {
            let (a, b) = MemoryLink::stream_pair();
            a.close().await.unwrap();
            // The peer observes EOF once the sender side is gone.
            drop(a);
            let mut buf = [0u8; 4];
            let (n, _) = b.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
        });
    }

    #[test]
    fn group_fans_out_with_source_address() {
        block_on(async {
            let manager = MemoryLinkManager::new();
            let locator = Locator::parse("udp/224.0.0.224:7447").unwrap();
            let a = manager.open_link(&locator).await.unwrap();
            let b = manager.open_link(&locator).await.unwrap();
            let c = manager.open_link(&locator).await.unwrap();

            a.write_all(b"ping").await.unwrap();

            let mut buf = [0u8; 16];
            for link in [&b, &c] {
                let (n, addr) = link.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"ping");
                assert!(addr.unwrap().starts_with("inproc/"));
            }
        });
    }

    #[test]
    fn listener_accepts_dialed_links() {
        block_on(async {
            let manager = MemoryLinkManager::new();
            let locator = Locator::parse("tcp/127.0.0.1:7447").unwrap();
            let mut listener = manager.listen(&locator).await.unwrap();
            let dialer = manager.open_link(&locator).await.unwrap();
            let accepted = listener.accept().await.unwrap();

            dialer.write_all(b"syn").await.unwrap();
            let mut buf = [0u8; 3];
            accepted.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"syn");
        });
    }

    #[test]
    fn dial_without_listener_fails() {
        block_on(async {
            let manager = MemoryLinkManager::new();
            let locator = Locator::parse("tcp/127.0.0.1:9999").unwrap();
            assert!(matches!(
                manager.open_link(&locator).await,
                Err(ZError::TransportNotAvailable)
            ));
        });
    }
}
