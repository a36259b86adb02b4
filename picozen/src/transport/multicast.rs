//! Multicast transport: peer-to-peer over one multicast (or
//! raw-Ethernet) link. Peers are discovered through their periodic Join
//! advertisements and evicted when their lease expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::{WhatAmI, ZenohId};
use picozen_core::link::Link;
use picozen_proto::codec::decode_transport_message;
use picozen_proto::reader::Reader;
use picozen_proto::transport::{
    close_reason, ConduitSnList, SizeParams, SnPair, TransportMessage,
};

use crate::config::defaults;
use crate::session::SessionInner;
use crate::transport::{now_ms, MessageReader, ReadOutcome, RxAction, RxChannel, TransportTx};

/// State kept for every remote peer heard on the group.
pub(crate) struct PeerMulticast {
    pub zid: ZenohId,
    pub whatami: WhatAmI,
    pub lease_ms: u64,
    pub last_received_ms: u64,
    reliable: RxChannel,
    best_effort: RxChannel,
}

pub(crate) struct TransportMulticast {
    pub(crate) tx: TransportTx,
    reader: futures::lock::Mutex<MessageReader>,
    /// Peers keyed by their datagram source address.
    peers: Mutex<HashMap<String, PeerMulticast>>,
    closed: AtomicBool,
    close_tx: flume::Sender<u8>,
    close_rx: flume::Receiver<u8>,
}

impl TransportMulticast {
    pub(crate) fn new(link: Arc<dyn Link>) -> Arc<Self> {
        let params = SizeParams::default();
        let initial_sn = rand::random::<u64>() & params.sn_resolution.mask();
        let tx = TransportTx::new(
            link.clone(),
            params.batch_size.min(link.mtu().max(1)),
            params.sn_resolution,
            initial_sn,
            initial_sn,
        );
        let (close_tx, close_rx) = flume::unbounded();
        Arc::new(Self {
            tx,
            reader: futures::lock::Mutex::new(MessageReader::new(link)),
            peers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn request_close(&self, reason: u8) {
        let _ = self.close_tx.send(reason);
    }

    /// Snapshot of the current peers, for the admin space and the
    /// connectivity listeners.
    pub(crate) fn peers_snapshot(&self) -> Vec<(ZenohId, WhatAmI)> {
        self.peers
            .lock()
            .values()
            .map(|p| (p.zid, p.whatami))
            .collect()
    }

    /// Queue our periodic Join advertisement. Run from the scheduler.
    pub(crate) fn join_tick(&self, session: &SessionInner) {
        if self.is_closed() {
            return;
        }
        let (reliable, best_effort) = self.tx.next_sns();
        let join = TransportMessage::make_join(
            session.whatami(),
            session.zid(),
            session.config().lease_ms,
            SizeParams {
                sn_resolution: Default::default(),
                batch_size: self.tx.batch_size(),
            },
            ConduitSnList::Plain(SnPair {
                reliable,
                best_effort,
            }),
        );
        trace!("advertising Join on the group");
        let _ = self.tx.enqueue_transport(&join);
    }

    /// Evict peers whose lease expired. Run from the scheduler; the
    /// resulting DELETE events fire outside the peer table lock.
    pub(crate) fn lease_tick(&self, session: &Arc<SessionInner>) {
        if self.is_closed() {
            return;
        }
        let now = now_ms();
        let expired: Vec<(String, ZenohId)> = {
            let mut peers = self.peers.lock();
            let gone: Vec<String> = peers
                .iter()
                .filter(|(_, p)| {
                    let horizon =
                        (p.lease_ms as f64 * defaults::LEASE_EXPIRE_FACTOR) as u64;
                    now.saturating_sub(p.last_received_ms) > horizon
                })
                .map(|(addr, _)| addr.clone())
                .collect();
            gone.into_iter()
                .map(|addr| {
                    let peer = peers.remove(&addr).expect("key collected under lock");
                    (addr, peer.zid)
                })
                .collect()
        };
        for (addr, zid) in expired {
            warn!(%zid, addr, "multicast peer lease expired");
            session.on_multicast_peer_down(zid);
        }
    }

    pub(crate) async fn close(
        &self,
        session: &Arc<SessionInner>,
        reason: u8,
        notify_peers: bool,
    ) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "leaving multicast group");
        if notify_peers {
            let msg = TransportMessage::make_close(reason, true);
            let _ = self.tx.enqueue_transport(&msg);
            let _ = self.tx.flush().await;
        }
        let _ = self.tx.link().close().await;
        let peers: Vec<ZenohId> = {
            let mut guard = self.peers.lock();
            guard.drain().map(|(_, p)| p.zid).collect()
        };
        for zid in peers {
            session.on_multicast_peer_down(zid);
        }
        session.on_transport_closed();
    }

    /// Drive one receive step: flush pending writes, then read and
    /// dispatch one datagram.
    pub(crate) async fn read_once(
        self: &Arc<Self>,
        session: &Arc<SessionInner>,
    ) -> ZResult<()> {
        use futures::FutureExt;

        if self.is_closed() {
            return Err(ZError::SessionClosed);
        }
        self.tx.flush().await?;

        let outcome = {
            let mut reader = self.reader.lock().await;
            let read = reader.next().fuse();
            futures::pin_mut!(read);
            futures::select! {
                raw = read => ReadOutcome::Message(raw),
                reason = self.close_rx.recv_async().fuse() => {
                    ReadOutcome::CloseRequest(reason.unwrap_or(close_reason::GENERIC))
                }
            }
        };

        let (raw, addr) = match outcome {
            ReadOutcome::CloseRequest(reason) => {
                self.close(session, reason, true).await;
                return Err(ZError::SessionClosed);
            }
            ReadOutcome::Message(Err(ZError::LinkClosed)) => {
                self.close(session, close_reason::GENERIC, false).await;
                return Err(ZError::SessionClosed);
            }
            ReadOutcome::Message(Err(e)) => return Err(e),
            ReadOutcome::Message(Ok(out)) => out,
        };
        let addr = addr.unwrap_or_default();

        let mut msg_reader = Reader::new(&raw);
        let msg = match decode_transport_message(&mut msg_reader) {
            Ok(msg) => msg,
            Err(e) => {
                // One bad datagram does not take the group down.
                warn!(addr, error = %e, "dropping undecodable datagram");
                return Ok(());
            }
        };
        self.handle_message(session, addr, msg).await
    }

    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<SessionInner>,
        addr: String,
        msg: TransportMessage,
    ) -> ZResult<()> {
        let now = now_ms();
        let action = match msg {
            TransportMessage::Join(join) => {
                if join.zid == session.zid() {
                    return Ok(());
                }
                let mut peers = self.peers.lock();
                let sn = join.next_sn.plain();
                let resolution = join.size_params.sn_resolution;
                // A different zid behind a known address is a restarted
                // peer: the old entry is gone.
                let stale = peers
                    .get(&addr)
                    .filter(|p| p.zid != join.zid)
                    .map(|p| p.zid);
                if stale.is_some() {
                    peers.remove(&addr);
                }
                let is_new = !peers.contains_key(&addr);
                let entry = peers.entry(addr.clone()).or_insert_with(|| {
                    PeerMulticast {
                        zid: join.zid,
                        whatami: join.whatami,
                        lease_ms: join.lease_ms,
                        last_received_ms: now,
                        reliable: RxChannel::new(true, sn.reliable, resolution),
                        best_effort: RxChannel::new(false, sn.best_effort, resolution),
                    }
                });
                entry.last_received_ms = now;
                entry.lease_ms = join.lease_ms;
                drop(peers);
                if let Some(old) = stale {
                    session.on_multicast_peer_down(old);
                }
                if is_new {
                    debug!(zid = %join.zid, addr, "multicast peer joined");
                    session.on_multicast_peer_up(join.zid, join.whatami);
                    // Advertise back right away so the newcomer learns us
                    // before our next periodic Join.
                    self.join_tick(session);
                    let _ = self.tx.flush().await;
                }
                RxAction::None
            }
            TransportMessage::Frame(frame) => {
                let mut peers = self.peers.lock();
                match peers.get_mut(&addr) {
                    Some(peer) => {
                        peer.last_received_ms = now;
                        if frame.reliable {
                            peer.reliable.handle_frame(frame)
                        } else {
                            peer.best_effort.handle_frame(frame)
                        }
                    }
                    None => {
                        trace!(addr, "frame from unknown peer, waiting for its Join");
                        RxAction::None
                    }
                }
            }
            TransportMessage::Fragment(fragment) => {
                let mut peers = self.peers.lock();
                match peers.get_mut(&addr) {
                    Some(peer) => {
                        peer.last_received_ms = now;
                        if fragment.reliable {
                            peer.reliable.handle_fragment(fragment)
                        } else {
                            peer.best_effort.handle_fragment(fragment)
                        }
                    }
                    None => RxAction::None,
                }
            }
            TransportMessage::KeepAlive => {
                if let Some(peer) = self.peers.lock().get_mut(&addr) {
                    peer.last_received_ms = now;
                }
                RxAction::None
            }
            TransportMessage::Close(close) => {
                let removed = self.peers.lock().remove(&addr);
                if let Some(peer) = removed {
                    debug!(zid = %peer.zid, reason = close.reason, "multicast peer left");
                    session.on_multicast_peer_down(peer.zid);
                }
                RxAction::None
            }
            other => {
                trace!(?other, "ignoring unexpected multicast message");
                RxAction::None
            }
        };

        match action {
            RxAction::Deliver(messages) => {
                let source = self.peers.lock().get(&addr).map(|p| p.zid);
                session.dispatch_network_messages(messages, source).await;
                self.tx.flush().await
            }
            RxAction::None => Ok(()),
            RxAction::CloseInvalid => {
                // A misbehaving peer is dropped; the group stays up.
                let removed = self.peers.lock().remove(&addr);
                if let Some(peer) = removed {
                    warn!(zid = %peer.zid, "dropping peer after reliable-channel violation");
                    session.on_multicast_peer_down(peer.zid);
                }
                Ok(())
            }
        }
    }
}
