//! Transport layer: send pipeline, per-channel receive state machines,
//! and the unicast/multicast transport variants.

pub(crate) mod defrag;
pub(crate) mod multicast;
pub(crate) mod sn;
pub(crate) mod unicast;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use picozen_core::buffer::RecvBuffer;
use picozen_core::error::{ZError, ZResult};
use picozen_core::link::Link;
use picozen_proto::codec::{encode_network_message, encode_transport_message};
use picozen_proto::framing::{serialize_transport_message, split_stream_message};
use picozen_proto::network::NetworkMessage;
use picozen_proto::reader::{Reader, WireWrite};
use picozen_proto::transport::{
    flag, mid, Fragment, Frame, SnResolution, TransportMessage, BATCH_SIZE_MAX,
    FRAGMENT_HEADER_SIZE, FRAG_MAX_SIZE,
};

use self::defrag::DefragBuffer;
use self::sn::{SeqNumRx, SeqNumTx, SnCheck};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start.
pub(crate) fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Await `fut` bounded by `ms` milliseconds; zero disables the bound.
pub(crate) async fn maybe_timeout<T, F>(ms: u64, fut: F) -> ZResult<T>
where
    F: Future<Output = ZResult<T>>,
{
    if ms == 0 {
        fut.await
    } else {
        match compio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(out) => out,
            Err(_) => Err(ZError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "operation timed out",
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Link-side message reader
// ---------------------------------------------------------------------------

/// Reads one serialized transport message at a time off a link,
/// applying stream framing when the link is a byte stream.
pub(crate) struct MessageReader {
    link: Arc<dyn Link>,
    streamed: bool,
    recv: RecvBuffer,
    chunk: usize,
}

impl MessageReader {
    pub(crate) fn new(link: Arc<dyn Link>) -> Self {
        let streamed = link.capabilities().is_streamed();
        let chunk = usize::from(link.mtu()).clamp(512, usize::from(BATCH_SIZE_MAX));
        Self {
            link,
            streamed,
            recv: RecvBuffer::new(),
            chunk,
        }
    }

    /// Next whole serialized transport message, plus the datagram source
    /// address when the link reports one.
    pub(crate) async fn next(&mut self) -> ZResult<(Bytes, Option<String>)> {
        if self.streamed {
            loop {
                if let Some(msg) = split_stream_message(&mut self.recv) {
                    return Ok((msg, None));
                }
                let mut buf = vec![0u8; self.chunk];
                let (n, _) = self.link.read(&mut buf).await?;
                if n == 0 {
                    return Err(ZError::LinkClosed);
                }
                buf.truncate(n);
                self.recv.push(Bytes::from(buf));
            }
        } else {
            let mut buf = vec![0u8; usize::from(BATCH_SIZE_MAX)];
            let (n, addr) = self.link.read(&mut buf).await?;
            if n == 0 {
                return Err(ZError::LinkClosed);
            }
            buf.truncate(n);
            Ok((Bytes::from(buf), addr))
        }
    }
}

// ---------------------------------------------------------------------------
// Send pipeline
// ---------------------------------------------------------------------------

struct PendingFrame {
    reliable: bool,
    payload: BytesMut,
    messages: usize,
}

struct TxWire {
    sn_reliable: SeqNumTx,
    sn_best_effort: SeqNumTx,
    batching: bool,
    pending: Option<PendingFrame>,
}

impl TxWire {
    fn sn_for(&mut self, reliable: bool) -> &mut SeqNumTx {
        if reliable {
            &mut self.sn_reliable
        } else {
            &mut self.sn_best_effort
        }
    }
}

/// Shared send half of a transport.
///
/// Serialization and sequence-number allocation happen synchronously
/// under a plain mutex so callbacks and `Drop` impls can enqueue;
/// the queued wire blobs are flushed to the link by whichever async
/// context drives next, in order, under the flush gate.
pub(crate) struct TransportTx {
    link: Arc<dyn Link>,
    streamed: bool,
    batch_size: u16,
    wire: Mutex<TxWire>,
    queue_tx: flume::Sender<Bytes>,
    queue_rx: flume::Receiver<Bytes>,
    flush_gate: futures::lock::Mutex<()>,
    last_sent_ms: AtomicU64,
}

impl TransportTx {
    pub(crate) fn new(
        link: Arc<dyn Link>,
        batch_size: u16,
        resolution: SnResolution,
        initial_sn_reliable: u64,
        initial_sn_best_effort: u64,
    ) -> Self {
        let streamed = link.capabilities().is_streamed();
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            link,
            streamed,
            batch_size,
            wire: Mutex::new(TxWire {
                sn_reliable: SeqNumTx::new(initial_sn_reliable, resolution),
                sn_best_effort: SeqNumTx::new(initial_sn_best_effort, resolution),
                batching: false,
                pending: None,
            }),
            queue_tx,
            queue_rx,
            flush_gate: futures::lock::Mutex::new(()),
            last_sent_ms: AtomicU64::new(now_ms()),
        }
    }

    pub(crate) fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub(crate) fn batch_size(&self) -> u16 {
        self.batch_size
    }

    pub(crate) fn last_sent_ms(&self) -> u64 {
        self.last_sent_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn next_sns(&self) -> (u64, u64) {
        let wire = self.wire.lock();
        (wire.sn_reliable.peek(), wire.sn_best_effort.peek())
    }

    /// Room left in a frame for network payload.
    fn frame_budget(&self) -> usize {
        usize::from(self.batch_size).saturating_sub(FRAGMENT_HEADER_SIZE)
    }

    fn queue_blob(&self, body: BytesMut) -> ZResult<()> {
        let blob = if self.streamed {
            if body.len() > usize::from(BATCH_SIZE_MAX) {
                return Err(ZError::BatchOverflow {
                    size: body.len(),
                    max: usize::from(BATCH_SIZE_MAX),
                });
            }
            let mut framed = BytesMut::with_capacity(2 + body.len());
            framed.write_u16_le(body.len() as u16);
            framed.extend_from_slice(&body);
            framed.freeze()
        } else {
            body.freeze()
        };
        self.queue_tx
            .send(blob)
            .map_err(|_| ZError::ChannelDisconnected)
    }

    fn assemble_frame(&self, sn: u64, reliable: bool, payload: &[u8]) -> BytesMut {
        let mut body = BytesMut::with_capacity(1 + 9 + payload.len());
        body.write_u8(mid::FRAME | if reliable { flag::R } else { 0 });
        body.write_zint(sn);
        body.extend_from_slice(payload);
        body
    }

    fn flush_pending_locked(&self, wire: &mut TxWire) -> ZResult<()> {
        if let Some(pending) = wire.pending.take() {
            let sn = wire.sn_for(pending.reliable).take();
            trace!(sn, messages = pending.messages, "flushing batched frame");
            let body = self.assemble_frame(sn, pending.reliable, &pending.payload);
            self.queue_blob(body)?;
        }
        Ok(())
    }

    /// Serialize one network message into frames or fragments and queue
    /// the resulting wire blobs.
    pub(crate) fn enqueue_network(&self, msg: &NetworkMessage, reliable: bool) -> ZResult<()> {
        let mut serialized = BytesMut::new();
        encode_network_message(&mut serialized, msg);

        let mut wire = self.wire.lock();
        if serialized.len() <= self.frame_budget() {
            if wire.batching {
                // Append to the open frame when reliability matches and
                // the batch still has room.
                let fits = wire.pending.as_ref().is_some_and(|p| {
                    p.reliable == reliable
                        && p.payload.len() + serialized.len() <= self.frame_budget()
                });
                if !fits {
                    self.flush_pending_locked(&mut wire)?;
                }
                let pending = wire.pending.get_or_insert_with(|| PendingFrame {
                    reliable,
                    payload: BytesMut::new(),
                    messages: 0,
                });
                pending.payload.extend_from_slice(&serialized);
                pending.messages += 1;
                return Ok(());
            }
            let sn = wire.sn_for(reliable).take();
            let body = self.assemble_frame(sn, reliable, &serialized);
            return self.queue_blob(body);
        }

        // Fragmentation path. An oversized message never joins a batch.
        if serialized.len() > FRAG_MAX_SIZE {
            return Err(ZError::BatchOverflow {
                size: serialized.len(),
                max: FRAG_MAX_SIZE,
            });
        }
        self.flush_pending_locked(&mut wire)?;
        let chunk_size = self.frame_budget().max(1);
        let chunks: Vec<&[u8]> = serialized.chunks(chunk_size).collect();
        let total = chunks.len();
        debug!(
            len = serialized.len(),
            fragments = total,
            reliable,
            "fragmenting network message"
        );
        for (i, chunk) in chunks.into_iter().enumerate() {
            let sn = wire.sn_for(reliable).take();
            let more = i + 1 < total;
            let mut body = BytesMut::with_capacity(1 + 9 + chunk.len());
            body.write_u8(
                mid::FRAGMENT
                    | if reliable { flag::R } else { 0 }
                    | if more { flag::M } else { 0 },
            );
            body.write_zint(sn);
            body.extend_from_slice(chunk);
            self.queue_blob(body)?;
        }
        Ok(())
    }

    /// Queue a transport-level message (handshake, keep-alive, close,
    /// join). Bypasses batching.
    pub(crate) fn enqueue_transport(&self, msg: &TransportMessage) -> ZResult<()> {
        {
            let mut wire = self.wire.lock();
            self.flush_pending_locked(&mut wire)?;
        }
        let mut body = BytesMut::new();
        encode_transport_message(&mut body, msg);
        self.queue_blob(body)
    }

    /// Switch to deferred flushing: messages accumulate into one frame.
    pub(crate) fn batch_start(&self) {
        self.wire.lock().batching = true;
    }

    /// Queue the open frame, if any, keeping batching enabled.
    pub(crate) fn batch_flush(&self) -> ZResult<()> {
        let mut wire = self.wire.lock();
        self.flush_pending_locked(&mut wire)
    }

    /// Queue the open frame and return to per-message flushing.
    pub(crate) fn batch_stop(&self) -> ZResult<()> {
        let mut wire = self.wire.lock();
        wire.batching = false;
        self.flush_pending_locked(&mut wire)
    }

    /// Write every queued blob to the link, in order.
    pub(crate) async fn flush(&self) -> ZResult<()> {
        let _gate = self.flush_gate.lock().await;
        let mut wrote = false;
        while let Ok(blob) = self.queue_rx.try_recv() {
            self.link.write_all(&blob).await?;
            wrote = true;
        }
        if wrote {
            self.last_sent_ms.store(now_ms(), Ordering::Relaxed);
        }
        Ok(())
    }

}

// ---------------------------------------------------------------------------
// Receive channel state machine
// ---------------------------------------------------------------------------

/// Per-channel receive state: expected sn plus the defrag buffer.
pub(crate) struct RxChannel {
    reliable: bool,
    sn: SeqNumRx,
    defrag: DefragBuffer,
}

/// What a read drive step observed while waiting on the link.
pub(crate) enum ReadOutcome {
    /// One serialized transport message (with the datagram source, when
    /// the link reports one).
    Message(ZResult<(Bytes, Option<String>)>),
    /// Someone asked for the transport to close with this reason.
    CloseRequest(u8),
}

/// Outcome of feeding one Frame/Fragment into a channel.
pub(crate) enum RxAction {
    /// Deliver these network messages to the session, in order.
    Deliver(Vec<NetworkMessage>),
    /// Nothing to deliver.
    None,
    /// Reliable-channel ordering was violated: close with INVALID.
    CloseInvalid,
}

impl RxChannel {
    pub(crate) fn new(reliable: bool, initial_sn: u64, resolution: SnResolution) -> Self {
        Self {
            reliable,
            sn: SeqNumRx::new(initial_sn, resolution),
            defrag: DefragBuffer::new(),
        }
    }

    pub(crate) fn handle_frame(&mut self, frame: Frame) -> RxAction {
        match self.sn.check(frame.sn) {
            SnCheck::InOrder => {
                self.sn.accept(frame.sn);
                self.defrag.clear();
                RxAction::Deliver(frame.messages.into_vec())
            }
            SnCheck::Ahead => {
                if self.reliable {
                    warn!(
                        sn = frame.sn,
                        expected = self.sn.expected(),
                        "sn gap on reliable channel"
                    );
                    RxAction::CloseInvalid
                } else {
                    // Gaps are allowed; a partially received fragmented
                    // message is lost.
                    self.sn.accept(frame.sn);
                    self.defrag.clear();
                    RxAction::Deliver(frame.messages.into_vec())
                }
            }
            SnCheck::Stale => {
                if self.reliable {
                    warn!(
                        sn = frame.sn,
                        expected = self.sn.expected(),
                        "stale sn on reliable channel"
                    );
                    RxAction::CloseInvalid
                } else {
                    trace!(sn = frame.sn, "dropping stale best-effort frame");
                    RxAction::None
                }
            }
        }
    }

    pub(crate) fn handle_fragment(&mut self, fragment: Fragment) -> RxAction {
        match self.sn.check(fragment.sn) {
            SnCheck::InOrder => {
                self.sn.accept(fragment.sn);
            }
            SnCheck::Ahead => {
                if self.reliable {
                    warn!(
                        sn = fragment.sn,
                        expected = self.sn.expected(),
                        "out-of-order fragment on reliable channel"
                    );
                    return RxAction::CloseInvalid;
                }
                // Discard the partial message and restart from here.
                self.defrag.clear();
                self.sn.accept(fragment.sn);
            }
            SnCheck::Stale => {
                if self.reliable {
                    return RxAction::CloseInvalid;
                }
                return RxAction::None;
            }
        }

        if let Err(e) = self.defrag.push(&fragment.payload, self.sn.expected()) {
            warn!(error = %e, "defragmentation overflow, dropping message");
            return RxAction::None;
        }
        if fragment.more {
            return RxAction::None;
        }

        let whole = self.defrag.finalize();
        let mut reader = Reader::new(&whole);
        match picozen_proto::codec::decode_network_message(&mut reader) {
            Ok(msg) if reader.is_empty() => RxAction::Deliver(vec![msg]),
            Ok(_) => {
                warn!("trailing bytes after defragmented message, dropping");
                RxAction::None
            }
            Err(e) => {
                warn!(error = %e, "failed to decode defragmented message, dropping");
                RxAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picozen_proto::network::WireExpr;

    fn data(n: usize) -> NetworkMessage {
        NetworkMessage::make_data(
            WireExpr::literal("t/k"),
            None,
            Bytes::from(vec![0xAB; n]),
            false,
        )
    }

    fn rx(reliable: bool) -> RxChannel {
        RxChannel::new(reliable, 0, SnResolution::default())
    }

    fn frame(sn: u64, reliable: bool, messages: Vec<NetworkMessage>) -> Frame {
        Frame {
            sn,
            reliable,
            messages: messages.into(),
        }
    }

    #[test]
    fn reliable_in_order_delivery() {
        let mut ch = rx(true);
        for sn in 0..3 {
            match ch.handle_frame(frame(sn, true, vec![data(4)])) {
                RxAction::Deliver(msgs) => assert_eq!(msgs.len(), 1),
                _ => panic!("expected delivery at sn {sn}"),
            }
        }
    }

    #[test]
    fn reliable_gap_closes() {
        let mut ch = rx(true);
        assert!(matches!(
            ch.handle_frame(frame(0, true, vec![])),
            RxAction::Deliver(_)
        ));
        assert!(matches!(
            ch.handle_frame(frame(2, true, vec![])),
            RxAction::CloseInvalid
        ));
    }

    #[test]
    fn best_effort_gap_delivers_and_stale_drops() {
        let mut ch = rx(false);
        assert!(matches!(
            ch.handle_frame(frame(0, false, vec![])),
            RxAction::Deliver(_)
        ));
        assert!(matches!(
            ch.handle_frame(frame(5, false, vec![])),
            RxAction::Deliver(_)
        ));
        assert!(matches!(
            ch.handle_frame(frame(3, false, vec![])),
            RxAction::None
        ));
    }

    #[test]
    fn fragment_reassembly_roundtrip() {
        // Sender side: fragment a message bigger than the budget.
        let msg = data(1800);
        let mut serialized = BytesMut::new();
        encode_network_message(&mut serialized, &msg);
        let budget = 256 - FRAGMENT_HEADER_SIZE;
        let chunks: Vec<&[u8]> = serialized.chunks(budget).collect();
        let total = chunks.len();
        assert_eq!(total, serialized.len().div_ceil(budget));

        let mut ch = rx(true);
        let mut delivered = None;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let action = ch.handle_fragment(Fragment {
                sn: i as u64,
                reliable: true,
                more: i + 1 < total,
                payload: Bytes::copy_from_slice(chunk),
            });
            match action {
                RxAction::None => assert!(i + 1 < total),
                RxAction::Deliver(msgs) => {
                    assert_eq!(i + 1, total);
                    delivered = Some(msgs);
                }
                RxAction::CloseInvalid => panic!("unexpected close"),
            }
        }
        assert_eq!(delivered.unwrap(), vec![msg]);
    }

    #[test]
    fn reliable_fragment_gap_closes() {
        let mut ch = rx(true);
        assert!(matches!(
            ch.handle_fragment(Fragment {
                sn: 0,
                reliable: true,
                more: true,
                payload: Bytes::from_static(b"x"),
            }),
            RxAction::None
        ));
        assert!(matches!(
            ch.handle_fragment(Fragment {
                sn: 2,
                reliable: true,
                more: false,
                payload: Bytes::from_static(b"y"),
            }),
            RxAction::CloseInvalid
        ));
    }

    #[test]
    fn best_effort_fragment_gap_resets_buffer() {
        let mut ch = rx(false);
        assert!(matches!(
            ch.handle_fragment(Fragment {
                sn: 0,
                reliable: false,
                more: true,
                payload: Bytes::from_static(b"x"),
            }),
            RxAction::None
        ));
        // Gap: the partial message is discarded; the garbage that follows
        // fails to decode and is dropped quietly.
        assert!(matches!(
            ch.handle_fragment(Fragment {
                sn: 5,
                reliable: false,
                more: false,
                payload: Bytes::from_static(b"\xFF\xFF"),
            }),
            RxAction::None
        ));
        // The channel has resynced and keeps working.
        assert!(matches!(
            ch.handle_frame(frame(6, false, vec![data(1)])),
            RxAction::Deliver(_)
        ));
    }
}
