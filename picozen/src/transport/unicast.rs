//! Unicast transport: client↔router or peer↔peer over one link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::{WhatAmI, ZenohId};
use picozen_core::link::Link;
use picozen_proto::codec::decode_transport_message;
use picozen_proto::reader::Reader;
use picozen_proto::transport::{
    close_reason, SizeParams, TransportMessage, PROTO_VERSION,
};

use crate::config::Config;
use crate::session::SessionInner;
use crate::transport::{
    maybe_timeout, now_ms, MessageReader, ReadOutcome, RxAction, RxChannel, TransportTx,
};

/// Everything negotiated by the Init/Open exchange.
pub(crate) struct Negotiated {
    pub remote_zid: ZenohId,
    pub remote_whatami: WhatAmI,
    pub remote_lease_ms: u64,
    pub size_params: SizeParams,
    pub local_initial_sn: u64,
    pub remote_initial_sn: u64,
}

struct UnicastRx {
    reliable: RxChannel,
    best_effort: RxChannel,
}

/// One unicast transport: a single peer over a single link.
pub(crate) struct TransportUnicast {
    pub(crate) tx: TransportTx,
    reader: futures::lock::Mutex<MessageReader>,
    rx: Mutex<UnicastRx>,
    pub(crate) remote_zid: ZenohId,
    pub(crate) remote_whatami: WhatAmI,
    pub(crate) remote_lease_ms: u64,
    last_received_ms: AtomicU64,
    closed: AtomicBool,
    close_tx: flume::Sender<u8>,
    close_rx: flume::Receiver<u8>,
}

async fn read_one(reader: &mut MessageReader) -> ZResult<Bytes> {
    let (bytes, _) = reader.next().await?;
    Ok(bytes)
}

fn decode_one(bytes: &[u8]) -> ZResult<TransportMessage> {
    let mut reader = Reader::new(bytes);
    decode_transport_message(&mut reader).map_err(|e| ZError::protocol(e.to_string()))
}

fn random_initial_sn(params: &SizeParams) -> u64 {
    rand::thread_rng().gen::<u64>() & params.sn_resolution.mask()
}

/// Active (connecting) side of the Init/Open handshake.
pub(crate) async fn open_handshake(
    link: &Arc<dyn Link>,
    config: &Config,
    local_zid: ZenohId,
) -> ZResult<Negotiated> {
    let mut reader = MessageReader::new(link.clone());
    let streamed = link.capabilities().is_streamed();

    let init_syn =
        TransportMessage::make_init_syn(config.mode, local_zid, SizeParams::default());
    let bytes = picozen_proto::framing::serialize_transport_message(&init_syn, streamed)
        .map_err(|e| ZError::protocol(e.to_string()))?;
    link.write_all(&bytes).await?;

    let raw = maybe_timeout(config.socket_timeout_ms, read_one(&mut reader)).await?;
    let (remote_zid, remote_whatami, size_params, cookie) = match decode_one(&raw)? {
        TransportMessage::InitAck(ack) => {
            if ack.version != PROTO_VERSION {
                return Err(ZError::open_failed("protocol version mismatch"));
            }
            (ack.zid, ack.whatami, ack.size_params, ack.cookie)
        }
        TransportMessage::Close(close) => {
            return Err(ZError::open_failed(format!(
                "peer refused session (reason {})",
                close.reason
            )));
        }
        other => {
            return Err(ZError::open_failed(format!(
                "expected InitAck, got {other:?}"
            )));
        }
    };

    let local_initial_sn = random_initial_sn(&size_params);
    let open_syn =
        TransportMessage::make_open_syn(config.lease_ms, local_initial_sn, cookie);
    let bytes = picozen_proto::framing::serialize_transport_message(&open_syn, streamed)
        .map_err(|e| ZError::protocol(e.to_string()))?;
    link.write_all(&bytes).await?;

    let raw = maybe_timeout(config.socket_timeout_ms, read_one(&mut reader)).await?;
    let (remote_lease_ms, remote_initial_sn) = match decode_one(&raw)? {
        TransportMessage::OpenAck(ack) => (ack.lease_ms, ack.initial_sn),
        other => {
            return Err(ZError::open_failed(format!(
                "expected OpenAck, got {other:?}"
            )));
        }
    };

    debug!(%remote_zid, ?remote_whatami, remote_lease_ms, "unicast session opened");
    Ok(Negotiated {
        remote_zid,
        remote_whatami,
        remote_lease_ms,
        size_params,
        local_initial_sn,
        remote_initial_sn,
    })
}

/// Passive (accepting) side of the Init/Open handshake.
pub(crate) async fn accept_handshake(
    link: &Arc<dyn Link>,
    config: &Config,
    local_zid: ZenohId,
) -> ZResult<Negotiated> {
    let mut reader = MessageReader::new(link.clone());
    let streamed = link.capabilities().is_streamed();

    let raw = maybe_timeout(config.socket_timeout_ms, read_one(&mut reader)).await?;
    let (remote_zid, remote_whatami, size_params) = match decode_one(&raw)? {
        TransportMessage::InitSyn(syn) => {
            if syn.version != PROTO_VERSION {
                return Err(ZError::open_failed("protocol version mismatch"));
            }
            (syn.zid, syn.whatami, syn.size_params)
        }
        other => {
            return Err(ZError::open_failed(format!(
                "expected InitSyn, got {other:?}"
            )));
        }
    };

    let cookie: [u8; 16] = rand::thread_rng().gen();
    let init_ack = TransportMessage::make_init_ack(
        config.mode,
        local_zid,
        size_params,
        Bytes::copy_from_slice(&cookie),
    );
    let bytes = picozen_proto::framing::serialize_transport_message(&init_ack, streamed)
        .map_err(|e| ZError::protocol(e.to_string()))?;
    link.write_all(&bytes).await?;

    let raw = maybe_timeout(config.socket_timeout_ms, read_one(&mut reader)).await?;
    let (remote_lease_ms, remote_initial_sn) = match decode_one(&raw)? {
        TransportMessage::OpenSyn(syn) => {
            if syn.cookie != Bytes::copy_from_slice(&cookie) {
                return Err(ZError::open_failed("handshake cookie mismatch"));
            }
            (syn.lease_ms, syn.initial_sn)
        }
        other => {
            return Err(ZError::open_failed(format!(
                "expected OpenSyn, got {other:?}"
            )));
        }
    };

    let local_initial_sn = random_initial_sn(&size_params);
    let open_ack = TransportMessage::make_open_ack(config.lease_ms, local_initial_sn);
    let bytes = picozen_proto::framing::serialize_transport_message(&open_ack, streamed)
        .map_err(|e| ZError::protocol(e.to_string()))?;
    link.write_all(&bytes).await?;

    debug!(%remote_zid, ?remote_whatami, "unicast session accepted");
    Ok(Negotiated {
        remote_zid,
        remote_whatami,
        remote_lease_ms,
        size_params,
        local_initial_sn,
        remote_initial_sn,
    })
}

impl TransportUnicast {
    pub(crate) fn new(link: Arc<dyn Link>, negotiated: Negotiated) -> Arc<Self> {
        let resolution = negotiated.size_params.sn_resolution;
        let tx = TransportTx::new(
            link.clone(),
            negotiated.size_params.batch_size,
            resolution,
            negotiated.local_initial_sn,
            negotiated.local_initial_sn,
        );
        let (close_tx, close_rx) = flume::unbounded();
        Arc::new(Self {
            tx,
            reader: futures::lock::Mutex::new(MessageReader::new(link)),
            rx: Mutex::new(UnicastRx {
                reliable: RxChannel::new(true, negotiated.remote_initial_sn, resolution),
                best_effort: RxChannel::new(
                    false,
                    negotiated.remote_initial_sn,
                    resolution,
                ),
            }),
            remote_zid: negotiated.remote_zid,
            remote_whatami: negotiated.remote_whatami,
            remote_lease_ms: negotiated.remote_lease_ms,
            last_received_ms: AtomicU64::new(now_ms()),
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn last_received_ms(&self) -> u64 {
        self.last_received_ms.load(Ordering::Relaxed)
    }

    /// Ask the read side to tear the transport down. Callable from sync
    /// contexts (scheduler callbacks); the next read drive performs the
    /// async part of the close.
    pub(crate) fn request_close(&self, reason: u8) {
        let _ = self.close_tx.send(reason);
    }

    /// Mark closed and release per-peer state. The link itself is closed
    /// by the async caller.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Full close: optionally notify the peer, then close the link and
    /// unblock the session.
    pub(crate) async fn close(
        &self,
        session: &Arc<SessionInner>,
        reason: u8,
        notify_peer: bool,
    ) {
        if !self.mark_closed() {
            return;
        }
        debug!(reason, notify_peer, "closing unicast transport");
        if notify_peer {
            let msg = TransportMessage::make_close(reason, true);
            let _ = self.tx.enqueue_transport(&msg);
            let _ = self.tx.flush().await;
        }
        let _ = self.tx.link().close().await;
        session.on_transport_down(self.remote_zid, reason);
    }

    /// Drive one receive step: flush pending writes, then read and
    /// dispatch one transport message.
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

        let (raw, _) = match outcome {
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

        self.last_received_ms.store(now_ms(), Ordering::Relaxed);

        let msg = match decode_one(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                // A malformed transport header is unrecoverable.
                warn!(error = %e, "failed to decode transport message");
                self.close(session, close_reason::INVALID, true).await;
                return Err(ZError::SessionClosed);
            }
        };
        self.handle_message(session, msg).await
    }

    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<SessionInner>,
        msg: TransportMessage,
    ) -> ZResult<()> {
        let action = match msg {
            TransportMessage::Frame(frame) => {
                let mut rx = self.rx.lock();
                if frame.reliable {
                    rx.reliable.handle_frame(frame)
                } else {
                    rx.best_effort.handle_frame(frame)
                }
            }
            TransportMessage::Fragment(fragment) => {
                let mut rx = self.rx.lock();
                if fragment.reliable {
                    rx.reliable.handle_fragment(fragment)
                } else {
                    rx.best_effort.handle_fragment(fragment)
                }
            }
            TransportMessage::KeepAlive => {
                trace!("keep-alive received");
                RxAction::None
            }
            TransportMessage::Close(close) => {
                debug!(reason = close.reason, "peer closed the transport");
                self.close(session, close.reason, false).await;
                return Err(ZError::SessionClosed);
            }
            other => {
                trace!(?other, "ignoring unexpected transport message");
                RxAction::None
            }
        };

        match action {
            RxAction::Deliver(messages) => {
                session
                    .dispatch_network_messages(messages, Some(self.remote_zid))
                    .await;
                self.tx.flush().await
            }
            RxAction::None => Ok(()),
            RxAction::CloseInvalid => {
                self.close(session, close_reason::INVALID, true).await;
                Err(ZError::SessionClosed)
            }
        }
    }

    /// Lease housekeeping, run from the periodic scheduler: emit a
    /// keep-alive when the send side went quiet, request close when the
    /// peer has been silent past its lease.
    pub(crate) fn lease_tick(&self, keep_alive_interval_ms: u64) {
        if self.is_closed() {
            return;
        }
        let now = now_ms();
        if now.saturating_sub(self.last_received_ms()) > self.remote_lease_ms {
            warn!(
                remote_lease_ms = self.remote_lease_ms,
                "remote lease expired"
            );
            self.request_close(close_reason::EXPIRED);
            return;
        }
        if now.saturating_sub(self.tx.last_sent_ms()) >= keep_alive_interval_ms {
            trace!("sending keep-alive");
            let _ = self
                .tx
                .enqueue_transport(&TransportMessage::make_keep_alive());
        }
    }
}
