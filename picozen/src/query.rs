//! Client-side queries: pending-query registry, reply consolidation,
//! deadlines, and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use picozen_core::handlers::Callback;
use picozen_proto::network::{ConsolidationMode, DataInfo, QueryTarget};

use crate::sample::Reply;
use crate::session::SessionInner;

/// Options accepted by `Session::get`.
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    pub timeout_ms: u64,
    pub payload: Option<(DataInfo, Bytes)>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            target: QueryTarget::default(),
            consolidation: ConsolidationMode::default(),
            timeout_ms: crate::config::defaults::QUERY_TIMEOUT_MS,
            payload: None,
            cancellation: None,
        }
    }
}

/// Token that cancels one or more pending queries.
///
/// `cancel` (a) prevents any new reply dispatch, (b) waits for the reply
/// callback currently executing, if any, to return, and (c) concludes
/// the attached queries so each callback's drop runs exactly once. A
/// token that is already cancelled short-circuits `get`: nothing is
/// sent and the callback drop runs immediately.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    /// Held while a reply callback guarded by this token executes.
    in_flight: Mutex<()>,
    attached: Mutex<Vec<(Weak<SessionInner>, u64)>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // Wait out any callback currently running under this token.
        drop(self.inner.in_flight.lock());
        let attached = std::mem::take(&mut *self.inner.attached.lock());
        for (session, qid) in attached {
            if let Some(session) = session.upgrade() {
                session.conclude_query(qid, false);
            }
        }
    }

    pub(crate) fn attach(&self, session: &Arc<SessionInner>, qid: u64) {
        self.inner
            .attached
            .lock()
            .push((Arc::downgrade(session), qid));
    }

    /// Run `f` under the in-flight guard unless already cancelled.
    pub(crate) fn run_guarded(&self, f: impl FnOnce()) {
        let _guard = self.inner.in_flight.lock();
        if !self.is_cancelled() {
            f();
        }
    }
}

/// A query awaiting replies.
pub(crate) struct PendingQuery {
    pub qid: u64,
    pub callback: Callback<Reply>,
    pub consolidation: ConsolidationMode,
    pub deadline_ms: u64,
    pub cancellation: Option<CancellationToken>,
    /// Latest delivered timestamp per keyexpr, for `Monotonic`.
    monotonic_seen: Mutex<HashMap<String, u64>>,
    /// Best reply per keyexpr, for `Latest`.
    latest_buffer: Mutex<HashMap<String, Reply>>,
}

/// Resolve `Auto` against the query parameters: time-ranged queries get
/// every reply, the rest keep only the latest per key.
pub(crate) fn resolve_consolidation(
    mode: ConsolidationMode,
    parameters: &str,
) -> ConsolidationMode {
    match mode {
        ConsolidationMode::Auto => {
            if parameters.contains("_time=") {
                ConsolidationMode::None
            } else {
                ConsolidationMode::Latest
            }
        }
        other => other,
    }
}

fn reply_time(reply: &Reply) -> u64 {
    // A reply without a timestamp consolidates as the earliest possible.
    reply.sample.timestamp.map_or(0, |ts| ts.time)
}

impl PendingQuery {
    pub(crate) fn new(
        qid: u64,
        callback: Callback<Reply>,
        consolidation: ConsolidationMode,
        deadline_ms: u64,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        debug_assert!(consolidation != ConsolidationMode::Auto);
        Self {
            qid,
            callback,
            consolidation,
            deadline_ms,
            cancellation,
            monotonic_seen: Mutex::new(HashMap::new()),
            latest_buffer: Mutex::new(HashMap::new()),
        }
    }

    fn deliver(&self, reply: Reply) {
        match &self.cancellation {
            Some(token) => token.run_guarded(|| self.callback.call(reply)),
            None => self.callback.call(reply),
        }
    }

    /// Feed one incoming reply through the consolidation discipline.
    pub(crate) fn on_reply(&self, reply: Reply) {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return;
        }
        match self.consolidation {
            ConsolidationMode::None => self.deliver(reply),
            ConsolidationMode::Monotonic => {
                let key = reply.sample.key_expr.as_str().to_string();
                let time = reply_time(&reply);
                let deliver = {
                    let mut seen = self.monotonic_seen.lock();
                    match seen.get(&key) {
                        Some(latest) if time <= *latest => false,
                        _ => {
                            seen.insert(key, time);
                            true
                        }
                    }
                };
                if deliver {
                    self.deliver(reply);
                } else {
                    trace!(qid = self.qid, "monotonic consolidation dropped a reply");
                }
            }
            ConsolidationMode::Latest => {
                let key = reply.sample.key_expr.as_str().to_string();
                let mut buffer = self.latest_buffer.lock();
                match buffer.get(&key) {
                    Some(best) if reply_time(&reply) <= reply_time(best) => {}
                    _ => {
                        buffer.insert(key, reply);
                    }
                }
            }
            ConsolidationMode::Auto => unreachable!("resolved at registration"),
        }
    }

    /// Termination: flush the `Latest` buffer. Dropping `self` afterwards
    /// runs the callback drop and disconnects any handler channel.
    pub(crate) fn conclude(&self) {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return;
        }
        if self.consolidation == ConsolidationMode::Latest {
            let mut buffered: Vec<(String, Reply)> =
                self.latest_buffer.lock().drain().collect();
            buffered.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (_, reply) in buffered {
                self.deliver(reply);
            }
        }
    }
}

/// Tracks a get in flight; used by `Session` to route replies by qid.
pub(crate) type PendingQueryRef = Arc<PendingQuery>;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use picozen_core::handlers::fifo_channel;
    use picozen_core::keyexpr::KeyExpr;
    use picozen_proto::network::{Encoding, Timestamp};
    use picozen_core::id::ZenohId;
    use crate::sample::{Qos, Sample, SampleKind};

    fn reply(key: &str, time: Option<u64>, body: &'static [u8]) -> Reply {
        let id = ZenohId::random();
        Reply {
            sample: Sample {
                key_expr: KeyExpr::new(key).unwrap(),
                payload: Bytes::from_static(body),
                encoding: Encoding::default(),
                kind: SampleKind::Put,
                timestamp: time.map(|t| Timestamp { time: t, id }),
                source_info: None,
                qos: Qos::default(),
            },
            replier_id: Some(id),
        }
    }

    #[test]
    fn auto_resolution() {
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Auto, "_time=[now-1h..]"),
            ConsolidationMode::None
        );
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Auto, ""),
            ConsolidationMode::Latest
        );
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Monotonic, ""),
            ConsolidationMode::Monotonic
        );
    }

    #[test]
    fn none_delivers_everything() {
        let (cb, rx) = fifo_channel::<Reply>(8);
        let pq = PendingQuery::new(1, cb, ConsolidationMode::None, u64::MAX, None);
        pq.on_reply(reply("k/a", Some(5), b"1"));
        pq.on_reply(reply("k/a", Some(3), b"2"));
        pq.conclude();
        assert_eq!(rx.try_recv().unwrap().sample.payload, &b"1"[..]);
        assert_eq!(rx.try_recv().unwrap().sample.payload, &b"2"[..]);
    }

    #[test]
    fn monotonic_requires_strictly_newer() {
        let (cb, rx) = fifo_channel::<Reply>(8);
        let pq = PendingQuery::new(1, cb, ConsolidationMode::Monotonic, u64::MAX, None);
        pq.on_reply(reply("k/a", Some(5), b"first"));
        pq.on_reply(reply("k/a", Some(5), b"same-ts"));
        pq.on_reply(reply("k/a", Some(4), b"older"));
        pq.on_reply(reply("k/a", Some(6), b"newer"));
        // Missing timestamp consolidates as earliest
        pq.on_reply(reply("k/a", None, b"untimed"));
        pq.on_reply(reply("k/b", Some(1), b"other-key"));
        drop(pq);
        let delivered: Vec<Bytes> =
            std::iter::from_fn(|| rx.try_recv().ok().map(|r| r.sample.payload)).collect();
        assert_eq!(delivered, vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"newer"),
            Bytes::from_static(b"other-key"),
        ]);
    }

    #[test]
    fn latest_buffers_until_conclusion() {
        let (cb, rx) = fifo_channel::<Reply>(8);
        let pq = PendingQuery::new(1, cb, ConsolidationMode::Latest, u64::MAX, None);
        pq.on_reply(reply("k/a", Some(5), b"old"));
        pq.on_reply(reply("k/a", Some(9), b"latest"));
        pq.on_reply(reply("k/b", None, b"only"));
        assert!(rx.try_recv().is_err(), "nothing before conclusion");
        pq.conclude();
        drop(pq);
        let mut delivered: Vec<(String, Bytes)> = std::iter::from_fn(|| {
            rx.try_recv()
                .ok()
                .map(|r| (r.sample.key_expr.as_str().to_string(), r.sample.payload))
        })
        .collect();
        delivered.sort();
        assert_eq!(
            delivered,
            vec![
                ("k/a".to_string(), Bytes::from_static(b"latest")),
                ("k/b".to_string(), Bytes::from_static(b"only")),
            ]
        );
    }

    #[test]
    fn cancelled_token_blocks_delivery() {
        let (cb, rx) = fifo_channel::<Reply>(8);
        let token = CancellationToken::new();
        let pq = PendingQuery::new(
            1,
            cb,
            ConsolidationMode::None,
            u64::MAX,
            Some(token.clone()),
        );
        token.cancel();
        pq.on_reply(reply("k/a", Some(1), b"late"));
        pq.conclude();
        drop(pq);
        assert!(matches!(
            rx.try_recv(),
            Err(picozen_core::error::ZError::ChannelDisconnected)
        ));
    }
}
