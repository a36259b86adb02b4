//! Advanced subscriber: per-source ordering, miss detection, and
//! recovery queries against publisher caches.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use picozen_core::error::{ZError, ZResult};
use picozen_core::handlers::Callback;
use picozen_core::id::EntityGlobalId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::{ConsolidationMode, QueryTarget};

use crate::advanced::sn_range_params;
use crate::query::GetOptions;
use crate::sample::{Reply, Sample, SampleKind, SentinelNotice};
use crate::session::{Session, SessionInner};
use crate::subscriber::{Subscriber, SubscriberOptions};

/// A detected gap in one publisher's sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissEvent {
    /// The publisher whose samples went missing.
    pub source: EntityGlobalId,
    /// How many sequence numbers are newly known to be missing.
    pub nb: u64,
}

/// Options for declaring an advanced subscriber.
#[derive(Debug, Clone)]
pub struct AdvancedSubscriberOptions {
    /// Query publisher caches for history at declaration time.
    pub history: bool,
    /// Watch publisher liveliness and query history when one appears.
    pub detect_late_publishers: bool,
    /// Issue recovery queries for missing samples every period.
    pub periodic_queries_period_ms: Option<u64>,
    /// Issue a recovery query the moment a miss is detected.
    pub recovery_on_miss: bool,
}

impl Default for AdvancedSubscriberOptions {
    fn default() -> Self {
        Self {
            history: false,
            detect_late_publishers: false,
            periodic_queries_period_ms: None,
            recovery_on_miss: true,
        }
    }
}

#[derive(Default)]
struct SourceState {
    /// Highest sn delivered to the user, contiguous.
    last_delivered: Option<u64>,
    /// Highest sn observed at all: delivered, buffered, or claimed by a
    /// heartbeat sentinel.
    highest_seen: u64,
    /// Out-of-order samples waiting for the gap to fill.
    pending: BTreeMap<u64, Sample>,
}

struct AdvSubState {
    session: Weak<SessionInner>,
    key: KeyExpr,
    user: Callback<Sample>,
    sources: Mutex<HashMap<EntityGlobalId, SourceState>>,
    miss_listener: Mutex<Option<Callback<MissEvent>>>,
    recovery_on_miss: bool,
}

impl AdvSubState {
    /// Feed one sample through ordering and dedup. Runs under the inner
    /// subscriber's callback serialization.
    fn ingest(self: &Arc<Self>, sample: Sample) {
        let Some(si) = sample.source_info else {
            // Un-numbered samples pass straight through.
            self.user.call(sample);
            return;
        };

        let mut deliveries: Vec<Sample> = Vec::new();
        let mut miss: Option<MissEvent> = None;
        let mut recover: Option<(u64, u64)> = None;
        {
            let mut sources = self.sources.lock();
            let src = sources.entry(si.id).or_default();
            match src.last_delivered {
                None => {
                    // First observation sets the baseline.
                    src.last_delivered = Some(si.sn);
                    src.highest_seen = src.highest_seen.max(si.sn);
                    deliveries.push(sample);
                    Self::flush_contiguous(src, &mut deliveries);
                }
                Some(last) if si.sn <= last => {
                    trace!(sn = si.sn, last, "dropping duplicate sample");
                }
                Some(last) if si.sn == last + 1 => {
                    src.last_delivered = Some(si.sn);
                    src.highest_seen = src.highest_seen.max(si.sn);
                    deliveries.push(sample);
                    Self::flush_contiguous(src, &mut deliveries);
                }
                Some(last) => {
                    // Gap: buffer and account the newly missing range.
                    if si.sn > src.highest_seen + 1 {
                        let nb = si.sn - src.highest_seen.max(last) - 1;
                        if nb > 0 {
                            miss = Some(MissEvent { source: si.id, nb });
                        }
                    }
                    src.pending.insert(si.sn, sample);
                    src.highest_seen = src.highest_seen.max(si.sn);
                    if self.recovery_on_miss {
                        recover = Self::missing_range(src);
                    }
                }
            }
        }

        for delivery in deliveries {
            self.user.call(delivery);
        }
        if let Some(event) = miss {
            debug!(source = ?event.source, nb = event.nb, "sample miss detected");
            self.notify_miss(event);
        }
        if let Some((first, last)) = recover {
            self.recovery_query(first, last);
        }
    }

    /// Heartbeat: the publisher claims `sn` is its latest publication.
    fn on_sentinel(self: &Arc<Self>, notice: SentinelNotice) {
        let si = notice.source;
        let mut miss = None;
        let mut recover = None;
        {
            let mut sources = self.sources.lock();
            let src = sources.entry(si.id).or_default();
            match src.last_delivered {
                None => {
                    // No baseline yet; remember the claim and wait for
                    // the first delivery (or a history query).
                    src.highest_seen = src.highest_seen.max(si.sn);
                }
                Some(_) => {
                    if si.sn > src.highest_seen {
                        let nb = si.sn - src.highest_seen;
                        src.highest_seen = si.sn;
                        miss = Some(MissEvent { source: si.id, nb });
                        recover = Self::missing_range(src);
                    }
                }
            }
        }
        if let Some(event) = miss {
            debug!(source = ?event.source, nb = event.nb, "heartbeat revealed a miss");
            self.notify_miss(event);
        }
        if let Some((first, last)) = recover {
            self.recovery_query(first, last);
        }
    }

    fn flush_contiguous(src: &mut SourceState, deliveries: &mut Vec<Sample>) {
        let Some(mut last) = src.last_delivered else { return };
        while let Some(sample) = src.pending.remove(&(last + 1)) {
            last += 1;
            deliveries.push(sample);
        }
        src.last_delivered = Some(last);
        src.highest_seen = src.highest_seen.max(last);
        // Anything at or below the delivery line is stale.
        src.pending = src.pending.split_off(&(last + 1));
    }

    fn missing_range(src: &SourceState) -> Option<(u64, u64)> {
        let last = src.last_delivered?;
        if src.highest_seen > last {
            Some((last + 1, src.highest_seen))
        } else {
            None
        }
    }

    fn notify_miss(&self, event: MissEvent) {
        let listener = self.miss_listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener.call(event);
        }
    }

    /// Ask publisher caches for the missing range. Sync: the query is
    /// queued and rides out with the next flush.
    fn recovery_query(self: &Arc<Self>, first: u64, last: u64) {
        let Some(session) = self.session.upgrade() else { return };
        let state = self.clone();
        let callback = Callback::new(move |reply: Reply| state.ingest(reply.sample));
        let params = sn_range_params(first, last);
        trace!(%params, key = %self.key, "issuing recovery query");
        let _ = session.get_enqueue(
            &self.key,
            &params,
            callback,
            GetOptions {
                target: QueryTarget::All,
                consolidation: ConsolidationMode::None,
                ..GetOptions::default()
            },
        );
    }

    /// Query every matching publisher cache for its full history.
    fn history_query(self: &Arc<Self>) {
        let Some(session) = self.session.upgrade() else { return };
        let state = self.clone();
        let callback = Callback::new(move |reply: Reply| state.ingest(reply.sample));
        debug!(key = %self.key, "issuing history query");
        let _ = session.get_enqueue(
            &self.key,
            "",
            callback,
            GetOptions {
                target: QueryTarget::All,
                consolidation: ConsolidationMode::None,
                ..GetOptions::default()
            },
        );
    }

    /// Periodic recovery sweep over every source with an open gap.
    fn periodic_tick(self: &Arc<Self>) {
        let gaps: Vec<(u64, u64)> = {
            let sources = self.sources.lock();
            sources.values().filter_map(Self::missing_range).collect()
        };
        for (first, last) in gaps {
            self.recovery_query(first, last);
        }
    }
}

/// A subscriber decorated with miss detection and recovery.
pub struct AdvancedSubscriber {
    session: Weak<SessionInner>,
    state: Arc<AdvSubState>,
    _subscriber: Subscriber,
    _liveliness_subscriber: Option<Subscriber>,
    periodic_task: Option<u32>,
}

impl AdvancedSubscriber {
    /// Declare an advanced subscriber on `key`, delivering in-order
    /// samples to `callback`.
    pub async fn declare(
        session: &Session,
        key: &KeyExpr,
        callback: Callback<Sample>,
        options: AdvancedSubscriberOptions,
    ) -> ZResult<Self> {
        let state = Arc::new(AdvSubState {
            session: Arc::downgrade(session.inner()),
            key: key.clone(),
            user: callback,
            sources: Mutex::new(HashMap::new()),
            miss_listener: Mutex::new(None),
            recovery_on_miss: options.recovery_on_miss,
        });

        let ingest_state = state.clone();
        let ingest = Callback::new(move |sample: Sample| ingest_state.ingest(sample));
        let sentinel_state = state.clone();
        let sentinel =
            Callback::new(move |notice: SentinelNotice| sentinel_state.on_sentinel(notice));
        let subscriber = session.inner().declare_subscriber_inner(
            key,
            ingest,
            SubscriberOptions::default(),
            Some(sentinel),
        )?;
        session.inner().flush().await?;

        if options.history {
            state.history_query();
            session.inner().flush().await?;
        }

        let liveliness_subscriber = if options.detect_late_publishers {
            let live_state = state.clone();
            let live_callback = Callback::new(move |sample: Sample| {
                if sample.kind == SampleKind::Put {
                    live_state.history_query();
                }
            });
            Some(
                session
                    .liveliness_declare_subscriber(key, live_callback)
                    .await?,
            )
        } else {
            None
        };

        let periodic_task = match options.periodic_queries_period_ms {
            Some(period) => {
                let tick_state = state.clone();
                Some(
                    session
                        .scheduler()
                        .add(move || tick_state.periodic_tick(), period)?,
                )
            }
            None => None,
        };

        Ok(Self {
            session: Arc::downgrade(session.inner()),
            state,
            _subscriber: subscriber,
            _liveliness_subscriber: liveliness_subscriber,
            periodic_task,
        })
    }

    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.state.key
    }

    /// Register the listener receiving miss events. Replaces any
    /// previous listener, whose drop hook runs now.
    pub fn declare_miss_listener(&self, callback: Callback<MissEvent>) {
        *self.state.miss_listener.lock() = Some(callback);
    }
}

impl Drop for AdvancedSubscriber {
    fn drop(&mut self) {
        if let (Some(session), Some(task)) = (self.session.upgrade(), self.periodic_task) {
            let _ = session.scheduler().remove(task);
        }
    }
}
