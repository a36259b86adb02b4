//! Advanced publisher: numbered samples, a queryable history cache,
//! optional presence token and heartbeats.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use picozen_core::error::{ZError, ZResult};
use picozen_core::handlers::Callback;
use picozen_core::id::EntityGlobalId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::DataInfo;

use crate::advanced::cache::{CachedSample, PublicationCache};
use crate::advanced::parse_sn_range;
use crate::liveliness::LivelinessToken;
use crate::publisher::{Publisher, PublisherOptions};
use crate::queryable::{Query, Queryable, QueryableOptions};
use crate::sample::{SampleKind, SourceInfo, KIND_SENTINEL};
use crate::session::{Session, SessionInner};

/// Options for declaring an advanced publisher.
#[derive(Debug, Clone)]
pub struct AdvancedPublisherOptions {
    /// How many past samples the cache retains.
    pub history_depth: usize,
    /// Declare a liveliness token so late-joining subscribers notice
    /// this publisher.
    pub publisher_detection: bool,
    /// Periodically publish a sentinel carrying the latest sequence
    /// number, so subscribers detect misses without new samples.
    pub heartbeat_period_ms: Option<u64>,
    /// Options of the underlying publisher.
    pub publisher: PublisherOptions,
}

impl Default for AdvancedPublisherOptions {
    fn default() -> Self {
        Self {
            history_depth: 16,
            publisher_detection: false,
            heartbeat_period_ms: None,
            publisher: PublisherOptions::default(),
        }
    }
}

struct AdvPubState {
    egid: EntityGlobalId,
    next_sn: Mutex<u64>,
    cache: Mutex<PublicationCache>,
}

/// A publisher decorated with history and recovery machinery.
pub struct AdvancedPublisher {
    session: Weak<SessionInner>,
    publisher: Publisher,
    state: Arc<AdvPubState>,
    _cache_queryable: Queryable,
    _liveliness: Option<LivelinessToken>,
    heartbeat_task: Option<u32>,
}

impl AdvancedPublisher {
    /// Declare an advanced publisher on `key`.
    pub async fn declare(
        session: &Session,
        key: &KeyExpr,
        options: AdvancedPublisherOptions,
    ) -> ZResult<Self> {
        let publisher = session
            .declare_publisher(key, options.publisher.clone())
            .await?;
        let state = Arc::new(AdvPubState {
            egid: EntityGlobalId {
                zid: session.zid(),
                eid: publisher.id,
            },
            next_sn: Mutex::new(1),
            cache: Mutex::new(PublicationCache::new(options.history_depth)),
        });

        // The cache answers recovery and history queries on the same key.
        let cache_state = state.clone();
        let cache_key = key.clone();
        let cache_callback = Callback::new(move |query: Query| {
            answer_from_cache(&cache_state, &cache_key, &query);
        });
        let cache_queryable = session
            .declare_queryable(key, cache_callback, QueryableOptions { complete: true })
            .await?;

        let liveliness = if options.publisher_detection {
            Some(session.liveliness_declare_token(key).await?)
        } else {
            None
        };

        let heartbeat_task = match options.heartbeat_period_ms {
            Some(period) => {
                let weak = Arc::downgrade(session.inner());
                let beat_state = state.clone();
                let publisher_id = publisher.id;
                let task = session.scheduler().add(
                    move || {
                        let Some(session) = weak.upgrade() else { return };
                        let latest = beat_state.cache.lock().latest_sn();
                        if let Some(sn) = latest {
                            trace!(sn, "publishing heartbeat sentinel");
                            let _ = session.publisher_enqueue(
                                publisher_id,
                                SampleKind::Put,
                                Some(KIND_SENTINEL),
                                Bytes::new(),
                                Some(SourceInfo {
                                    id: beat_state.egid,
                                    sn,
                                }),
                            );
                        }
                    },
                    period,
                )?;
                Some(task)
            }
            None => None,
        };

        Ok(Self {
            session: Arc::downgrade(session.inner()),
            publisher,
            state,
            _cache_queryable: cache_queryable,
            _liveliness: liveliness,
            heartbeat_task,
        })
    }

    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        self.publisher.key_expr()
    }

    /// Sequence number of the next publication.
    #[must_use]
    pub fn next_sn(&self) -> u64 {
        *self.state.next_sn.lock()
    }

    /// Publish a numbered PUT, caching it for recovery.
    pub async fn put(&self, payload: impl Into<Bytes>) -> ZResult<()> {
        self.write(SampleKind::Put, payload.into()).await
    }

    /// Publish a numbered DELETE, caching it for recovery.
    pub async fn delete(&self) -> ZResult<()> {
        self.write(SampleKind::Delete, Bytes::new()).await
    }

    async fn write(&self, kind: SampleKind, payload: Bytes) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        let sn = {
            let mut next = self.state.next_sn.lock();
            let sn = *next;
            *next += 1;
            sn
        };
        self.state.cache.lock().insert(CachedSample {
            sn,
            kind,
            payload: payload.clone(),
            encoding: None,
        });
        session
            .publisher_write(
                self.publisher.id,
                kind,
                payload,
                Some(SourceInfo {
                    id: self.state.egid,
                    sn,
                }),
            )
            .await
    }
}

impl Drop for AdvancedPublisher {
    fn drop(&mut self) {
        if let (Some(session), Some(task)) = (self.session.upgrade(), self.heartbeat_task)
        {
            let _ = session.scheduler().remove(task);
        }
    }
}

fn answer_from_cache(state: &Arc<AdvPubState>, key: &KeyExpr, query: &Query) {
    let (first, last) = parse_sn_range(query.parameters());
    let samples = state.cache.lock().range(first, last);
    trace!(
        count = samples.len(),
        ?first,
        ?last,
        "answering recovery query from cache"
    );
    for cached in samples {
        let info = DataInfo {
            kind: match cached.kind {
                SampleKind::Put => None,
                SampleKind::Delete => Some(cached.kind.to_wire()),
            },
            encoding: cached.encoding,
            timestamp: None,
            source_id: Some(state.egid.zid),
            source_sn: Some(cached.sn),
        };
        let _ = query.reply_info(key, cached.payload, info);
    }
}
