//! The session: owner of the transport, the declaration registries, and
//! every dispatch path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use picozen_core::error::{ZError, ZResult};
use picozen_core::handlers::Callback;
use picozen_core::id::{EntityId, WhatAmI, ZenohId};
use picozen_core::keyexpr::KeyExpr;
use picozen_core::link::LinkManager;
use picozen_core::scheduler::PeriodicScheduler;
use picozen_proto::network::{
    DataInfo, Declaration, Encoding, NetworkBody, NetworkMessage, QueryTarget,
    QueryableInfo, ReplyContext, SubInfo, Timestamp, WireExpr,
};
use picozen_proto::transport::close_reason;

use crate::admin::{admin_prefix, LinkAdminEntry, TransportAdminEntry};
use crate::config::{defaults, Config};
use crate::connectivity::{
    ConnectivityEventKind, LinkEvent, LinkInfo, ListenerHandle, TransportEvent,
    TransportVariant,
};
use crate::liveliness::{prefixed as liveliness_key, LivelinessToken};
use crate::publisher::{Publisher, PublisherOptions, PublisherState};
use crate::query::{resolve_consolidation, GetOptions, PendingQuery, PendingQueryRef};
use crate::queryable::{Query, Queryable, QueryableOptions, QueryableState};
use crate::sample::{Reply, Sample, SampleKind, SourceInfo, KIND_SENTINEL};
use crate::scouting::scout_for_locator;
use crate::subscriber::{Subscriber, SubscriberOptions, SubscriberState};
use crate::transport::multicast::TransportMulticast;
use crate::transport::unicast::{
    accept_handshake, open_handshake, TransportUnicast,
};
use crate::transport::now_ms;

/// NTP64 wall-clock timestamp.
fn ntp64_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_epoch.as_secs() << 32)
        | (u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000
}

// ---------------------------------------------------------------------------
// Transport container
// ---------------------------------------------------------------------------

pub(crate) struct Transports {
    unicast: Mutex<Vec<Arc<TransportUnicast>>>,
    multicast: Mutex<Option<Arc<TransportMulticast>>>,
}

impl Transports {
    fn new() -> Self {
        Self {
            unicast: Mutex::new(Vec::new()),
            multicast: Mutex::new(None),
        }
    }

    fn unicast_snapshot(&self) -> Vec<Arc<TransportUnicast>> {
        self.unicast.lock().clone()
    }

    fn multicast_handle(&self) -> Option<Arc<TransportMulticast>> {
        self.multicast.lock().clone()
    }

    fn is_empty(&self) -> bool {
        self.unicast.lock().is_empty() && self.multicast.lock().is_none()
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct SessionState {
    next_entity_id: EntityId,
    next_rid: u64,
    next_qid: u64,
    /// Locally declared resource aliases.
    local_resources: HashMap<u64, KeyExpr>,
    /// Resource aliases declared by remote peers, keyed by (peer, rid).
    remote_resources: HashMap<(ZenohId, u64), KeyExpr>,
    subscribers: HashMap<EntityId, Arc<SubscriberState>>,
    queryables: HashMap<EntityId, Arc<QueryableState>>,
    publishers: HashMap<EntityId, PublisherState>,
    /// Liveliness tokens: entity id to the prefixed keyexpr.
    tokens: HashMap<EntityId, KeyExpr>,
    pending_queries: HashMap<u64, PendingQueryRef>,
    transport_listeners: HashMap<EntityId, Arc<Callback<TransportEvent>>>,
    link_listeners: HashMap<EntityId, Arc<Callback<LinkEvent>>>,
    admin_queryable: Option<EntityId>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            next_entity_id: 1,
            next_rid: 1,
            next_qid: 1,
            local_resources: HashMap::new(),
            remote_resources: HashMap::new(),
            subscribers: HashMap::new(),
            queryables: HashMap::new(),
            publishers: HashMap::new(),
            tokens: HashMap::new(),
            pending_queries: HashMap::new(),
            transport_listeners: HashMap::new(),
            link_listeners: HashMap::new(),
            admin_queryable: None,
        }
    }

    fn alloc_entity_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id = self.next_entity_id.wrapping_add(1).max(1);
        id
    }

    fn alloc_rid(&mut self) -> u64 {
        let rid = self.next_rid;
        self.next_rid += 1;
        rid
    }

    fn alloc_qid(&mut self) -> u64 {
        let qid = self.next_qid;
        self.next_qid += 1;
        qid
    }
}

pub(crate) struct SessionInner {
    zid: ZenohId,
    whatami: WhatAmI,
    config: Config,
    state: Mutex<SessionState>,
    transports: Transports,
    scheduler: PeriodicScheduler,
    closed: AtomicBool,
    tasks: Mutex<Vec<compio::runtime::Task<()>>>,
}

/// A picozen session.
///
/// Cheap to clone; the underlying state lives until every clone and
/// every in-flight callback context is gone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    // -- lifecycle ---------------------------------------------------------

    /// Open a session per `config`, resolving links through
    /// `link_manager`.
    pub async fn open(
        config: Config,
        link_manager: Arc<dyn LinkManager>,
    ) -> ZResult<Session> {
        let zid = ZenohId::random();
        let whatami = config.mode;
        debug!(%zid, ?whatami, "opening session");

        let inner = Arc::new(SessionInner {
            zid,
            whatami,
            config,
            state: Mutex::new(SessionState::new()),
            transports: Transports::new(),
            scheduler: PeriodicScheduler::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        inner.establish_transports(&link_manager).await?;
        inner.register_housekeeping();

        let session = Session {
            inner: inner.clone(),
        };
        if inner.config.background_tasks {
            inner.spawn_background(&link_manager);
        }
        if inner.config.auto_start_admin_space {
            session.start_admin_space().await?;
        }
        Ok(session)
    }

    /// Close the session: announce dying liveliness tokens, close every
    /// transport, release every declaration, and unblock every handler.
    pub async fn close(&self) -> ZResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        debug!(zid = %self.inner.zid, "closing session");

        // Withdraw liveliness tokens while the wire is still up.
        let tokens: Vec<KeyExpr> = {
            let state = self.inner.state.lock();
            state.tokens.values().cloned().collect()
        };
        for key in tokens {
            let _ = self
                .inner
                .write_data(
                    WireExpr::literal(key.as_str()),
                    SampleKind::Delete,
                    Bytes::new(),
                    None,
                    None,
                    true,
                )
                .await;
        }

        for transport in self.inner.transports.unicast_snapshot() {
            transport
                .close(&self.inner, close_reason::GENERIC, true)
                .await;
        }
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            multicast
                .close(&self.inner, close_reason::GENERIC, true)
                .await;
        }
        self.inner.close_local();
        Ok(())
    }

    #[must_use]
    pub fn zid(&self) -> ZenohId {
        self.inner.zid
    }

    #[must_use]
    pub fn whatami(&self) -> WhatAmI {
        self.inner.whatami
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Adopt an incoming link accepted by the application: run the
    /// passive handshake and register the resulting unicast transport.
    ///
    /// Cooperative deployments pair this with their own accept loop; in
    /// background mode the `listener` locator does the same automatically.
    pub async fn accept_link(
        &self,
        link: Arc<dyn picozen_core::link::Link>,
    ) -> ZResult<()> {
        let negotiated = accept_handshake(&link, &self.inner.config, self.inner.zid).await?;
        let transport = TransportUnicast::new(link, negotiated);
        self.inner.register_unicast(transport)
    }

    // -- cooperative drive -------------------------------------------------

    /// Drive one receive step. Single-threaded applications call this in
    /// their main loop instead of enabling background tasks.
    pub async fn read_once(&self) -> ZResult<()> {
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            return multicast.read_once(&self.inner).await;
        }
        let unicast = self.inner.transports.unicast_snapshot();
        match unicast.first() {
            Some(transport) => transport.read_once(&self.inner).await,
            None => Err(ZError::TransportNotAvailable),
        }
    }

    /// Emit a keep-alive on every transport immediately.
    pub async fn send_keep_alive(&self) -> ZResult<()> {
        let msg = picozen_proto::transport::TransportMessage::make_keep_alive();
        for transport in self.inner.transports.unicast_snapshot() {
            transport.tx.enqueue_transport(&msg)?;
        }
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            multicast.tx.enqueue_transport(&msg)?;
        }
        self.inner.flush().await
    }

    /// Run every due periodic task, then flush whatever they queued.
    /// Returns the number of tasks fired.
    pub async fn process_periodic_tasks(&self) -> usize {
        let fired = self.inner.scheduler.process_tasks();
        let _ = self.inner.flush().await;
        fired
    }

    // -- batching ----------------------------------------------------------

    /// Defer per-message flushing: publications accumulate into one
    /// frame until `batch_flush`/`batch_stop` or the batch fills up.
    pub fn batch_start(&self) {
        for transport in self.inner.transports.unicast_snapshot() {
            transport.tx.batch_start();
        }
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            multicast.tx.batch_start();
        }
    }

    /// Emit the open batch without leaving batching mode.
    pub async fn batch_flush(&self) -> ZResult<()> {
        for transport in self.inner.transports.unicast_snapshot() {
            transport.tx.batch_flush()?;
        }
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            multicast.tx.batch_flush()?;
        }
        self.inner.flush().await
    }

    /// Emit the open batch and return to per-message flushing.
    pub async fn batch_stop(&self) -> ZResult<()> {
        for transport in self.inner.transports.unicast_snapshot() {
            transport.tx.batch_stop()?;
        }
        if let Some(multicast) = self.inner.transports.multicast_handle() {
            multicast.tx.batch_stop()?;
        }
        self.inner.flush().await
    }

    // -- declarations ------------------------------------------------------

    /// Declare a numeric alias for `key`, so later messages can cite it.
    pub async fn declare_keyexpr(&self, key: &KeyExpr) -> ZResult<u64> {
        let rid = self.inner.declare_resource(key)?;
        self.inner.flush().await?;
        Ok(rid)
    }

    /// Undeclare a previously declared alias.
    pub async fn undeclare_keyexpr(&self, rid: u64) -> ZResult<()> {
        self.inner.undeclare_resource(rid)?;
        self.inner.flush().await
    }

    pub async fn declare_subscriber(
        &self,
        key: &KeyExpr,
        callback: Callback<Sample>,
        options: SubscriberOptions,
    ) -> ZResult<Subscriber> {
        let sub = self
            .inner
            .declare_subscriber_inner(key, callback, options, None)?;
        self.inner.flush().await?;
        Ok(sub)
    }

    pub async fn declare_publisher(
        &self,
        key: &KeyExpr,
        options: PublisherOptions,
    ) -> ZResult<Publisher> {
        let publisher = self.inner.declare_publisher_inner(key, options)?;
        self.inner.flush().await?;
        Ok(publisher)
    }

    pub async fn declare_queryable(
        &self,
        key: &KeyExpr,
        callback: Callback<Query>,
        options: QueryableOptions,
    ) -> ZResult<Queryable> {
        let queryable = self
            .inner
            .declare_queryable_inner(key, callback, options)?;
        self.inner.flush().await?;
        Ok(queryable)
    }

    // -- publication -------------------------------------------------------

    /// One-shot PUT on `key`.
    pub async fn put(
        &self,
        key: &KeyExpr,
        payload: impl Into<Bytes>,
        options: PublisherOptions,
    ) -> ZResult<()> {
        let info_encoding = if options.encoding == Encoding::default() {
            None
        } else {
            Some(options.encoding.clone())
        };
        self.inner
            .write_data(
                WireExpr::literal(key.as_str()),
                SampleKind::Put,
                payload.into(),
                info_encoding,
                None,
                options.droppable,
            )
            .await
    }

    /// One-shot DELETE on `key`.
    pub async fn delete(&self, key: &KeyExpr) -> ZResult<()> {
        self.inner
            .write_data(
                WireExpr::literal(key.as_str()),
                SampleKind::Delete,
                Bytes::new(),
                None,
                None,
                false,
            )
            .await
    }

    // -- queries -----------------------------------------------------------

    /// Issue a query; replies flow to `callback` until the final marker
    /// or the deadline, after which the callback is dropped.
    pub async fn get(
        &self,
        key: &KeyExpr,
        parameters: &str,
        callback: Callback<Reply>,
        options: GetOptions,
    ) -> ZResult<()> {
        self.inner.get(key, parameters, callback, options).await
    }

    // -- liveliness --------------------------------------------------------

    /// Declare a liveliness token on `key`.
    pub async fn liveliness_declare_token(
        &self,
        key: &KeyExpr,
    ) -> ZResult<LivelinessToken> {
        let token = self.inner.declare_liveliness_token(key)?;
        self.inner.flush().await?;
        Ok(token)
    }

    /// Observe liveliness changes matching `key`.
    pub async fn liveliness_declare_subscriber(
        &self,
        key: &KeyExpr,
        callback: Callback<Sample>,
    ) -> ZResult<Subscriber> {
        let prefixed = liveliness_key(key)?;
        self.declare_subscriber(&prefixed, callback, SubscriberOptions::default())
            .await
    }

    // -- connectivity ------------------------------------------------------

    /// Register a listener for transport-peer PUT/DELETE events.
    pub fn declare_transport_events_listener(
        &self,
        callback: Callback<TransportEvent>,
        history: bool,
    ) -> ZResult<ListenerHandle> {
        self.inner.declare_transport_listener(callback, history)
    }

    /// Register a listener for link PUT/DELETE events.
    pub fn declare_link_events_listener(
        &self,
        callback: Callback<LinkEvent>,
        history: bool,
    ) -> ZResult<ListenerHandle> {
        self.inner.declare_link_listener(callback, history)
    }

    // -- admin space -------------------------------------------------------

    /// Declare the admin-space queryable at `@/<zid>/pico/session/**`.
    pub async fn start_admin_space(&self) -> ZResult<()> {
        self.inner.start_admin_space()?;
        self.inner.flush().await
    }

    pub(crate) fn scheduler(&self) -> &PeriodicScheduler {
        &self.inner.scheduler
    }
}

// ---------------------------------------------------------------------------
// SessionInner: transports
// ---------------------------------------------------------------------------

impl SessionInner {
    pub(crate) fn zid(&self) -> ZenohId {
        self.zid
    }

    pub(crate) fn whatami(&self) -> WhatAmI {
        self.whatami
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &PeriodicScheduler {
        &self.scheduler
    }

    fn ensure_open(&self) -> ZResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ZError::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn establish_transports(
        self: &Arc<Self>,
        link_manager: &Arc<dyn LinkManager>,
    ) -> ZResult<()> {
        match self.whatami {
            WhatAmI::Router => {
                return Err(ZError::Config("router is not a supported local role".into()))
            }
            WhatAmI::Client => {
                let locator = match (&self.config.connect, self.config.multicast_scouting)
                {
                    (Some(locator), _) => locator.clone(),
                    (None, true) => {
                        scout_for_locator(&self.config, link_manager, self.zid).await?
                    }
                    (None, false) => {
                        return Err(ZError::open_failed(
                            "client mode needs a connect locator or multicast scouting",
                        ))
                    }
                };
                self.connect_unicast(link_manager, &locator).await?;
            }
            WhatAmI::Peer => {
                if let Some(locator) = self.config.connect.clone() {
                    self.connect_unicast(link_manager, &locator).await?;
                } else if self.config.multicast_scouting {
                    let link = link_manager.open_link(&self.config.multicast_address).await?;
                    let multicast = TransportMulticast::new(link);
                    multicast.join_tick(self);
                    multicast.tx.flush().await?;
                    *self.transports.multicast.lock() = Some(multicast);
                }
                // A peer with neither connect nor multicast stays local
                // until something dials its listener.
            }
        }
        Ok(())
    }

    async fn connect_unicast(
        self: &Arc<Self>,
        link_manager: &Arc<dyn LinkManager>,
        locator: &picozen_core::locator::Locator,
    ) -> ZResult<()> {
        let link = link_manager.open_link(locator).await?;
        let negotiated = match open_handshake(&link, &self.config, self.zid).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };
        let transport = TransportUnicast::new(link, negotiated);
        self.register_unicast(transport)
    }

    fn register_unicast(self: &Arc<Self>, transport: Arc<TransportUnicast>) -> ZResult<()> {
        {
            let mut unicast = self.transports.unicast.lock();
            if unicast.len() >= defaults::MAX_PEERS {
                return Err(ZError::open_failed("too many unicast peers"));
            }
            unicast.push(transport.clone());
        }
        self.emit_transport_event(TransportEvent {
            kind: ConnectivityEventKind::Put,
            variant: TransportVariant::Unicast,
            zid: transport.remote_zid,
            whatami: Some(transport.remote_whatami),
        });
        self.emit_link_event(LinkEvent {
            kind: ConnectivityEventKind::Put,
            zid: transport.remote_zid,
            link: link_info(transport.tx.link()),
        });
        Ok(())
    }

    fn register_housekeeping(self: &Arc<Self>) {
        let keep_alive = self.config.keep_alive_interval_ms().max(1);

        let weak = Arc::downgrade(self);
        let _ = self.scheduler.add(
            move || {
                if let Some(session) = weak.upgrade() {
                    for transport in session.transports.unicast_snapshot() {
                        transport.lease_tick(keep_alive);
                    }
                }
            },
            keep_alive,
        );

        if self.transports.multicast.lock().is_some() {
            let weak = Arc::downgrade(self);
            let _ = self.scheduler.add(
                move || {
                    if let Some(session) = weak.upgrade() {
                        if let Some(multicast) = session.transports.multicast_handle() {
                            multicast.join_tick(&session);
                        }
                    }
                },
                defaults::JOIN_INTERVAL_MS,
            );
            let weak = Arc::downgrade(self);
            let _ = self.scheduler.add(
                move || {
                    if let Some(session) = weak.upgrade() {
                        if let Some(multicast) = session.transports.multicast_handle() {
                            multicast.lease_tick(&session);
                        }
                    }
                },
                keep_alive,
            );
        }

        // Query deadline sweeper.
        let weak = Arc::downgrade(self);
        let _ = self.scheduler.add(
            move || {
                if let Some(session) = weak.upgrade() {
                    session.sweep_expired_queries();
                }
            },
            100,
        );
    }

    fn spawn_background(self: &Arc<Self>, link_manager: &Arc<dyn LinkManager>) {
        let mut tasks = Vec::new();

        for transport in self.transports.unicast_snapshot() {
            tasks.push(spawn_unicast_read(Arc::downgrade(self), transport));
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            let weak = Arc::downgrade(self);
            tasks.push(compio::runtime::spawn(async move {
                loop {
                    let Some(session) = weak.upgrade() else { break };
                    if multicast.read_once(&session).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Scheduler driver: periodic tasks plus the write flush they queue.
        let weak = Arc::downgrade(self);
        let poll = self.config.scheduler_poll_ms.max(1);
        tasks.push(compio::runtime::spawn(async move {
            loop {
                compio::time::sleep(std::time::Duration::from_millis(poll)).await;
                let Some(session) = weak.upgrade() else { break };
                if session.closed.load(Ordering::Acquire) {
                    break;
                }
                session.scheduler.process_tasks();
                let _ = session.flush().await;
            }
        }));

        // Unicast listener: accept incoming peers.
        if let Some(listen_locator) = self.config.listener.clone() {
            let weak = Arc::downgrade(self);
            let link_manager = link_manager.clone();
            tasks.push(compio::runtime::spawn(async move {
                let mut listener = match link_manager.listen(&listen_locator).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(error = %e, "failed to listen for incoming links");
                        return;
                    }
                };
                loop {
                    let Ok(link) = listener.accept().await else { break };
                    let Some(session) = weak.upgrade() else { break };
                    match accept_handshake(&link, &session.config, session.zid).await {
                        Ok(negotiated) => {
                            let transport = TransportUnicast::new(link, negotiated);
                            if session.register_unicast(transport.clone()).is_ok() {
                                let task = spawn_unicast_read(
                                    Arc::downgrade(&session),
                                    transport,
                                );
                                session.tasks.lock().push(task);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "incoming handshake failed");
                            let _ = link.close().await;
                        }
                    }
                }
            }));
        }

        self.tasks.lock().extend(tasks);
    }

    /// Flush queued wire blobs on every transport.
    pub(crate) async fn flush(&self) -> ZResult<()> {
        for transport in self.transports.unicast_snapshot() {
            transport.tx.flush().await?;
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            multicast.tx.flush().await?;
        }
        Ok(())
    }

    fn has_wire_transport(&self) -> bool {
        !self.transports.is_empty()
    }

    /// Queue a network message on every transport without flushing.
    fn enqueue_network(&self, msg: &NetworkMessage, reliable: bool) -> ZResult<()> {
        self.ensure_open()?;
        for transport in self.transports.unicast_snapshot() {
            if let Err(e) = transport.tx.enqueue_network(msg, reliable) {
                if e.is_recoverable() {
                    warn!(error = %e, "dropping message on congested transport");
                } else {
                    return Err(e);
                }
            }
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            if let Err(e) = multicast.tx.enqueue_network(msg, reliable) {
                if e.is_recoverable() {
                    warn!(error = %e, "dropping message on multicast transport");
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn send_network(&self, msg: &NetworkMessage, reliable: bool) -> ZResult<()> {
        self.enqueue_network(msg, reliable)?;
        self.flush().await
    }

    // -- transport lifecycle callbacks ------------------------------------

    pub(crate) fn on_transport_down(self: &Arc<Self>, zid: ZenohId, reason: u8) {
        debug!(%zid, reason, "unicast transport down");
        let mut link: Option<LinkInfo> = None;
        {
            let mut unicast = self.transports.unicast.lock();
            if let Some(pos) = unicast.iter().position(|t| t.remote_zid == zid) {
                let transport = unicast.swap_remove(pos);
                link = Some(link_info(transport.tx.link()));
            }
        }
        if let Some(link) = link {
            self.emit_link_event(LinkEvent {
                kind: ConnectivityEventKind::Delete,
                zid,
                link,
            });
        }
        self.emit_transport_event(TransportEvent {
            kind: ConnectivityEventKind::Delete,
            variant: TransportVariant::Unicast,
            zid,
            whatami: None,
        });
        // Forget the peer's resource aliases.
        {
            let mut state = self.state.lock();
            state.remote_resources.retain(|(peer, _), _| *peer != zid);
        }
        if self.transports.is_empty() && self.whatami == WhatAmI::Client {
            self.close_local();
        }
    }

    pub(crate) fn on_multicast_peer_up(self: &Arc<Self>, zid: ZenohId, whatami: WhatAmI) {
        self.emit_transport_event(TransportEvent {
            kind: ConnectivityEventKind::Put,
            variant: TransportVariant::Multicast,
            zid,
            whatami: Some(whatami),
        });
    }

    pub(crate) fn on_multicast_peer_down(self: &Arc<Self>, zid: ZenohId) {
        {
            let mut state = self.state.lock();
            state.remote_resources.retain(|(peer, _), _| *peer != zid);
        }
        self.emit_transport_event(TransportEvent {
            kind: ConnectivityEventKind::Delete,
            variant: TransportVariant::Multicast,
            zid,
            whatami: None,
        });
    }

    pub(crate) fn on_transport_closed(self: &Arc<Self>) {
        *self.transports.multicast.lock() = None;
        if self.transports.is_empty() && self.whatami == WhatAmI::Client {
            self.close_local();
        }
    }

    /// Tear down all local state: every handler unblocks, every drop
    /// hook runs exactly once.
    pub(crate) fn close_local(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(zid = %self.zid, "releasing session state");
        self.scheduler.clear();

        // Local liveliness observers see the tokens die.
        let tokens: Vec<KeyExpr> = {
            let state = self.state.lock();
            state.tokens.values().cloned().collect()
        };
        for key in tokens {
            self.loopback_sample(&key, SampleKind::Delete, Bytes::new(), None, None);
        }

        let (subscribers, queryables, pending, transport_listeners, link_listeners) = {
            let mut state = self.state.lock();
            state.publishers.clear();
            state.tokens.clear();
            state.local_resources.clear();
            state.remote_resources.clear();
            state.admin_queryable = None;
            (
                state.subscribers.drain().collect::<Vec<_>>(),
                state.queryables.drain().collect::<Vec<_>>(),
                state.pending_queries.drain().collect::<Vec<_>>(),
                state.transport_listeners.drain().collect::<Vec<_>>(),
                state.link_listeners.drain().collect::<Vec<_>>(),
            )
        };
        // Dropping outside the lock runs user drop hooks and disconnects
        // handler channels.
        drop(subscribers);
        drop(queryables);
        drop(pending);
        drop(transport_listeners);
        drop(link_listeners);
    }

    // -- connectivity listeners -------------------------------------------

    fn declare_transport_listener(
        self: &Arc<Self>,
        callback: Callback<TransportEvent>,
        history: bool,
    ) -> ZResult<ListenerHandle> {
        self.ensure_open()?;
        let callback = Arc::new(callback);
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.transport_listeners.insert(id, callback.clone());
            id
        };
        if history {
            for event in self.current_transport_events() {
                callback.call(event);
            }
        }
        Ok(ListenerHandle {
            session: Arc::downgrade(self),
            id,
            link_listener: false,
        })
    }

    fn declare_link_listener(
        self: &Arc<Self>,
        callback: Callback<LinkEvent>,
        history: bool,
    ) -> ZResult<ListenerHandle> {
        self.ensure_open()?;
        let callback = Arc::new(callback);
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.link_listeners.insert(id, callback.clone());
            id
        };
        if history {
            for transport in self.transports.unicast_snapshot() {
                callback.call(LinkEvent {
                    kind: ConnectivityEventKind::Put,
                    zid: transport.remote_zid,
                    link: link_info(transport.tx.link()),
                });
            }
        }
        Ok(ListenerHandle {
            session: Arc::downgrade(self),
            id,
            link_listener: true,
        })
    }

    pub(crate) fn remove_connectivity_listener(&self, id: EntityId, link_listener: bool) {
        let mut state = self.state.lock();
        if link_listener {
            state.link_listeners.remove(&id);
        } else {
            state.transport_listeners.remove(&id);
        }
    }

    fn current_transport_events(&self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for transport in self.transports.unicast_snapshot() {
            events.push(TransportEvent {
                kind: ConnectivityEventKind::Put,
                variant: TransportVariant::Unicast,
                zid: transport.remote_zid,
                whatami: Some(transport.remote_whatami),
            });
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            for (zid, whatami) in multicast.peers_snapshot() {
                events.push(TransportEvent {
                    kind: ConnectivityEventKind::Put,
                    variant: TransportVariant::Multicast,
                    zid,
                    whatami: Some(whatami),
                });
            }
        }
        events
    }

    fn emit_transport_event(&self, event: TransportEvent) {
        let listeners: Vec<Arc<Callback<TransportEvent>>> = {
            let state = self.state.lock();
            state.transport_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.call(event.clone());
        }
    }

    fn emit_link_event(&self, event: LinkEvent) {
        let listeners: Vec<Arc<Callback<LinkEvent>>> = {
            let state = self.state.lock();
            state.link_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.call(event.clone());
        }
    }

    // -- declarations ------------------------------------------------------

    fn declare_resource(&self, key: &KeyExpr) -> ZResult<u64> {
        self.ensure_open()?;
        let rid = {
            let mut state = self.state.lock();
            let rid = state.alloc_rid();
            state.local_resources.insert(rid, key.clone());
            rid
        };
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::Resource {
                rid,
                key: WireExpr::literal(key.as_str()),
            }]),
            true,
        )?;
        Ok(rid)
    }

    fn undeclare_resource(&self, rid: u64) -> ZResult<()> {
        let removed = self.state.lock().local_resources.remove(&rid);
        if removed.is_none() {
            return Err(ZError::UnknownDeclaration(rid as u32));
        }
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::ForgetResource { rid }]),
            true,
        )
    }

    pub(crate) fn declare_subscriber_inner(
        self: &Arc<Self>,
        key: &KeyExpr,
        callback: Callback<Sample>,
        options: SubscriberOptions,
        sentinel: Option<Callback<crate::sample::SentinelNotice>>,
    ) -> ZResult<Subscriber> {
        self.ensure_open()?;
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.subscribers.insert(
                id,
                Arc::new(SubscriberState {
                    key: key.clone(),
                    callback,
                    sentinel,
                }),
            );
            id
        };
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::Subscriber {
                key: WireExpr::literal(key.as_str()),
                info: SubInfo {
                    reliability: options.reliability,
                    ..SubInfo::default()
                },
            }]),
            true,
        )?;
        trace!(%key, id, "subscriber declared");
        Ok(Subscriber {
            session: Arc::downgrade(self),
            id,
            key: key.clone(),
        })
    }

    pub(crate) fn undeclare_subscriber(&self, id: EntityId) -> ZResult<()> {
        let removed = self.state.lock().subscribers.remove(&id);
        let Some(sub) = removed else {
            return Err(ZError::UnknownDeclaration(id));
        };
        let key = sub.key.clone();
        // Dropping outside the lock runs the callback's drop hook.
        drop(sub);
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::ForgetSubscriber {
                key: WireExpr::literal(key.as_str()),
            }]),
            true,
        )
        .or(Ok(()))
    }

    pub(crate) fn declare_publisher_inner(
        self: &Arc<Self>,
        key: &KeyExpr,
        options: PublisherOptions,
    ) -> ZResult<Publisher> {
        self.ensure_open()?;
        let rid = self.declare_resource(key)?;
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.publishers.insert(id, PublisherState { rid, options });
            id
        };
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::Publisher {
                key: WireExpr::aliased(rid, String::new()),
            }]),
            true,
        )?;
        trace!(%key, id, rid, "publisher declared");
        Ok(Publisher {
            session: Arc::downgrade(self),
            id,
            key: key.clone(),
        })
    }

    pub(crate) fn undeclare_publisher(&self, id: EntityId) -> ZResult<()> {
        let removed = self.state.lock().publishers.remove(&id);
        let Some(publisher) = removed else {
            return Err(ZError::UnknownDeclaration(id));
        };
        let _ = self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::ForgetPublisher {
                key: WireExpr::aliased(publisher.rid, String::new()),
            }]),
            true,
        );
        self.undeclare_resource(publisher.rid).or(Ok(()))
    }

    pub(crate) fn declare_queryable_inner(
        self: &Arc<Self>,
        key: &KeyExpr,
        callback: Callback<Query>,
        options: QueryableOptions,
    ) -> ZResult<Queryable> {
        self.ensure_open()?;
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.queryables.insert(
                id,
                Arc::new(QueryableState {
                    key: key.clone(),
                    complete: options.complete,
                    callback,
                }),
            );
            id
        };
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::Queryable {
                key: WireExpr::literal(key.as_str()),
                info: QueryableInfo {
                    complete: u64::from(options.complete),
                    distance: 0,
                },
            }]),
            true,
        )?;
        trace!(%key, id, "queryable declared");
        Ok(Queryable {
            session: Arc::downgrade(self),
            id,
            key: key.clone(),
        })
    }

    pub(crate) fn undeclare_queryable(&self, id: EntityId) -> ZResult<()> {
        let removed = self.state.lock().queryables.remove(&id);
        let Some(queryable) = removed else {
            return Err(ZError::UnknownDeclaration(id));
        };
        let key = queryable.key.clone();
        drop(queryable);
        self.enqueue_network(
            &NetworkMessage::make_declare(vec![Declaration::ForgetQueryable {
                key: WireExpr::literal(key.as_str()),
            }]),
            true,
        )
        .or(Ok(()))
    }

    fn declare_liveliness_token(self: &Arc<Self>, key: &KeyExpr) -> ZResult<LivelinessToken> {
        self.ensure_open()?;
        let prefixed = liveliness_key(key)?;
        let id = {
            let mut state = self.state.lock();
            let id = state.alloc_entity_id();
            state.tokens.insert(id, prefixed.clone());
            id
        };
        self.enqueue_data(
            WireExpr::literal(prefixed.as_str()),
            SampleKind::Put,
            Bytes::new(),
            None,
            None,
            false,
        )?;
        Ok(LivelinessToken {
            session: Arc::downgrade(self),
            id,
            key: key.clone(),
        })
    }

    pub(crate) fn undeclare_liveliness_token(self: &Arc<Self>, id: EntityId) -> ZResult<()> {
        let removed = self.state.lock().tokens.remove(&id);
        let Some(key) = removed else {
            return Err(ZError::UnknownDeclaration(id));
        };
        self.enqueue_data(
            WireExpr::literal(key.as_str()),
            SampleKind::Delete,
            Bytes::new(),
            None,
            None,
            false,
        )
        .or(Ok(()))
    }

    // -- publication paths -------------------------------------------------

    fn build_data_info(
        &self,
        kind: SampleKind,
        kind_override: Option<u64>,
        encoding: Option<Encoding>,
        source_info: Option<SourceInfo>,
    ) -> Option<DataInfo> {
        let mut info = DataInfo {
            kind: kind_override.or(match kind {
                SampleKind::Put => None,
                SampleKind::Delete => Some(kind.to_wire()),
            }),
            encoding,
            timestamp: None,
            source_id: source_info.map(|s| s.id.zid),
            source_sn: source_info.map(|s| s.sn),
        };
        if self.config.add_timestamp {
            info.timestamp = Some(Timestamp {
                time: ntp64_now(),
                id: self.zid,
            });
        }
        if info.is_empty() {
            None
        } else {
            Some(info)
        }
    }

    /// Queue a Data publication and loop it back locally. Sync, so drop
    /// paths and scheduler callbacks can publish.
    pub(crate) fn enqueue_data(
        self: &Arc<Self>,
        key: WireExpr,
        kind: SampleKind,
        payload: Bytes,
        encoding: Option<Encoding>,
        source_info: Option<SourceInfo>,
        droppable: bool,
    ) -> ZResult<()> {
        self.enqueue_data_with_kind(
            key,
            kind,
            None,
            payload,
            encoding,
            source_info,
            droppable,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue_data_with_kind(
        self: &Arc<Self>,
        key: WireExpr,
        kind: SampleKind,
        kind_override: Option<u64>,
        payload: Bytes,
        encoding: Option<Encoding>,
        source_info: Option<SourceInfo>,
        droppable: bool,
    ) -> ZResult<()> {
        self.ensure_open()?;
        let info = self.build_data_info(kind, kind_override, encoding.clone(), source_info);
        let msg = NetworkMessage::make_data(key.clone(), info, payload.clone(), droppable);
        self.enqueue_network(&msg, !droppable)?;

        if self.config.local_subscriber {
            // Looped-back samples carry the same source identity shape as
            // wire samples, whose info has no entity id.
            let source_info = source_info.map(|si| SourceInfo {
                id: picozen_core::id::EntityGlobalId {
                    zid: si.id.zid,
                    eid: 0,
                },
                sn: si.sn,
            });
            if let Ok(resolved) = self.resolve_wire_expr(&key, None) {
                if kind_override == Some(KIND_SENTINEL) {
                    self.dispatch_sentinel(&resolved, source_info);
                } else {
                    self.loopback_sample(&resolved, kind, payload, encoding, source_info);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn write_data(
        self: &Arc<Self>,
        key: WireExpr,
        kind: SampleKind,
        payload: Bytes,
        encoding: Option<Encoding>,
        source_info: Option<SourceInfo>,
        droppable: bool,
    ) -> ZResult<()> {
        self.enqueue_data(key, kind, payload, encoding, source_info, droppable)?;
        self.flush().await
    }

    /// Publication through a declared publisher: cites the resource
    /// alias and applies the publisher's options.
    pub(crate) fn publisher_enqueue(
        self: &Arc<Self>,
        id: EntityId,
        kind: SampleKind,
        kind_override: Option<u64>,
        payload: Bytes,
        source_info: Option<SourceInfo>,
    ) -> ZResult<()> {
        let (rid, options) = {
            let state = self.state.lock();
            let publisher = state
                .publishers
                .get(&id)
                .ok_or(ZError::UnknownDeclaration(id))?;
            (publisher.rid, publisher.options.clone())
        };
        let encoding = if options.encoding == Encoding::default() {
            None
        } else {
            Some(options.encoding)
        };
        self.enqueue_data_with_kind(
            WireExpr::aliased(rid, String::new()),
            kind,
            kind_override,
            payload,
            encoding,
            source_info,
            options.droppable,
        )
    }

    pub(crate) async fn publisher_write(
        self: &Arc<Self>,
        id: EntityId,
        kind: SampleKind,
        payload: Bytes,
        source_info: Option<SourceInfo>,
    ) -> ZResult<()> {
        self.publisher_enqueue(id, kind, None, payload, source_info)?;
        self.flush().await
    }

    // -- keyexpr resolution ------------------------------------------------

    /// Expand a wire expression into the canonical absolute keyexpr,
    /// against the declaring peer's alias table (`source`) or the local
    /// one (`None`).
    fn resolve_wire_expr(
        &self,
        expr: &WireExpr,
        source: Option<ZenohId>,
    ) -> ZResult<KeyExpr> {
        if expr.scope == 0 {
            // The codec validated canonicity of standalone suffixes.
            return Ok(KeyExpr::from_canonical_unchecked(expr.suffix.clone()));
        }
        let prefix = {
            let state = self.state.lock();
            match source {
                Some(zid) => state.remote_resources.get(&(zid, expr.scope)).cloned(),
                None => state.local_resources.get(&expr.scope).cloned(),
            }
        }
        .ok_or(ZError::UnknownDeclaration(expr.scope as u32))?;
        if expr.suffix.is_empty() {
            Ok(prefix)
        } else {
            KeyExpr::new(format!("{}{}", prefix.as_str(), expr.suffix))
        }
    }

    // -- dispatch ----------------------------------------------------------

    /// Deliver a batch of network messages arriving from `source`,
    /// preserving their order.
    pub(crate) async fn dispatch_network_messages(
        self: &Arc<Self>,
        messages: Vec<NetworkMessage>,
        source: Option<ZenohId>,
    ) {
        for msg in messages {
            self.dispatch_network_message(msg, source).await;
        }
    }

    async fn dispatch_network_message(
        self: &Arc<Self>,
        msg: NetworkMessage,
        source: Option<ZenohId>,
    ) {
        match msg.body {
            NetworkBody::Declare { declarations } => {
                self.handle_remote_declarations(declarations, source);
            }
            NetworkBody::Data(data) => {
                let resolved = match self.resolve_wire_expr(&data.key, source) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "dropping data with unresolvable keyexpr");
                        return;
                    }
                };
                match &msg.reply_context {
                    Some(ctx) => self.handle_reply(ctx, resolved, data.info, data.payload),
                    None => self.handle_incoming_sample(
                        resolved,
                        data.info,
                        data.payload,
                        data.droppable,
                    ),
                }
            }
            NetworkBody::Unit { .. } => {
                if let Some(ctx) = &msg.reply_context {
                    if ctx.is_final {
                        trace!(qid = ctx.qid, "reply stream finished");
                        self.conclude_query(ctx.qid, true);
                    }
                }
            }
            NetworkBody::Query(query) => {
                let resolved = match self.resolve_wire_expr(&query.key, source) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "dropping query with unresolvable keyexpr");
                        return;
                    }
                };
                self.serve_remote_query(
                    resolved,
                    query.parameters,
                    query.qid,
                    query.target,
                    query.payload,
                )
                .await;
            }
            NetworkBody::Pull(pull) => {
                // Pull-mode subscriptions are declared on the wire but not
                // served by this implementation.
                trace!(pull_id = pull.pull_id, "ignoring Pull request");
            }
        }
    }

    fn handle_remote_declarations(
        &self,
        declarations: Vec<Declaration>,
        source: Option<ZenohId>,
    ) {
        let Some(zid) = source else {
            return;
        };
        for declaration in declarations {
            match declaration {
                Declaration::Resource { rid, key } => {
                    match self.resolve_wire_expr(&key, source) {
                        Ok(resolved) => {
                            trace!(%zid, rid, key = %resolved, "remote resource declared");
                            self.state
                                .lock()
                                .remote_resources
                                .insert((zid, rid), resolved);
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping unresolvable resource declaration");
                        }
                    }
                }
                Declaration::ForgetResource { rid } => {
                    self.state.lock().remote_resources.remove(&(zid, rid));
                }
                other => {
                    // Peer interest declarations don't change local routing:
                    // publications flood to every transport.
                    trace!(?other, "remote declaration noted");
                }
            }
        }
    }

    fn handle_incoming_sample(
        self: &Arc<Self>,
        key: KeyExpr,
        info: Option<DataInfo>,
        payload: Bytes,
        droppable: bool,
    ) {
        if info.as_ref().and_then(|i| i.kind) == Some(KIND_SENTINEL) {
            let source_info = info.as_ref().and_then(|i| {
                match (i.source_id, i.source_sn) {
                    (Some(zid), Some(sn)) => Some(SourceInfo {
                        id: picozen_core::id::EntityGlobalId { zid, eid: 0 },
                        sn,
                    }),
                    _ => None,
                }
            });
            self.dispatch_sentinel(&key, source_info);
            return;
        }
        let Some(sample) = Sample::from_wire(key, payload, info.as_ref(), droppable) else {
            warn!("dropping sample with unknown kind");
            return;
        };
        self.dispatch_sample(sample);
    }

    /// Hand one sample to every subscriber whose expression includes its
    /// key. Callbacks run outside the session lock.
    pub(crate) fn dispatch_sample(&self, sample: Sample) {
        let matching: Vec<Arc<SubscriberState>> = {
            let state = self.state.lock();
            state
                .subscribers
                .values()
                .filter(|sub| sub.key.includes(&sample.key_expr))
                .cloned()
                .collect()
        };
        for sub in matching {
            sub.callback.call(sample.clone());
        }
    }

    /// Heartbeat sentinels reach advanced subscribers only.
    fn dispatch_sentinel(&self, key: &KeyExpr, source_info: Option<SourceInfo>) {
        let Some(source_info) = source_info else { return };
        let matching: Vec<Arc<SubscriberState>> = {
            let state = self.state.lock();
            state
                .subscribers
                .values()
                .filter(|sub| sub.sentinel.is_some() && sub.key.includes(key))
                .cloned()
                .collect()
        };
        for sub in matching {
            if let Some(sentinel) = &sub.sentinel {
                sentinel.call(crate::sample::SentinelNotice {
                    key: key.clone(),
                    source: source_info,
                });
            }
        }
    }

    fn loopback_sample(
        &self,
        key: &KeyExpr,
        kind: SampleKind,
        payload: Bytes,
        encoding: Option<Encoding>,
        source_info: Option<SourceInfo>,
    ) {
        let sample = Sample {
            key_expr: key.clone(),
            payload,
            encoding: encoding.unwrap_or_default(),
            kind,
            timestamp: None,
            source_info,
            qos: crate::sample::Qos::default(),
        };
        self.dispatch_sample(sample);
    }

    // -- query serving -----------------------------------------------------

    /// Evaluate one query against local queryables: run every matching
    /// callback (outside the session lock) and collect the replies they
    /// buffered.
    fn serve_query_sync(
        &self,
        key: KeyExpr,
        parameters: String,
        target: QueryTarget,
        payload: Option<(DataInfo, Bytes)>,
    ) -> Vec<crate::queryable::QueuedReply> {
        let matching: Vec<Arc<QueryableState>> = {
            let state = self.state.lock();
            state
                .queryables
                .values()
                .filter(|q| q.key.intersects(&key))
                .filter(|q| target != QueryTarget::AllComplete || q.complete)
                .cloned()
                .collect()
        };
        let query = Query::new(key, parameters, payload);
        for queryable in &matching {
            queryable.callback.call(query.clone());
        }
        query.take_replies()
    }

    /// Serve a query that arrived on the wire: local replies followed by
    /// the final marker.
    async fn serve_remote_query(
        self: &Arc<Self>,
        key: KeyExpr,
        parameters: String,
        qid: u64,
        target: QueryTarget,
        payload: Option<(DataInfo, Bytes)>,
    ) {
        let replies = self.serve_query_sync(key, parameters, target, payload);
        for reply in replies {
            let data = picozen_proto::network::Data {
                key: WireExpr::literal(reply.key.as_str()),
                info: if reply.info.is_empty() {
                    None
                } else {
                    Some(reply.info)
                },
                payload: reply.payload,
                droppable: false,
            };
            let msg = NetworkMessage::make_reply(qid, self.zid, data);
            if let Err(e) = self.send_network(&msg, true).await {
                warn!(error = %e, "failed to send reply");
            }
        }
        let _ = self
            .send_network(&NetworkMessage::make_reply_final(qid), true)
            .await;
    }

    /// Feed local queryable replies straight into a pending query.
    fn serve_local_query(
        self: &Arc<Self>,
        key: KeyExpr,
        parameters: String,
        qid: u64,
        target: QueryTarget,
        payload: Option<(DataInfo, Bytes)>,
    ) {
        let replies = self.serve_query_sync(key, parameters, target, payload);
        let pending = self.state.lock().pending_queries.get(&qid).cloned();
        let Some(pending) = pending else { return };
        for reply in replies {
            let Some(sample) =
                Sample::from_wire(reply.key, reply.payload, Some(&reply.info), false)
            else {
                continue;
            };
            pending.on_reply(Reply {
                sample,
                replier_id: Some(self.zid),
            });
        }
    }

    fn handle_reply(
        self: &Arc<Self>,
        ctx: &ReplyContext,
        key: KeyExpr,
        info: Option<DataInfo>,
        payload: Bytes,
    ) {
        if ctx.is_final {
            self.conclude_query(ctx.qid, true);
            return;
        }
        let pending = self.state.lock().pending_queries.get(&ctx.qid).cloned();
        let Some(pending) = pending else {
            trace!(qid = ctx.qid, "reply for unknown or finished query");
            return;
        };
        let Some(sample) = Sample::from_wire(key, payload, info.as_ref(), false) else {
            return;
        };
        pending.on_reply(Reply {
            sample,
            replier_id: ctx.replier_id,
        });
    }

    // -- client-side queries ----------------------------------------------

    /// Synchronous core of `get`: registers the pending query, serves
    /// local queryables, and queues the wire query. The caller is
    /// responsible for flushing.
    pub(crate) fn get_enqueue(
        self: &Arc<Self>,
        key: &KeyExpr,
        parameters: &str,
        callback: Callback<Reply>,
        options: GetOptions,
    ) -> ZResult<()> {
        self.ensure_open()?;
        if let Some(token) = &options.cancellation {
            if token.is_cancelled() {
                // Short-circuit: nothing on the wire, drop runs now.
                drop(callback);
                return Ok(());
            }
        }

        let consolidation = resolve_consolidation(options.consolidation, parameters);
        let qid = self.state.lock().alloc_qid();
        let pending = Arc::new(PendingQuery::new(
            qid,
            callback,
            consolidation,
            now_ms().saturating_add(options.timeout_ms),
            options.cancellation.clone(),
        ));
        self.state.lock().pending_queries.insert(qid, pending);
        if let Some(token) = &options.cancellation {
            token.attach(self, qid);
        }

        // Local queryables answer first; they never produce the final.
        self.serve_local_query(
            key.clone(),
            parameters.to_string(),
            qid,
            options.target,
            options.payload.clone(),
        );

        if self.has_wire_transport() {
            let msg = NetworkMessage::make_query(picozen_proto::network::Query {
                key: WireExpr::literal(key.as_str()),
                parameters: parameters.to_string(),
                qid,
                target: options.target,
                consolidation,
                payload: options.payload,
            });
            self.enqueue_network(&msg, true)?;
        } else {
            self.conclude_query(qid, true);
        }
        Ok(())
    }

    pub(crate) async fn get(
        self: &Arc<Self>,
        key: &KeyExpr,
        parameters: &str,
        callback: Callback<Reply>,
        options: GetOptions,
    ) -> ZResult<()> {
        self.get_enqueue(key, parameters, callback, options)?;
        self.flush().await
    }

    /// Remove and terminate a pending query. With `deliver` the `Latest`
    /// buffer is flushed first; dropping the entry disconnects its
    /// handler channel either way.
    pub(crate) fn conclude_query(&self, qid: u64, deliver: bool) {
        let pending = self.state.lock().pending_queries.remove(&qid);
        if let Some(pending) = pending {
            if deliver {
                pending.conclude();
            }
        }
    }

    fn sweep_expired_queries(&self) {
        let now = now_ms();
        let expired: Vec<u64> = {
            let state = self.state.lock();
            state
                .pending_queries
                .values()
                .filter(|pq| pq.deadline_ms <= now)
                .map(|pq| pq.qid)
                .collect()
        };
        for qid in expired {
            debug!(qid, "query deadline elapsed");
            self.conclude_query(qid, true);
        }
    }

    // -- admin space -------------------------------------------------------

    fn start_admin_space(self: &Arc<Self>) -> ZResult<()> {
        self.ensure_open()?;
        if self.state.lock().admin_queryable.is_some() {
            return Ok(());
        }
        let prefix = admin_prefix(self.zid)?;
        let subtree = prefix.join("**")?;
        let weak = Arc::downgrade(self);
        let serving_prefix = prefix.clone();
        let callback = Callback::new(move |query: Query| {
            let Some(session) = weak.upgrade() else { return };
            session.answer_admin_query(&serving_prefix, &query);
        });
        let queryable = self.declare_queryable_inner(
            &subtree,
            callback,
            QueryableOptions { complete: true },
        )?;
        // The session itself anchors the admin queryable.
        let id = queryable.into_raw();
        self.state.lock().admin_queryable = Some(id);
        Ok(())
    }

    fn answer_admin_query(&self, prefix: &KeyExpr, query: &Query) {
        for entry in self.admin_transport_entries() {
            let Ok(key) = entry.key(prefix) else { continue };
            if query.key_expr().intersects(&key) {
                if let Ok(body) = serde_json::to_vec(&entry) {
                    let _ = query.reply(&key, body, Some(Encoding::application_json()));
                }
            }
        }
        for entry in self.admin_link_entries() {
            let Ok(key) = entry.key(prefix) else { continue };
            if query.key_expr().intersects(&key) {
                if let Ok(body) = serde_json::to_vec(&entry) {
                    let _ = query.reply(&key, body, Some(Encoding::application_json()));
                }
            }
        }
    }

    fn admin_transport_entries(&self) -> Vec<TransportAdminEntry> {
        let mut entries = Vec::new();
        for transport in self.transports.unicast_snapshot() {
            entries.push(TransportAdminEntry::new(
                TransportVariant::Unicast,
                transport.remote_zid,
                Some(transport.remote_whatami),
            ));
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            for (zid, whatami) in multicast.peers_snapshot() {
                entries.push(TransportAdminEntry::new(
                    TransportVariant::Multicast,
                    zid,
                    Some(whatami),
                ));
            }
        }
        entries
    }

    fn admin_link_entries(&self) -> Vec<LinkAdminEntry> {
        let mut entries = Vec::new();
        for (link_id, transport) in self.transports.unicast_snapshot().iter().enumerate() {
            entries.push(LinkAdminEntry::new(
                self.zid,
                TransportVariant::Unicast,
                transport.remote_zid,
                link_id,
                &link_info(transport.tx.link()),
            ));
        }
        if let Some(multicast) = self.transports.multicast_handle() {
            for (link_id, (zid, _)) in multicast.peers_snapshot().into_iter().enumerate() {
                entries.push(LinkAdminEntry::new(
                    self.zid,
                    TransportVariant::Multicast,
                    zid,
                    link_id,
                    &link_info(multicast.tx.link()),
                ));
            }
        }
        entries
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.scheduler.clear();
    }
}

fn link_info(link: &Arc<dyn picozen_core::link::Link>) -> LinkInfo {
    let caps = link.capabilities();
    LinkInfo {
        src: link.src().map(|l| l.to_string()),
        dst: link.dst().map(|l| l.to_string()),
        mtu: link.mtu(),
        is_streamed: caps.is_streamed(),
        is_reliable: caps.is_reliable,
    }
}

fn spawn_unicast_read(
    weak: Weak<SessionInner>,
    transport: Arc<TransportUnicast>,
) -> compio::runtime::Task<()> {
    compio::runtime::spawn(async move {
        loop {
            let Some(session) = weak.upgrade() else { break };
            if transport.read_once(&session).await.is_err() {
                break;
            }
        }
    })
}
