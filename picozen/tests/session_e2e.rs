//! End-to-end session tests over in-process links, driven cooperatively
//! so every interleaving is deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::executor::block_on;
use futures::FutureExt;

use picozen::handlers::{fifo_channel, Callback};
use picozen::inproc::MemoryLinkManager;
use picozen::keyexpr::KeyExpr;
use picozen::link::LinkManager;
use picozen::{
    AdvancedPublisher, AdvancedPublisherOptions, AdvancedSubscriber,
    AdvancedSubscriberOptions, CancellationToken, Config, ConnectivityEventKind,
    GetOptions, Locator, MissEvent, PublisherOptions, QueryableOptions, Reply, Sample,
    SampleKind, Session, SubscriberOptions, ZError,
};

fn ke(s: &str) -> KeyExpr {
    KeyExpr::new(s).unwrap()
}

/// Honor `RUST_LOG` when debugging a failing scenario.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn peer_config() -> Config {
    let mut config = Config::default();
    config.mode = picozen::WhatAmI::Peer;
    config.multicast_scouting = false;
    config.background_tasks = false;
    config.socket_timeout_ms = 0;
    config
}

fn client_config(locator: &str) -> Config {
    let mut config = Config::default();
    config.insert("mode", "client").unwrap();
    config.insert("connect", locator).unwrap();
    config.background_tasks = false;
    config.socket_timeout_ms = 0;
    config
}

/// Process everything currently readable on one session, without
/// blocking. Returns how many transport messages were handled.
async fn drain(session: &Session) -> usize {
    let mut handled = 0;
    loop {
        match session.read_once().now_or_never() {
            Some(Ok(())) => handled += 1,
            _ => break,
        }
    }
    handled
}

/// Ping-pong both sessions until neither makes progress.
async fn settle(a: &Session, b: &Session) {
    loop {
        if drain(a).await + drain(b).await == 0 {
            break;
        }
    }
}

/// A connected (client, server) pair over a fresh memory link manager.
fn linked_pair(manager: &MemoryLinkManager) -> (Session, Session) {
    init_tracing();
    block_on(async {
        let locator = Locator::parse("tcp/127.0.0.1:7447").unwrap();
        let lm: Arc<dyn LinkManager> = Arc::new(manager.clone());
        let mut listener = lm.listen(&locator).await.unwrap();

        let server = Session::open(peer_config(), lm.clone()).await.unwrap();

        let (client, accepted) = futures::join!(
            Session::open(client_config("tcp/127.0.0.1:7447"), lm.clone()),
            async {
                let link = listener.accept().await.unwrap();
                server.accept_link(link).await
            }
        );
        accepted.unwrap();
        (client.unwrap(), server)
    })
}

#[test]
fn pubsub_end_to_end() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(16);
        let _sub = server
            .declare_subscriber(&ke("demo/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        client
            .put(
                &ke("demo/example/one"),
                &b"hello"[..],
                PublisherOptions::default(),
            )
            .await
            .unwrap();
        settle(&client, &server).await;

        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.key_expr.as_str(), "demo/example/one");
        assert_eq!(&sample.payload[..], b"hello");
        assert_eq!(sample.kind, SampleKind::Put);

        client.delete(&ke("demo/example/one")).await.unwrap();
        settle(&client, &server).await;
        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.kind, SampleKind::Delete);
    });
}

#[test]
fn declared_publisher_uses_resource_alias() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(16);
        let _sub = server
            .declare_subscriber(&ke("alias/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        let publisher = client
            .declare_publisher(&ke("alias/topic"), PublisherOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        publisher.put(&b"via-alias"[..]).await.unwrap();
        settle(&client, &server).await;

        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.key_expr.as_str(), "alias/topic");
        assert_eq!(&sample.payload[..], b"via-alias");
    });
}

#[test]
fn non_matching_subscriber_stays_silent() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(16);
        let _sub = server
            .declare_subscriber(&ke("other/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        client
            .put(&ke("demo/x"), &b"ignored"[..], PublisherOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;
        assert!(matches!(samples.try_recv(), Err(ZError::ChannelNoData)));
    });
}

#[test]
fn query_reply_roundtrip() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let answer_key = ke("service/answer");
        let callback_key = answer_key.clone();
        let queryable_callback = Callback::new(move |query: picozen::Query| {
            assert_eq!(query.parameters(), "who=me");
            query.reply(&callback_key, &b"42"[..], None).unwrap();
        });
        let _queryable = server
            .declare_queryable(
                &ke("service/**"),
                queryable_callback,
                QueryableOptions::default(),
            )
            .await
            .unwrap();
        settle(&client, &server).await;

        let (reply_callback, replies) = fifo_channel::<Reply>(16);
        client
            .get(
                &ke("service/answer"),
                "who=me",
                reply_callback,
                GetOptions::default(),
            )
            .await
            .unwrap();
        settle(&client, &server).await;

        let reply = replies.try_recv().unwrap();
        assert_eq!(reply.sample.key_expr, answer_key);
        assert_eq!(&reply.sample.payload[..], b"42");
        assert_eq!(reply.replier_id, Some(server.zid()));
        // Final marker concluded the query: the channel disconnects.
        assert!(matches!(
            replies.try_recv(),
            Err(ZError::ChannelDisconnected)
        ));
    });
}

#[test]
fn query_without_queryable_ends_empty() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (reply_callback, replies) = fifo_channel::<Reply>(16);
        client
            .get(&ke("void/**"), "", reply_callback, GetOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;
        assert!(matches!(
            replies.try_recv(),
            Err(ZError::ChannelDisconnected)
        ));
    });
}

#[test]
fn large_payload_is_fragmented_and_reassembled() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(4);
        let _sub = server
            .declare_subscriber(&ke("bulk/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        // Larger than the 65535-byte batch: rides as fragments.
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        client
            .put(
                &ke("bulk/blob"),
                payload.clone(),
                PublisherOptions::default(),
            )
            .await
            .unwrap();
        settle(&client, &server).await;

        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.payload.len(), payload.len());
        assert_eq!(&sample.payload[..], &payload[..]);
    });
}

#[test]
fn batching_packs_messages_into_one_frame() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(16);
        let _sub = server
            .declare_subscriber(&ke("burst/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        client.batch_start();
        for i in 0..3 {
            client
                .put(
                    &ke(&format!("burst/{i}")),
                    format!("payload-{i}"),
                    PublisherOptions::default(),
                )
                .await
                .unwrap();
        }
        // Nothing crossed the wire yet.
        assert_eq!(drain(&server).await, 0);
        client.batch_stop().await.unwrap();

        // One transport message carries the whole burst.
        assert_eq!(drain(&server).await, 1);
        for i in 0..3 {
            let sample = samples.try_recv().unwrap();
            assert_eq!(sample.key_expr.as_str(), format!("burst/{i}"));
        }
    });
}

#[test]
fn liveliness_token_lifecycle() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, events) = fifo_channel::<Sample>(16);
        let _observer = server
            .liveliness_declare_subscriber(&ke("group/**"), callback)
            .await
            .unwrap();
        settle(&client, &server).await;

        let token = client
            .liveliness_declare_token(&ke("group/member1"))
            .await
            .unwrap();
        settle(&client, &server).await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, SampleKind::Put);
        assert!(event.key_expr.as_str().ends_with("group/member1"));

        token.undeclare().await.unwrap();
        settle(&client, &server).await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, SampleKind::Delete);
    });
}

#[test]
fn cancellation_contract() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let served = Arc::new(AtomicU32::new(0));
        let served_counter = served.clone();
        let queryable_callback = Callback::new(move |query: picozen::Query| {
            served_counter.fetch_add(1, Ordering::SeqCst);
            let _ = query.reply(&ke("slow/k"), &b"late"[..], None);
        });
        let _queryable = server
            .declare_queryable(
                &ke("slow/**"),
                queryable_callback,
                QueryableOptions::default(),
            )
            .await
            .unwrap();
        settle(&client, &server).await;

        let drops = Arc::new(AtomicU32::new(0));
        let drop_counter = drops.clone();
        let token = CancellationToken::new();
        let (reply_callback, replies) = fifo_channel::<Reply>(16);
        let reply_callback =
            reply_callback.with_drop(move || _ = drop_counter.fetch_add(1, Ordering::SeqCst));

        client
            .get(
                &ke("slow/k"),
                "",
                reply_callback,
                GetOptions {
                    cancellation: Some(token.clone()),
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap();

        // Cancel before the server ever answers.
        token.cancel();
        assert!(matches!(
            replies.try_recv(),
            Err(ZError::ChannelDisconnected)
        ));
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // Late replies are discarded quietly.
        settle(&client, &server).await;
        assert_eq!(served.load(Ordering::SeqCst), 1);

        // A get on an already-cancelled token never reaches the wire and
        // drops its callback immediately.
        let drops2 = Arc::new(AtomicU32::new(0));
        let drop_counter = drops2.clone();
        let (reply_callback, _replies2) = fifo_channel::<Reply>(16);
        let reply_callback =
            reply_callback.with_drop(move || _ = drop_counter.fetch_add(1, Ordering::SeqCst));
        client
            .get(
                &ke("slow/k"),
                "",
                reply_callback,
                GetOptions {
                    cancellation: Some(token.clone()),
                    ..GetOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(drops2.load(Ordering::SeqCst), 1);
        settle(&client, &server).await;
        assert_eq!(served.load(Ordering::SeqCst), 1, "no query hit the wire");
    });
}

#[test]
fn admin_space_reports_transport_and_link() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        client.start_admin_space().await.unwrap();
        settle(&client, &server).await;

        let admin_key = ke(&format!("@/{}/pico/session/**", client.zid()));
        let (reply_callback, replies) = fifo_channel::<Reply>(16);
        client
            .get(&admin_key, "", reply_callback, GetOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        let mut transport_seen = false;
        let mut link_seen = false;
        while let Ok(reply) = replies.try_recv() {
            let json: serde_json::Value =
                serde_json::from_slice(&reply.sample.payload).unwrap();
            assert_eq!(reply.sample.encoding.mime(), "application/json");
            let key = reply.sample.key_expr.as_str();
            if key.contains("/link/") {
                link_seen = true;
                assert_eq!(json["zid"], client.zid().to_string());
                assert_eq!(json["is_streamed"], true);
                assert_eq!(json["is_reliable"], true);
            } else {
                transport_seen = true;
                assert!(key.contains("/transport/unicast/"));
                assert_eq!(json["zid"], server.zid().to_string());
                assert_eq!(json["whatami"], "peer");
                assert_eq!(json["is_multicast"], false);
            }
        }
        assert!(transport_seen && link_seen);
    });
}

#[test]
fn connectivity_listener_history_and_close() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, events) = fifo_channel(16);
        let _listener = client
            .declare_transport_events_listener(callback, true)
            .unwrap();

        // History synthesizes a PUT for the existing peer.
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, ConnectivityEventKind::Put);
        assert_eq!(event.zid, server.zid());

        server.close().await.unwrap();
        settle(&client, &server).await;

        let event = events.recv().unwrap();
        assert_eq!(event.kind, ConnectivityEventKind::Delete);
        assert_eq!(event.zid, server.zid());
        assert!(client.is_closed(), "client closes with its only peer gone");
    });
}

#[test]
fn lease_expiry_closes_and_unblocks() {
    let manager = MemoryLinkManager::new();
    let locator = Locator::parse("tcp/127.0.0.1:7447").unwrap();
    block_on(async {
        let lm: Arc<dyn LinkManager> = Arc::new(manager.clone());
        let mut listener = lm.listen(&locator).await.unwrap();
        let mut server_config = peer_config();
        server_config.lease_ms = 30;
        let server = Session::open(server_config, lm.clone()).await.unwrap();

        let mut client_cfg = client_config("tcp/127.0.0.1:7447");
        client_cfg.lease_ms = 30;
        let (client, accepted) = futures::join!(
            Session::open(client_cfg, lm.clone()),
            async {
                let link = listener.accept().await.unwrap();
                server.accept_link(link).await
            }
        );
        let client = client.unwrap();
        accepted.unwrap();

        // A query left pending across the expiry must unblock.
        let (reply_callback, replies) = fifo_channel::<Reply>(4);
        client
            .get(&ke("nowhere/**"), "", reply_callback, GetOptions::default())
            .await
            .unwrap();
        drain(&client).await;

        // Silence on both sides for longer than the lease.
        std::thread::sleep(std::time::Duration::from_millis(60));
        server.process_periodic_tasks().await;
        // The expiry close is picked up by the next read drive.
        let _ = server.read_once().await;
        settle(&client, &server).await;

        // The peer-mode server keeps its session; the client loses its
        // only transport and closes with it.
        assert!(client.is_closed());
        assert!(matches!(replies.recv(), Err(ZError::ChannelDisconnected)));
    });
}

#[test]
fn keep_alive_prevents_expiry() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        client.send_keep_alive().await.unwrap();
        server.send_keep_alive().await.unwrap();
        settle(&client, &server).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    });
}

#[test]
fn sample_miss_detection_and_recovery() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(32);
        let subscriber = AdvancedSubscriber::declare(
            &server,
            &ke("adv/**"),
            callback,
            AdvancedSubscriberOptions::default(),
        )
        .await
        .unwrap();
        let (miss_callback, misses) = fifo_channel::<MissEvent>(8);
        subscriber.declare_miss_listener(miss_callback);
        settle(&client, &server).await;

        // Droppable publications ride the best-effort channel, where
        // loss is survivable.
        let publisher = AdvancedPublisher::declare(
            &client,
            &ke("adv/stream"),
            AdvancedPublisherOptions {
                history_depth: 10,
                publisher: PublisherOptions {
                    droppable: true,
                    ..PublisherOptions::default()
                },
                ..AdvancedPublisherOptions::default()
            },
        )
        .await
        .unwrap();
        settle(&client, &server).await;

        publisher.put(&b"1"[..]).await.unwrap();
        settle(&client, &server).await;
        assert_eq!(&samples.try_recv().unwrap().payload[..], b"1");

        // The wire eats sns 2, 3 and 4.
        manager.inject_loss(3);
        for payload in [&b"2"[..], b"3", b"4"] {
            publisher.put(payload).await.unwrap();
        }
        settle(&client, &server).await;
        assert!(samples.try_recv().is_err(), "blackholed samples are gone");

        // Sn 5 arrives, revealing the gap: one miss event, a recovery
        // query against the publisher cache, then in-order delivery.
        publisher.put(&b"5"[..]).await.unwrap();
        settle(&client, &server).await;

        let miss = misses.try_recv().unwrap();
        assert_eq!(miss.nb, 3);
        assert!(matches!(misses.try_recv(), Err(ZError::ChannelNoData)));

        let delivered: Vec<Bytes> =
            std::iter::from_fn(|| samples.try_recv().ok().map(|s| s.payload)).collect();
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3"),
                Bytes::from_static(b"4"),
                Bytes::from_static(b"5"),
            ]
        );
    });
}

#[test]
fn heartbeat_reveals_silent_loss() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(32);
        let subscriber = AdvancedSubscriber::declare(
            &server,
            &ke("beat/**"),
            callback,
            AdvancedSubscriberOptions::default(),
        )
        .await
        .unwrap();
        let (miss_callback, misses) = fifo_channel::<MissEvent>(8);
        subscriber.declare_miss_listener(miss_callback);
        settle(&client, &server).await;

        let publisher = AdvancedPublisher::declare(
            &client,
            &ke("beat/stream"),
            AdvancedPublisherOptions {
                history_depth: 10,
                heartbeat_period_ms: Some(1),
                publisher: PublisherOptions {
                    droppable: true,
                    ..PublisherOptions::default()
                },
                ..AdvancedPublisherOptions::default()
            },
        )
        .await
        .unwrap();
        settle(&client, &server).await;

        publisher.put(&b"first"[..]).await.unwrap();
        settle(&client, &server).await;
        assert_eq!(&samples.try_recv().unwrap().payload[..], b"first");

        // The last sample vanishes; no further traffic would reveal it.
        manager.inject_loss(1);
        publisher.put(&b"last"[..]).await.unwrap();
        settle(&client, &server).await;
        assert!(samples.try_recv().is_err());

        // The heartbeat sentinel carries the latest sn and triggers
        // recovery.
        std::thread::sleep(std::time::Duration::from_millis(3));
        client.process_periodic_tasks().await;
        settle(&client, &server).await;

        assert_eq!(misses.try_recv().unwrap().nb, 1);
        assert_eq!(&samples.try_recv().unwrap().payload[..], b"last");
    });
}

#[test]
fn late_joiner_gets_history_locally() {
    // One offline peer session: the history query loops back to the
    // publisher cache without any wire.
    block_on(async {
        let lm: Arc<dyn LinkManager> = Arc::new(MemoryLinkManager::new());
        let session = Session::open(peer_config(), lm).await.unwrap();

        let publisher = AdvancedPublisher::declare(
            &session,
            &ke("hist/topic"),
            AdvancedPublisherOptions {
                history_depth: 8,
                publisher_detection: true,
                ..AdvancedPublisherOptions::default()
            },
        )
        .await
        .unwrap();
        for payload in [&b"a"[..], b"b", b"c"] {
            publisher.put(payload).await.unwrap();
        }

        let (callback, samples) = fifo_channel::<Sample>(16);
        let _subscriber = AdvancedSubscriber::declare(
            &session,
            &ke("hist/**"),
            callback,
            AdvancedSubscriberOptions {
                history: true,
                ..AdvancedSubscriberOptions::default()
            },
        )
        .await
        .unwrap();

        let delivered: Vec<Bytes> =
            std::iter::from_fn(|| samples.try_recv().ok().map(|s| s.payload)).collect();
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ]
        );

        // Live samples continue seamlessly after the replayed history.
        publisher.put(&b"d"[..]).await.unwrap();
        assert_eq!(&samples.try_recv().unwrap().payload[..], b"d");
    });
}

#[test]
fn multicast_peers_discover_and_exchange() {
    let manager = MemoryLinkManager::new();
    block_on(async {
        let lm: Arc<dyn LinkManager> = Arc::new(manager.clone());
        let mut config_a = peer_config();
        config_a.multicast_scouting = true;
        let mut config_b = peer_config();
        config_b.multicast_scouting = true;

        let a = Session::open(config_a, lm.clone()).await.unwrap();
        let b = Session::open(config_b, lm.clone()).await.unwrap();
        // Each side reads the other's Join.
        settle(&a, &b).await;

        let (callback, samples) = fifo_channel::<Sample>(16);
        let _sub = b
            .declare_subscriber(&ke("mesh/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&a, &b).await;

        a.put(&ke("mesh/data"), &b"over-multicast"[..], PublisherOptions::default())
            .await
            .unwrap();
        settle(&a, &b).await;

        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.key_expr.as_str(), "mesh/data");
        assert_eq!(&sample.payload[..], b"over-multicast");
    });
}

#[test]
fn subscriber_undeclare_stops_delivery_and_drops_once() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let drops = Arc::new(AtomicU32::new(0));
        let drop_counter = drops.clone();
        let (callback, samples) = fifo_channel::<Sample>(16);
        let callback =
            callback.with_drop(move || _ = drop_counter.fetch_add(1, Ordering::SeqCst));
        let subscriber = server
            .declare_subscriber(&ke("gone/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;

        subscriber.undeclare().await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        settle(&client, &server).await;

        client
            .put(&ke("gone/x"), &b"nobody"[..], PublisherOptions::default())
            .await
            .unwrap();
        settle(&client, &server).await;
        assert!(matches!(
            samples.try_recv(),
            Err(ZError::ChannelDisconnected)
        ));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn session_close_is_idempotent_and_disconnects_handlers() {
    let manager = MemoryLinkManager::new();
    let (client, server) = linked_pair(&manager);
    block_on(async {
        let (callback, samples) = fifo_channel::<Sample>(4);
        let _sub = client
            .declare_subscriber(&ke("x/**"), callback, SubscriberOptions::default())
            .await
            .unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            samples.recv(),
            Err(ZError::ChannelDisconnected)
        ));

        // Operations on a closed session fail with SessionClosed.
        let err = client
            .put(&ke("x/y"), &b"z"[..], PublisherOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ZError::SessionClosed));
        settle(&client, &server).await;
    });
}
