//! Round-trip coverage for the wire codec: every transport, scouting,
//! and network message variant goes through encode and back.

use bytes::{Bytes, BytesMut};
use picozen_core::id::{WhatAmI, WhatAmIMatcher, ZenohId};
use picozen_core::locator::Locator;
use picozen_proto::codec::{
    decode_network_message, decode_scouting_message, decode_transport_message,
    encode_network_message, encode_scouting_message, encode_transport_message,
};
use picozen_proto::error::CodecError;
use picozen_proto::network::{
    ConsolidationMode, Data, DataInfo, Declaration, Encoding, NetworkMessage, Period, Query,
    QueryTarget, QueryableInfo, Reliability, SubInfo, SubMode, Timestamp, WireExpr,
};
use picozen_proto::reader::Reader;
use picozen_proto::transport::{
    close_reason, ConduitSnList, ScoutingMessage, SizeParams, SnPair, SnResolution,
    TransportMessage,
};

fn roundtrip_transport(msg: &TransportMessage) {
    let mut buf = BytesMut::new();
    encode_transport_message(&mut buf, msg);
    let mut reader = Reader::new(&buf);
    let decoded = decode_transport_message(&mut reader).expect("decode");
    assert!(reader.is_empty(), "trailing bytes after {msg:?}");
    assert_eq!(&decoded, msg);
}

fn roundtrip_network(msg: &NetworkMessage) {
    let mut buf = BytesMut::new();
    encode_network_message(&mut buf, msg);
    let mut reader = Reader::new(&buf);
    let decoded = decode_network_message(&mut reader).expect("decode");
    assert!(reader.is_empty(), "trailing bytes after {msg:?}");
    assert_eq!(&decoded, msg);
}

fn zid(fill: u8) -> ZenohId {
    let mut bytes = [0u8; 16];
    bytes[0] = fill;
    bytes[1] = 0x42;
    ZenohId::from_bytes(bytes).unwrap()
}

#[test]
fn scout_with_and_without_zid() {
    for msg in [
        ScoutingMessage::make_scout(WhatAmIMatcher::router_or_peer(), None),
        ScoutingMessage::make_scout(WhatAmIMatcher(0b001), Some(zid(7))),
    ] {
        let mut buf = BytesMut::new();
        encode_scouting_message(&mut buf, &msg);
        let mut reader = Reader::new(&buf);
        assert_eq!(decode_scouting_message(&mut reader).unwrap(), msg);
    }
}

#[test]
fn hello_with_locators() {
    let msg = ScoutingMessage::make_hello(
        WhatAmI::Peer,
        zid(3),
        vec![
            Locator::parse("tcp/127.0.0.1:7447").unwrap(),
            Locator::parse("udp/224.0.0.224:7447?iface=lo").unwrap(),
        ],
    );
    let mut buf = BytesMut::new();
    encode_scouting_message(&mut buf, &msg);
    let mut reader = Reader::new(&buf);
    assert_eq!(decode_scouting_message(&mut reader).unwrap(), msg);
}

#[test]
fn init_handshake_pair() {
    roundtrip_transport(&TransportMessage::make_init_syn(
        WhatAmI::Client,
        zid(1),
        SizeParams::default(),
    ));
    roundtrip_transport(&TransportMessage::make_init_syn(
        WhatAmI::Client,
        zid(1),
        SizeParams {
            sn_resolution: SnResolution(16),
            batch_size: 256,
        },
    ));
    roundtrip_transport(&TransportMessage::make_init_ack(
        WhatAmI::Router,
        zid(2),
        SizeParams {
            sn_resolution: SnResolution(28),
            batch_size: 16384,
        },
        Bytes::from_static(b"cookie-bytes"),
    ));
}

#[test]
fn open_handshake_pair() {
    roundtrip_transport(&TransportMessage::make_open_syn(
        10_000,
        12345,
        Bytes::from_static(b"cookie-bytes"),
    ));
    roundtrip_transport(&TransportMessage::make_open_syn(
        1500,
        1,
        Bytes::from_static(b"c"),
    ));
    roundtrip_transport(&TransportMessage::make_open_ack(10_000, 67890));
}

#[test]
fn join_plain_and_qos() {
    roundtrip_transport(&TransportMessage::make_join(
        WhatAmI::Peer,
        zid(9),
        10_000,
        SizeParams::default(),
        ConduitSnList::Plain(SnPair {
            reliable: 11,
            best_effort: 22,
        }),
    ));
    let mut pairs = [SnPair::default(); 8];
    for (i, p) in pairs.iter_mut().enumerate() {
        p.reliable = i as u64 * 10;
        p.best_effort = i as u64 * 10 + 1;
    }
    roundtrip_transport(&TransportMessage::make_join(
        WhatAmI::Peer,
        zid(9),
        2500,
        SizeParams {
            sn_resolution: SnResolution(28),
            batch_size: 8192,
        },
        ConduitSnList::Qos(pairs),
    ));
}

#[test]
fn close_and_keepalive() {
    roundtrip_transport(&TransportMessage::make_close(close_reason::EXPIRED, true));
    roundtrip_transport(&TransportMessage::make_close(close_reason::GENERIC, false));
    roundtrip_transport(&TransportMessage::make_keep_alive());
}

#[test]
fn frame_with_messages() {
    let data = NetworkMessage::make_data(
        WireExpr::literal("demo/example"),
        None,
        Bytes::from_static(b"payload"),
        false,
    );
    let unit = NetworkMessage::make_unit(true);
    for reliable in [true, false] {
        roundtrip_transport(&TransportMessage::make_frame(
            42,
            reliable,
            vec![data.clone(), unit.clone()],
        ));
    }
    roundtrip_transport(&TransportMessage::make_frame(7, true, vec![]));
}

#[test]
fn fragment_flags() {
    for (reliable, more) in [(true, true), (true, false), (false, true), (false, false)] {
        roundtrip_transport(&TransportMessage::make_fragment(
            99,
            reliable,
            more,
            Bytes::from_static(b"slice-of-a-big-message"),
        ));
    }
}

#[test]
fn declare_all_declarations() {
    let msg = NetworkMessage::make_declare(vec![
        Declaration::Resource {
            rid: 1,
            key: WireExpr::literal("demo/res"),
        },
        Declaration::ForgetResource { rid: 1 },
        Declaration::Publisher {
            key: WireExpr::aliased(1, "/pub".into()),
        },
        Declaration::ForgetPublisher {
            key: WireExpr::literal("demo/pub"),
        },
        Declaration::Subscriber {
            key: WireExpr::literal("demo/**"),
            info: SubInfo {
                mode: SubMode::Push,
                reliability: Reliability::Reliable,
                period: None,
            },
        },
        Declaration::Subscriber {
            key: WireExpr::literal("demo/pull"),
            info: SubInfo {
                mode: SubMode::Pull,
                reliability: Reliability::BestEffort,
                period: Some(Period {
                    origin: 0,
                    period: 100,
                    duration: 50,
                }),
            },
        },
        Declaration::ForgetSubscriber {
            key: WireExpr::literal("demo/**"),
        },
        Declaration::Queryable {
            key: WireExpr::literal("demo/queryable"),
            info: QueryableInfo {
                complete: 1,
                distance: 2,
            },
        },
        Declaration::ForgetQueryable {
            key: WireExpr::literal("demo/queryable"),
        },
    ]);
    roundtrip_network(&msg);
}

#[test]
fn data_with_full_info() {
    let info = DataInfo {
        kind: Some(1),
        encoding: Some(Encoding {
            prefix: Encoding::APP_JSON,
            suffix: "utf8".into(),
        }),
        timestamp: Some(Timestamp {
            time: 0xDEAD_BEEF,
            id: zid(5),
        }),
        source_id: Some(zid(6)),
        source_sn: Some(777),
    };
    roundtrip_network(&NetworkMessage::make_data(
        WireExpr::literal("demo/full"),
        Some(info),
        Bytes::from_static(b"body"),
        true,
    ));
}

#[test]
fn data_with_resource_alias() {
    roundtrip_network(&NetworkMessage::make_data(
        WireExpr::aliased(12, String::new()),
        None,
        Bytes::from_static(b"aliased"),
        false,
    ));
}

#[test]
fn pull_variants() {
    roundtrip_network(&NetworkMessage::make_pull(
        WireExpr::literal("demo/pull"),
        3,
        Some(16),
        false,
    ));
    roundtrip_network(&NetworkMessage::make_pull(
        WireExpr::literal("demo/pull"),
        4,
        None,
        true,
    ));
}

#[test]
fn query_variants() {
    roundtrip_network(&NetworkMessage::make_query(Query {
        key: WireExpr::literal("demo/**"),
        parameters: String::new(),
        qid: 1,
        target: QueryTarget::BestMatching,
        consolidation: ConsolidationMode::Latest,
        payload: None,
    }));
    roundtrip_network(&NetworkMessage::make_query(Query {
        key: WireExpr::literal("demo/**"),
        parameters: "arg=1;other=two".into(),
        qid: 0xFFFF,
        target: QueryTarget::AllComplete,
        consolidation: ConsolidationMode::None,
        payload: Some((
            DataInfo {
                encoding: Some(Encoding::new(Encoding::TEXT_PLAIN)),
                ..DataInfo::default()
            },
            Bytes::from_static(b"query body"),
        )),
    }));
}

#[test]
fn reply_and_final_marker() {
    let data = Data {
        key: WireExpr::literal("demo/replied"),
        info: Some(DataInfo {
            timestamp: Some(Timestamp {
                time: 99,
                id: zid(8),
            }),
            ..DataInfo::default()
        }),
        payload: Bytes::from_static(b"answer"),
        droppable: false,
    };
    roundtrip_network(&NetworkMessage::make_reply(17, zid(8), data));
    roundtrip_network(&NetworkMessage::make_reply_final(17));
}

#[test]
fn non_canonical_keyexpr_on_wire_is_rejected() {
    let msg = NetworkMessage::make_data(
        WireExpr::literal("demo//bad"),
        None,
        Bytes::new(),
        false,
    );
    let mut buf = BytesMut::new();
    encode_network_message(&mut buf, &msg);
    let mut reader = Reader::new(&buf);
    assert_eq!(
        decode_network_message(&mut reader),
        Err(CodecError::BadKeyexpr)
    );
}

#[test]
fn unknown_header_is_bad_header() {
    let buf = [0x1Du8]; // unused network mid
    let mut reader = Reader::new(&buf);
    assert_eq!(
        decode_network_message(&mut reader),
        Err(CodecError::BadHeader)
    );
}

#[test]
fn truncated_messages_are_short_buffer() {
    let msg = TransportMessage::make_init_ack(
        WhatAmI::Router,
        zid(2),
        SizeParams::default(),
        Bytes::from_static(b"cookie"),
    );
    let mut buf = BytesMut::new();
    encode_transport_message(&mut buf, &msg);
    for cut in 1..buf.len() {
        let mut reader = Reader::new(&buf[..cut]);
        assert_eq!(
            decode_transport_message(&mut reader),
            Err(CodecError::ShortBuffer),
            "cut at {cut}"
        );
    }
}
