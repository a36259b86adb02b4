//! Encode/decode for network messages and their declarations.

use bytes::{Bytes, BytesMut};
use picozen_core::id::ZenohId;
use picozen_core::keyexpr::{is_canon, KeyExprCanonStatus};

use crate::error::{CodecError, Result};
use crate::network::{
    data_info_flag, decl_id, flag, mid, ConsolidationMode, Data, DataInfo, Declaration,
    Encoding, NetworkBody, NetworkMessage, Period, Pull, Query, QueryTarget, QueryableInfo,
    Reliability, ReplyContext, SubInfo, SubMode, Timestamp, WireExpr,
};
use crate::reader::{Reader, WireWrite};

const MID_MASK: u8 = 0x1F;

// --------------------------------------------------------------------------
// Fields
// --------------------------------------------------------------------------

fn encode_wire_expr(buf: &mut BytesMut, key: &WireExpr) {
    buf.write_zint(key.scope);
    if key.has_suffix() {
        buf.write_zstr(&key.suffix);
    }
}

fn decode_wire_expr(reader: &mut Reader<'_>, has_suffix: bool) -> Result<WireExpr> {
    let scope = reader.read_zint()?;
    let suffix = if has_suffix {
        let s = reader.read_zstr()?;
        // A standalone keyexpr must arrive canonical; a suffix continuing
        // a declared prefix is validated after expansion by the session.
        if scope == 0 && is_canon(s) != KeyExprCanonStatus::Success {
            return Err(CodecError::BadKeyexpr);
        }
        s.to_string()
    } else {
        String::new()
    };
    Ok(WireExpr { scope, suffix })
}

fn encode_timestamp(buf: &mut BytesMut, ts: &Timestamp) {
    buf.write_zint(ts.time);
    buf.write_zbytes(ts.id.wire_bytes());
}

fn decode_timestamp(reader: &mut Reader<'_>) -> Result<Timestamp> {
    let time = reader.read_zint()?;
    let id = ZenohId::from_slice(reader.read_zbytes()?).ok_or(CodecError::BadHeader)?;
    Ok(Timestamp { time, id })
}

fn encode_encoding(buf: &mut BytesMut, enc: &Encoding) {
    buf.write_zint(enc.prefix);
    buf.write_zstr(&enc.suffix);
}

fn decode_encoding(reader: &mut Reader<'_>) -> Result<Encoding> {
    let prefix = reader.read_zint()?;
    let suffix = reader.read_zstr()?.to_string();
    Ok(Encoding { prefix, suffix })
}

fn encode_data_info(buf: &mut BytesMut, info: &DataInfo) {
    buf.write_zint(info.options());
    if let Some(kind) = info.kind {
        buf.write_zint(kind);
    }
    if let Some(enc) = &info.encoding {
        encode_encoding(buf, enc);
    }
    if let Some(ts) = &info.timestamp {
        encode_timestamp(buf, ts);
    }
    if let Some(id) = &info.source_id {
        buf.write_zbytes(id.wire_bytes());
    }
    if let Some(sn) = info.source_sn {
        buf.write_zint(sn);
    }
}

fn decode_data_info(reader: &mut Reader<'_>) -> Result<DataInfo> {
    let options = reader.read_zint()?;
    let mut info = DataInfo::default();
    if options & data_info_flag::KIND != 0 {
        info.kind = Some(reader.read_zint()?);
    }
    if options & data_info_flag::ENCODING != 0 {
        info.encoding = Some(decode_encoding(reader)?);
    }
    if options & data_info_flag::TIMESTAMP != 0 {
        info.timestamp = Some(decode_timestamp(reader)?);
    }
    if options & data_info_flag::SOURCE_ID != 0 {
        info.source_id =
            Some(ZenohId::from_slice(reader.read_zbytes()?).ok_or(CodecError::BadHeader)?);
    }
    if options & data_info_flag::SOURCE_SN != 0 {
        info.source_sn = Some(reader.read_zint()?);
    }
    Ok(info)
}

// --------------------------------------------------------------------------
// Declarations
// --------------------------------------------------------------------------

fn key_flag(key: &WireExpr) -> u8 {
    if key.has_suffix() {
        flag::K
    } else {
        0
    }
}

fn encode_declaration(buf: &mut BytesMut, decl: &Declaration) {
    match decl {
        Declaration::Resource { rid, key } => {
            buf.write_u8(decl_id::RESOURCE | key_flag(key));
            buf.write_zint(*rid);
            encode_wire_expr(buf, key);
        }
        Declaration::ForgetResource { rid } => {
            buf.write_u8(decl_id::FORGET_RESOURCE);
            buf.write_zint(*rid);
        }
        Declaration::Publisher { key } => {
            buf.write_u8(decl_id::PUBLISHER | key_flag(key));
            encode_wire_expr(buf, key);
        }
        Declaration::ForgetPublisher { key } => {
            buf.write_u8(decl_id::FORGET_PUBLISHER | key_flag(key));
            encode_wire_expr(buf, key);
        }
        Declaration::Subscriber { key, info } => {
            let mut header = decl_id::SUBSCRIBER | key_flag(key);
            if info.reliability == Reliability::Reliable {
                header |= flag::R;
            }
            let explicit = info.mode != SubMode::Push || info.period.is_some();
            if explicit {
                header |= flag::S;
            }
            buf.write_u8(header);
            encode_wire_expr(buf, key);
            if explicit {
                let mode = match info.mode {
                    SubMode::Push => 0x00,
                    SubMode::Pull => 0x01,
                };
                let sub_header = mode | if info.period.is_some() { flag::P } else { 0 };
                buf.write_u8(sub_header);
                if let Some(p) = &info.period {
                    buf.write_zint(p.origin);
                    buf.write_zint(p.period);
                    buf.write_zint(p.duration);
                }
            }
        }
        Declaration::ForgetSubscriber { key } => {
            buf.write_u8(decl_id::FORGET_SUBSCRIBER | key_flag(key));
            encode_wire_expr(buf, key);
        }
        Declaration::Queryable { key, info } => {
            let mut header = decl_id::QUERYABLE | key_flag(key);
            let explicit = *info != QueryableInfo::default();
            if explicit {
                header |= flag::Q;
            }
            buf.write_u8(header);
            encode_wire_expr(buf, key);
            if explicit {
                buf.write_zint(info.complete);
                buf.write_zint(info.distance);
            }
        }
        Declaration::ForgetQueryable { key } => {
            buf.write_u8(decl_id::FORGET_QUERYABLE | key_flag(key));
            encode_wire_expr(buf, key);
        }
    }
}

fn decode_declaration(reader: &mut Reader<'_>) -> Result<Declaration> {
    let header = reader.read_u8()?;
    let has_key = header & flag::K != 0;
    match header & MID_MASK {
        decl_id::RESOURCE => {
            let rid = reader.read_zint()?;
            let key = decode_wire_expr(reader, has_key)?;
            Ok(Declaration::Resource { rid, key })
        }
        decl_id::FORGET_RESOURCE => Ok(Declaration::ForgetResource {
            rid: reader.read_zint()?,
        }),
        decl_id::PUBLISHER => Ok(Declaration::Publisher {
            key: decode_wire_expr(reader, has_key)?,
        }),
        decl_id::FORGET_PUBLISHER => Ok(Declaration::ForgetPublisher {
            key: decode_wire_expr(reader, has_key)?,
        }),
        decl_id::SUBSCRIBER => {
            let key = decode_wire_expr(reader, has_key)?;
            let reliability = if header & flag::R != 0 {
                Reliability::Reliable
            } else {
                Reliability::BestEffort
            };
            let mut info = SubInfo {
                reliability,
                ..SubInfo::default()
            };
            if header & flag::S != 0 {
                let sub_header = reader.read_u8()?;
                info.mode = match sub_header & 0x07 {
                    0x00 => SubMode::Push,
                    0x01 => SubMode::Pull,
                    _ => return Err(CodecError::BadFlag),
                };
                if sub_header & flag::P != 0 {
                    info.period = Some(Period {
                        origin: reader.read_zint()?,
                        period: reader.read_zint()?,
                        duration: reader.read_zint()?,
                    });
                }
            }
            Ok(Declaration::Subscriber { key, info })
        }
        decl_id::FORGET_SUBSCRIBER => Ok(Declaration::ForgetSubscriber {
            key: decode_wire_expr(reader, has_key)?,
        }),
        decl_id::QUERYABLE => {
            let key = decode_wire_expr(reader, has_key)?;
            let info = if header & flag::Q != 0 {
                QueryableInfo {
                    complete: reader.read_zint()?,
                    distance: reader.read_zint()?,
                }
            } else {
                QueryableInfo::default()
            };
            Ok(Declaration::Queryable { key, info })
        }
        decl_id::FORGET_QUERYABLE => Ok(Declaration::ForgetQueryable {
            key: decode_wire_expr(reader, has_key)?,
        }),
        _ => Err(CodecError::BadHeader),
    }
}

// --------------------------------------------------------------------------
// Messages
// --------------------------------------------------------------------------

fn encode_reply_context(buf: &mut BytesMut, ctx: &ReplyContext) {
    let header = mid::REPLY_CONTEXT | if ctx.is_final { flag::F } else { 0 };
    buf.write_u8(header);
    buf.write_zint(ctx.qid);
    if !ctx.is_final {
        let id_bytes = ctx
            .replier_id
            .as_ref()
            .map(ZenohId::wire_bytes)
            .unwrap_or_default();
        buf.write_zbytes(id_bytes);
    }
}

fn decode_reply_context(reader: &mut Reader<'_>, header: u8) -> Result<ReplyContext> {
    let is_final = header & flag::F != 0;
    let qid = reader.read_zint()?;
    let replier_id = if is_final {
        None
    } else {
        Some(ZenohId::from_slice(reader.read_zbytes()?).ok_or(CodecError::BadHeader)?)
    };
    Ok(ReplyContext {
        qid,
        replier_id,
        is_final,
    })
}

/// Encode one network message, reply decorator first.
pub fn encode_network_message(buf: &mut BytesMut, msg: &NetworkMessage) {
    if let Some(ctx) = &msg.reply_context {
        encode_reply_context(buf, ctx);
    }
    match &msg.body {
        NetworkBody::Declare { declarations } => {
            buf.write_u8(mid::DECLARE);
            buf.write_zint(declarations.len() as u64);
            for decl in declarations {
                encode_declaration(buf, decl);
            }
        }
        NetworkBody::Data(data) => {
            let mut header = mid::DATA | key_flag(&data.key);
            if data.info.is_some() {
                header |= flag::I;
            }
            if data.droppable {
                header |= flag::D;
            }
            buf.write_u8(header);
            encode_wire_expr(buf, &data.key);
            if let Some(info) = &data.info {
                encode_data_info(buf, info);
            }
            buf.write_zbytes(&data.payload);
        }
        NetworkBody::Unit { droppable } => {
            let header = mid::UNIT | if *droppable { flag::D } else { 0 };
            buf.write_u8(header);
        }
        NetworkBody::Pull(pull) => {
            let mut header = mid::PULL | key_flag(&pull.key);
            if pull.max_samples.is_some() {
                header |= flag::N;
            }
            if pull.is_final {
                header |= flag::F;
            }
            buf.write_u8(header);
            encode_wire_expr(buf, &pull.key);
            buf.write_zint(pull.pull_id);
            if let Some(n) = pull.max_samples {
                buf.write_zint(n);
            }
        }
        NetworkBody::Query(query) => {
            let mut header = mid::QUERY | key_flag(&query.key);
            if query.payload.is_some() {
                header |= flag::B;
            }
            if query.target != QueryTarget::BestMatching {
                header |= flag::T;
            }
            buf.write_u8(header);
            encode_wire_expr(buf, &query.key);
            buf.write_zstr(&query.parameters);
            buf.write_zint(query.qid);
            if query.target != QueryTarget::BestMatching {
                buf.write_zint(query.target.to_wire());
            }
            buf.write_zint(query.consolidation.to_wire());
            if let Some((info, payload)) = &query.payload {
                encode_data_info(buf, info);
                buf.write_zbytes(payload);
            }
        }
    }
}

/// Decode one network message, consuming any leading reply decorator.
pub fn decode_network_message(reader: &mut Reader<'_>) -> Result<NetworkMessage> {
    let mut reply_context = None;
    loop {
        let header = reader.read_u8()?;
        let has_key = header & flag::K != 0;
        match header & MID_MASK {
            mid::REPLY_CONTEXT => {
                if reply_context.is_some() {
                    return Err(CodecError::BadHeader);
                }
                reply_context = Some(decode_reply_context(reader, header)?);
            }
            mid::DECLARE => {
                if reply_context.is_some() {
                    return Err(CodecError::BadFlag);
                }
                let count = reader.read_zint_usize()?;
                let mut declarations = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    declarations.push(decode_declaration(reader)?);
                }
                return Ok(NetworkMessage::make_declare(declarations));
            }
            mid::DATA => {
                let key = decode_wire_expr(reader, has_key)?;
                let info = if header & flag::I != 0 {
                    Some(decode_data_info(reader)?)
                } else {
                    None
                };
                let payload = Bytes::copy_from_slice(reader.read_zbytes()?);
                return Ok(NetworkMessage {
                    body: NetworkBody::Data(Data {
                        key,
                        info,
                        payload,
                        droppable: header & flag::D != 0,
                    }),
                    reply_context,
                });
            }
            mid::UNIT => {
                return Ok(NetworkMessage {
                    body: NetworkBody::Unit {
                        droppable: header & flag::D != 0,
                    },
                    reply_context,
                });
            }
            mid::PULL => {
                if reply_context.is_some() {
                    return Err(CodecError::BadFlag);
                }
                let key = decode_wire_expr(reader, has_key)?;
                let pull_id = reader.read_zint()?;
                let max_samples = if header & flag::N != 0 {
                    Some(reader.read_zint()?)
                } else {
                    None
                };
                return Ok(NetworkMessage::make_pull(
                    key,
                    pull_id,
                    max_samples,
                    header & flag::F != 0,
                ));
            }
            mid::QUERY => {
                if reply_context.is_some() {
                    return Err(CodecError::BadFlag);
                }
                let key = decode_wire_expr(reader, has_key)?;
                let parameters = reader.read_zstr()?.to_string();
                let qid = reader.read_zint()?;
                let target = if header & flag::T != 0 {
                    QueryTarget::from_wire(reader.read_zint()?).ok_or(CodecError::BadFlag)?
                } else {
                    QueryTarget::BestMatching
                };
                let consolidation = ConsolidationMode::from_wire(reader.read_zint()?)
                    .ok_or(CodecError::BadFlag)?;
                let payload = if header & flag::B != 0 {
                    let info = decode_data_info(reader)?;
                    let bytes = Bytes::copy_from_slice(reader.read_zbytes()?);
                    Some((info, bytes))
                } else {
                    None
                };
                return Ok(NetworkMessage::make_query(Query {
                    key,
                    parameters,
                    qid,
                    target,
                    consolidation,
                    payload,
                }));
            }
            _ => return Err(CodecError::BadHeader),
        }
    }
}
