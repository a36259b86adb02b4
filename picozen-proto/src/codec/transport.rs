//! Encode/decode for transport and scouting messages.

use bytes::{Bytes, BytesMut};
use picozen_core::id::{WhatAmI, WhatAmIMatcher, ZenohId};
use picozen_core::locator::Locator;

use crate::codec::network::{decode_network_message, encode_network_message};
use crate::error::{CodecError, Result};
use crate::ext::skip_extensions;
use crate::reader::{Reader, WireWrite};
use crate::transport::{
    flag, mid, Close, ConduitSnList, Fragment, Frame, FrameMessages, Hello, InitAck, InitSyn,
    Join, OpenAck, OpenSyn, Scout, ScoutingMessage, SizeParams, SnPair, SnResolution,
    TransportMessage,
};

const MID_MASK: u8 = 0x1F;

// --------------------------------------------------------------------------
// Fields
// --------------------------------------------------------------------------

/// `|zid_len-1 (4b)|extra (1b)|low (3b)|` byte used by Scout/Hello/Init/Join.
fn zid_len_byte(zid: &ZenohId, extra: bool, low: u8) -> u8 {
    let len = (zid.wire_len() - 1) as u8;
    (len << 4) | (u8::from(extra) << 3) | (low & 0x07)
}

fn decode_zid(reader: &mut Reader<'_>, len_byte: u8) -> Result<ZenohId> {
    let zid_len = ((len_byte >> 4) & 0x0F) as usize + 1;
    ZenohId::from_slice(reader.read_slice(zid_len)?).ok_or(CodecError::BadHeader)
}

fn whatami_from(low: u8) -> Result<WhatAmI> {
    WhatAmI::from_wire(low).ok_or(CodecError::BadFlag)
}

fn encode_size_params(buf: &mut BytesMut, params: &SizeParams) {
    buf.write_u8(params.sn_resolution.0);
    buf.write_u16_le(params.batch_size);
}

fn decode_size_params(reader: &mut Reader<'_>) -> Result<SizeParams> {
    let exp = reader.read_u8()?;
    if exp == 0 || exp > 63 {
        return Err(CodecError::BadFlag);
    }
    let batch_size = reader.read_u16_le()?;
    Ok(SizeParams {
        sn_resolution: SnResolution(exp),
        batch_size,
    })
}

/// Lease encoding: multiples of one second ride the `T` flag as seconds.
fn lease_flag_value(lease_ms: u64) -> (bool, u64) {
    if lease_ms >= 1000 && lease_ms % 1000 == 0 {
        (true, lease_ms / 1000)
    } else {
        (false, lease_ms)
    }
}

// --------------------------------------------------------------------------
// Scouting
// --------------------------------------------------------------------------

pub fn encode_scouting_message(buf: &mut BytesMut, msg: &ScoutingMessage) {
    match msg {
        ScoutingMessage::Scout(scout) => {
            buf.write_u8(mid::SCOUT);
            buf.write_u8(scout.version);
            match &scout.zid {
                Some(zid) => {
                    buf.write_u8(zid_len_byte(zid, true, scout.what.0));
                    buf.write_slice(zid.wire_bytes());
                }
                None => buf.write_u8(scout.what.0 & 0x07),
            }
        }
        ScoutingMessage::Hello(hello) => {
            let header = mid::HELLO
                | if hello.locators.is_empty() {
                    0
                } else {
                    flag::L
                };
            buf.write_u8(header);
            buf.write_u8(hello.version);
            buf.write_u8(zid_len_byte(&hello.zid, false, hello.whatami.to_wire()));
            buf.write_slice(hello.zid.wire_bytes());
            if !hello.locators.is_empty() {
                buf.write_zint(hello.locators.len() as u64);
                for locator in &hello.locators {
                    buf.write_zstr(&locator.to_string());
                }
            }
        }
    }
}

pub fn decode_scouting_message(reader: &mut Reader<'_>) -> Result<ScoutingMessage> {
    let header = reader.read_u8()?;
    let msg = match header & MID_MASK {
        mid::SCOUT => {
            let version = reader.read_u8()?;
            let what_byte = reader.read_u8()?;
            let what = WhatAmIMatcher(what_byte & 0x07);
            let zid = if what_byte & flag::I != 0 {
                Some(decode_zid(reader, what_byte)?)
            } else {
                None
            };
            ScoutingMessage::Scout(Scout { version, what, zid })
        }
        mid::HELLO => {
            let version = reader.read_u8()?;
            let wai_byte = reader.read_u8()?;
            let whatami = whatami_from(wai_byte & 0x03)?;
            let zid = decode_zid(reader, wai_byte)?;
            let locators = if header & flag::L != 0 {
                let count = reader.read_zint_usize()?;
                let mut out = Vec::with_capacity(count.min(8));
                for _ in 0..count {
                    let s = reader.read_zstr()?;
                    out.push(Locator::parse(s).map_err(|_| CodecError::BadHeader)?);
                }
                out
            } else {
                Vec::new()
            };
            ScoutingMessage::Hello(Hello {
                version,
                whatami,
                zid,
                locators,
            })
        }
        _ => return Err(CodecError::BadHeader),
    };
    if header & flag::Z != 0 {
        skip_extensions(reader)?;
    }
    Ok(msg)
}

// --------------------------------------------------------------------------
// Transport
// --------------------------------------------------------------------------

/// Encode one transport message into `buf`.
pub fn encode_transport_message(buf: &mut BytesMut, msg: &TransportMessage) {
    match msg {
        TransportMessage::Join(join) => {
            let (lease_s, lease_value) = lease_flag_value(join.lease_ms);
            let mut header = mid::JOIN;
            if lease_s {
                header |= flag::T;
            }
            if !join.size_params.is_default() {
                header |= flag::S;
            }
            buf.write_u8(header);
            buf.write_u8(join.version);
            let qos = matches!(join.next_sn, ConduitSnList::Qos(_));
            buf.write_u8(zid_len_byte(&join.zid, qos, join.whatami.to_wire()));
            buf.write_slice(join.zid.wire_bytes());
            buf.write_zint(lease_value);
            if !join.size_params.is_default() {
                encode_size_params(buf, &join.size_params);
            }
            match &join.next_sn {
                ConduitSnList::Plain(pair) => {
                    buf.write_zint(pair.reliable);
                    buf.write_zint(pair.best_effort);
                }
                ConduitSnList::Qos(pairs) => {
                    for pair in pairs {
                        buf.write_zint(pair.reliable);
                        buf.write_zint(pair.best_effort);
                    }
                }
            }
        }
        TransportMessage::InitSyn(init) => {
            let mut header = mid::INIT;
            if !init.size_params.is_default() {
                header |= flag::S;
            }
            buf.write_u8(header);
            buf.write_u8(init.version);
            buf.write_u8(zid_len_byte(&init.zid, false, init.whatami.to_wire()));
            buf.write_slice(init.zid.wire_bytes());
            if !init.size_params.is_default() {
                encode_size_params(buf, &init.size_params);
            }
        }
        TransportMessage::InitAck(init) => {
            let mut header = mid::INIT | flag::A;
            if !init.size_params.is_default() {
                header |= flag::S;
            }
            buf.write_u8(header);
            buf.write_u8(init.version);
            buf.write_u8(zid_len_byte(&init.zid, false, init.whatami.to_wire()));
            buf.write_slice(init.zid.wire_bytes());
            if !init.size_params.is_default() {
                encode_size_params(buf, &init.size_params);
            }
            buf.write_zbytes(&init.cookie);
        }
        TransportMessage::OpenSyn(open) => {
            let (lease_s, lease_value) = lease_flag_value(open.lease_ms);
            let mut header = mid::OPEN;
            if lease_s {
                header |= flag::T_OPEN;
            }
            buf.write_u8(header);
            buf.write_zint(lease_value);
            buf.write_zint(open.initial_sn);
            buf.write_zbytes(&open.cookie);
        }
        TransportMessage::OpenAck(open) => {
            let (lease_s, lease_value) = lease_flag_value(open.lease_ms);
            let mut header = mid::OPEN | flag::A;
            if lease_s {
                header |= flag::T_OPEN;
            }
            buf.write_u8(header);
            buf.write_zint(lease_value);
            buf.write_zint(open.initial_sn);
        }
        TransportMessage::Close(close) => {
            let header = mid::CLOSE | if close.session { flag::S_CLOSE } else { 0 };
            buf.write_u8(header);
            buf.write_u8(close.reason);
        }
        TransportMessage::KeepAlive => {
            buf.write_u8(mid::KEEP_ALIVE);
        }
        TransportMessage::Frame(frame) => {
            let header = mid::FRAME | if frame.reliable { flag::R } else { 0 };
            buf.write_u8(header);
            buf.write_zint(frame.sn);
            for msg in &frame.messages {
                encode_network_message(buf, msg);
            }
        }
        TransportMessage::Fragment(fragment) => {
            let mut header = mid::FRAGMENT;
            if fragment.reliable {
                header |= flag::R;
            }
            if fragment.more {
                header |= flag::M;
            }
            buf.write_u8(header);
            buf.write_zint(fragment.sn);
            buf.write_slice(&fragment.payload);
        }
    }
}

/// Decode one transport message. Frame and Fragment consume the whole
/// remaining buffer: the caller bounds the reader to one serialized
/// message (length prefix on streams, datagram boundary otherwise).
pub fn decode_transport_message(reader: &mut Reader<'_>) -> Result<TransportMessage> {
    let header = reader.read_u8()?;
    let has_exts = header & flag::Z != 0;
    let msg = match header & MID_MASK {
        mid::JOIN => {
            let version = reader.read_u8()?;
            let wai_byte = reader.read_u8()?;
            let whatami = whatami_from(wai_byte & 0x03)?;
            let qos = wai_byte & 0x08 != 0;
            let zid = decode_zid(reader, wai_byte)?;
            let lease_raw = reader.read_zint()?;
            let lease_ms = if header & flag::T != 0 {
                lease_raw.saturating_mul(1000)
            } else {
                lease_raw
            };
            let size_params = if header & flag::S != 0 {
                decode_size_params(reader)?
            } else {
                SizeParams::default()
            };
            if has_exts {
                skip_extensions(reader)?;
            }
            let next_sn = if qos {
                let mut pairs = [SnPair::default(); 8];
                for pair in &mut pairs {
                    pair.reliable = reader.read_zint()?;
                    pair.best_effort = reader.read_zint()?;
                }
                ConduitSnList::Qos(pairs)
            } else {
                ConduitSnList::Plain(SnPair {
                    reliable: reader.read_zint()?,
                    best_effort: reader.read_zint()?,
                })
            };
            TransportMessage::Join(Join {
                version,
                whatami,
                zid,
                lease_ms,
                size_params,
                next_sn,
            })
        }
        mid::INIT => {
            let version = reader.read_u8()?;
            let wai_byte = reader.read_u8()?;
            let whatami = whatami_from(wai_byte & 0x03)?;
            let zid = decode_zid(reader, wai_byte)?;
            let size_params = if header & flag::S != 0 {
                decode_size_params(reader)?
            } else {
                SizeParams::default()
            };
            if header & flag::A != 0 {
                let cookie = Bytes::copy_from_slice(reader.read_zbytes()?);
                if has_exts {
                    skip_extensions(reader)?;
                }
                TransportMessage::InitAck(InitAck {
                    version,
                    whatami,
                    zid,
                    size_params,
                    cookie,
                })
            } else {
                if has_exts {
                    skip_extensions(reader)?;
                }
                TransportMessage::InitSyn(InitSyn {
                    version,
                    whatami,
                    zid,
                    size_params,
                })
            }
        }
        mid::OPEN => {
            let lease_raw = reader.read_zint()?;
            let lease_ms = if header & flag::T_OPEN != 0 {
                lease_raw.saturating_mul(1000)
            } else {
                lease_raw
            };
            let initial_sn = reader.read_zint()?;
            if header & flag::A != 0 {
                if has_exts {
                    skip_extensions(reader)?;
                }
                TransportMessage::OpenAck(OpenAck {
                    lease_ms,
                    initial_sn,
                })
            } else {
                let cookie = Bytes::copy_from_slice(reader.read_zbytes()?);
                if has_exts {
                    skip_extensions(reader)?;
                }
                TransportMessage::OpenSyn(OpenSyn {
                    lease_ms,
                    initial_sn,
                    cookie,
                })
            }
        }
        mid::CLOSE => {
            let reason = reader.read_u8()?;
            if has_exts {
                skip_extensions(reader)?;
            }
            TransportMessage::Close(Close {
                reason,
                session: header & flag::S_CLOSE != 0,
            })
        }
        mid::KEEP_ALIVE => {
            if has_exts {
                skip_extensions(reader)?;
            }
            TransportMessage::KeepAlive
        }
        mid::FRAME => {
            let sn = reader.read_zint()?;
            if has_exts {
                skip_extensions(reader)?;
            }
            let mut messages = FrameMessages::new();
            while !reader.is_empty() {
                messages.push(decode_network_message(reader)?);
            }
            TransportMessage::Frame(Frame {
                sn,
                reliable: header & flag::R != 0,
                messages,
            })
        }
        mid::FRAGMENT => {
            let sn = reader.read_zint()?;
            if has_exts {
                skip_extensions(reader)?;
            }
            let payload = Bytes::copy_from_slice(reader.read_remaining());
            TransportMessage::Fragment(Fragment {
                sn,
                reliable: header & flag::R != 0,
                more: header & flag::M != 0,
                payload,
            })
        }
        _ => return Err(CodecError::BadHeader),
    };
    Ok(msg)
}
