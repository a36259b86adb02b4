//! On-wire framing of serialized transport messages.
//!
//! Stream links prefix every serialized message with a little-endian
//! 16-bit byte count, capping one message at 65 535 bytes. Datagram
//! links carry exactly one message per datagram with no prefix.

use bytes::{Bytes, BytesMut};
use picozen_core::buffer::RecvBuffer;

use crate::codec::encode_transport_message;
use crate::error::{CodecError, Result};
use crate::reader::WireWrite;
use crate::transport::{TransportMessage, BATCH_SIZE_MAX};

/// Byte length of the stream length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Serialize one transport message, optionally with the stream prefix.
pub fn serialize_transport_message(
    msg: &TransportMessage,
    streamed: bool,
) -> Result<Bytes> {
    let mut body = BytesMut::new();
    if streamed {
        // Reserve the prefix slot, then patch it once the length is known.
        body.write_u16_le(0);
    }
    encode_transport_message(&mut body, msg);
    let payload_len = body.len() - if streamed { LENGTH_PREFIX_SIZE } else { 0 };
    if payload_len > usize::from(BATCH_SIZE_MAX) {
        return Err(CodecError::TooLargeBatch);
    }
    if streamed {
        let len_bytes = (payload_len as u16).to_le_bytes();
        body[0] = len_bytes[0];
        body[1] = len_bytes[1];
    }
    Ok(body.freeze())
}

/// Peel one length-prefixed serialized message off a stream receive
/// buffer. Returns `None` until a whole message is buffered.
pub fn split_stream_message(recv: &mut RecvBuffer) -> Option<Bytes> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if !recv.peek(LENGTH_PREFIX_SIZE, &mut prefix) {
        return None;
    }
    let len = usize::from(u16::from_le_bytes(prefix));
    if recv.len() < LENGTH_PREFIX_SIZE + len {
        return None;
    }
    recv.advance(LENGTH_PREFIX_SIZE);
    recv.take(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_transport_message;
    use crate::reader::Reader;

    #[test]
    fn stream_prefix_roundtrip() {
        let msg = TransportMessage::make_keep_alive();
        let wire = serialize_transport_message(&msg, true).unwrap();
        assert_eq!(wire.len(), LENGTH_PREFIX_SIZE + 1);
        assert_eq!(&wire[..2], &[1, 0]);

        let mut recv = RecvBuffer::new();
        recv.push(wire);
        let body = split_stream_message(&mut recv).unwrap();
        let mut reader = Reader::new(&body);
        assert_eq!(
            decode_transport_message(&mut reader).unwrap(),
            TransportMessage::KeepAlive
        );
    }

    #[test]
    fn partial_stream_data_waits() {
        let msg = TransportMessage::make_close(0, true);
        let wire = serialize_transport_message(&msg, true).unwrap();

        let mut recv = RecvBuffer::new();
        recv.push(wire.slice(..1));
        assert!(split_stream_message(&mut recv).is_none());
        recv.push(wire.slice(1..3));
        assert!(split_stream_message(&mut recv).is_none());
        recv.push(wire.slice(3..));
        assert!(split_stream_message(&mut recv).is_some());
        assert!(recv.is_empty());
    }

    #[test]
    fn datagram_has_no_prefix() {
        let msg = TransportMessage::make_keep_alive();
        let wire = serialize_transport_message(&msg, false).unwrap();
        assert_eq!(wire.len(), 1);
    }

    #[test]
    fn oversized_message_refused() {
        let payload = Bytes::from(vec![0u8; usize::from(BATCH_SIZE_MAX) + 1]);
        let msg = TransportMessage::make_fragment(0, true, false, payload);
        assert_eq!(
            serialize_transport_message(&msg, true),
            Err(CodecError::TooLargeBatch)
        );
    }
}
