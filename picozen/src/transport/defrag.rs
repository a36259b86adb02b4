//! Per-channel defragmentation buffer.
//!
//! Holds the prefix of at most one in-progress fragmented network
//! message. Delivery of the final fragment, any error, or a channel
//! reset drains and clears the buffer.

use bytes::{Bytes, BytesMut};
use picozen_core::error::{ZError, ZResult};
use picozen_proto::transport::FRAG_MAX_SIZE;

#[derive(Debug, Default)]
pub(crate) struct DefragBuffer {
    buf: BytesMut,
    /// Sn expected for the next fragment of the in-progress message.
    next_sn: Option<u64>,
}

impl DefragBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.next_sn.is_none()
    }

    /// True iff `sn` continues the in-progress message (or starts one).
    pub(crate) fn is_expected(&self, sn: u64) -> bool {
        match self.next_sn {
            None => true,
            Some(expected) => expected == sn,
        }
    }

    /// Append one fragment. `next_sn` is the sn the following fragment
    /// must carry.
    pub(crate) fn push(&mut self, payload: &[u8], next_sn: u64) -> ZResult<()> {
        if self.buf.len() + payload.len() > FRAG_MAX_SIZE {
            self.clear();
            return Err(ZError::protocol("fragmented message exceeds maximum size"));
        }
        self.buf.extend_from_slice(payload);
        self.next_sn = Some(next_sn);
        Ok(())
    }

    /// Take the reassembled serialized message, emptying the buffer.
    pub(crate) fn finalize(&mut self) -> Bytes {
        self.next_sn = None;
        self.buf.split().freeze()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.next_sn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_finalizes() {
        let mut defrag = DefragBuffer::new();
        assert!(defrag.is_empty());
        assert!(defrag.is_expected(10));
        defrag.push(b"abc", 11).unwrap();
        assert!(defrag.is_expected(11));
        assert!(!defrag.is_expected(12));
        defrag.push(b"def", 12).unwrap();
        assert_eq!(&defrag.finalize()[..], b"abcdef");
        assert!(defrag.is_empty());
    }

    #[test]
    fn clear_resets_expectation() {
        let mut defrag = DefragBuffer::new();
        defrag.push(b"abc", 2).unwrap();
        defrag.clear();
        assert!(defrag.is_empty());
        assert!(defrag.is_expected(99));
    }

    #[test]
    fn oversized_message_rejected() {
        let mut defrag = DefragBuffer::new();
        let chunk = vec![0u8; FRAG_MAX_SIZE / 2 + 1];
        defrag.push(&chunk, 1).unwrap();
        assert!(defrag.push(&chunk, 2).is_err());
        assert!(defrag.is_empty());
    }
}
