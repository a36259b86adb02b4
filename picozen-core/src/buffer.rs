//! Segmented receive buffer.
//!
//! Stream links deliver arbitrary byte chunks that rarely align with
//! message boundaries. `RecvBuffer` queues the chunks as refcounted
//! `Bytes` segments and lets the transport peel off exactly one
//! length-prefixed serialized message at a time, copying only when a
//! message straddles a segment boundary.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct RecvBuffer {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl RecvBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queue a freshly read chunk. Empty chunks are ignored.
    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Copy the first `n` bytes into `dst` without consuming them.
    ///
    /// Returns `false` if fewer than `n` bytes are buffered.
    pub fn peek(&self, n: usize, dst: &mut [u8]) -> bool {
        if n > self.len || dst.len() < n {
            return false;
        }
        let mut remaining = n;
        let mut off = 0;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(seg.len());
            dst[off..off + take].copy_from_slice(&seg[..take]);
            off += take;
            remaining -= take;
        }
        true
    }

    /// Drop the first `n` bytes, releasing fully consumed segments.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.len);
        self.len -= n;
        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }

    /// Take exactly `n` bytes from the front.
    ///
    /// Zero-copy when the front segment covers the request; otherwise the
    /// bytes are gathered into one contiguous buffer.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let front = self.segs.front_mut()?;
        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return Some(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self
                .segs
                .pop_front()
                .expect("len accounting guarantees segments");
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
            self.len -= take;
            if take < seg.len() {
                let mut rest = seg;
                rest.advance(take);
                self.segs.push_front(rest);
            }
        }
        Some(out.freeze())
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_take_single_segment() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"hello world"));
        assert_eq!(buf.len(), 11);
        let taken = buf.take(5).unwrap();
        assert_eq!(&taken[..], b"hello");
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn take_across_segments() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        buf.push(Bytes::from_static(b"ef"));
        let taken = buf.take(5).unwrap();
        assert_eq!(&taken[..], b"abcde");
        assert_eq!(buf.len(), 1);
        assert_eq!(&buf.take(1).unwrap()[..], b"f");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        let mut hdr = [0u8; 3];
        assert!(buf.peek(3, &mut hdr));
        assert_eq!(&hdr, b"abc");
        assert_eq!(buf.len(), 4);
        assert!(!buf.peek(5, &mut [0u8; 5]));
    }

    #[test]
    fn advance_partial_segment() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"abcdef"));
        buf.advance(2);
        assert_eq!(buf.len(), 4);
        assert_eq!(&buf.take(4).unwrap()[..], b"cdef");
    }

    #[test]
    fn take_too_much_fails() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        assert!(buf.take(3).is_none());
        assert_eq!(buf.len(), 2);
    }
}
