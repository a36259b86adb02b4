//! Bounded publication history, indexed by source sequence number.

use bytes::Bytes;
use picozen_core::collections::RingBuffer;
use picozen_proto::network::Encoding;

use crate::sample::SampleKind;

#[derive(Debug, Clone)]
pub(crate) struct CachedSample {
    pub sn: u64,
    pub kind: SampleKind,
    pub payload: Bytes,
    pub encoding: Option<Encoding>,
}

/// The last N published samples, evicted FIFO by sequence number.
pub(crate) struct PublicationCache {
    ring: RingBuffer<CachedSample>,
}

impl PublicationCache {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            ring: RingBuffer::new(depth.max(1)),
        }
    }

    pub(crate) fn insert(&mut self, sample: CachedSample) {
        let _ = self.ring.push(sample);
    }

    /// Samples with `first <= sn <= last`, in sn order. Open bounds
    /// select from the oldest or up to the newest.
    pub(crate) fn range(&self, first: Option<u64>, last: Option<u64>) -> Vec<CachedSample> {
        self.ring
            .iter()
            .filter(|s| first.map_or(true, |f| s.sn >= f))
            .filter(|s| last.map_or(true, |l| s.sn <= l))
            .cloned()
            .collect()
    }

    pub(crate) fn latest_sn(&self) -> Option<u64> {
        self.ring.iter().map(|s| s.sn).max()
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sn: u64) -> CachedSample {
        CachedSample {
            sn,
            kind: SampleKind::Put,
            payload: Bytes::from(sn.to_string()),
            encoding: None,
        }
    }

    #[test]
    fn eviction_is_fifo_by_sn() {
        let mut cache = PublicationCache::new(3);
        for sn in 1..=5 {
            cache.insert(sample(sn));
        }
        assert_eq!(cache.len(), 3);
        let kept: Vec<u64> = cache.range(None, None).iter().map(|s| s.sn).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(cache.latest_sn(), Some(5));
    }

    #[test]
    fn range_selection() {
        let mut cache = PublicationCache::new(10);
        for sn in 1..=5 {
            cache.insert(sample(sn));
        }
        let got: Vec<u64> = cache
            .range(Some(2), Some(4))
            .iter()
            .map(|s| s.sn)
            .collect();
        assert_eq!(got, vec![2, 3, 4]);
        let all: Vec<u64> = cache.range(None, None).iter().map(|s| s.sn).collect();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }
}
