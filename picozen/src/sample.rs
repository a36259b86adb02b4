//! Samples and replies: the values handed to user callbacks.

use bytes::Bytes;
use picozen_core::id::EntityGlobalId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::{DataInfo, Encoding, Timestamp};

/// Kind of observation carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleKind {
    #[default]
    Put,
    Delete,
}

/// Wire value reserved for advanced-publisher heartbeat sentinels; never
/// delivered to user callbacks.
pub(crate) const KIND_SENTINEL: u64 = 2;

impl SampleKind {
    #[must_use]
    pub(crate) const fn to_wire(self) -> u64 {
        match self {
            Self::Put => 0,
            Self::Delete => 1,
        }
    }

    #[must_use]
    pub(crate) const fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Put),
            1 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Source coordinates attached by advanced publishers and consumed by
/// sample-miss detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: EntityGlobalId,
    pub sn: u64,
}

/// Per-sample delivery attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qos {
    /// The sample may be dropped under congestion.
    pub droppable: bool,
}

/// A single observation at a key, as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key_expr: KeyExpr,
    pub payload: Bytes,
    pub encoding: Encoding,
    pub kind: SampleKind,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub qos: Qos,
}

impl Sample {
    /// Assemble a sample from its resolved keyexpr and wire parts.
    pub(crate) fn from_wire(
        key_expr: KeyExpr,
        payload: Bytes,
        info: Option<&DataInfo>,
        droppable: bool,
    ) -> Option<Self> {
        let kind = match info.and_then(|i| i.kind) {
            None => SampleKind::Put,
            Some(v) => SampleKind::from_wire(v)?,
        };
        let source_info = info.and_then(|i| match (i.source_id, i.source_sn) {
            (Some(zid), Some(sn)) => Some(SourceInfo {
                id: EntityGlobalId { zid, eid: 0 },
                sn,
            }),
            _ => None,
        });
        Some(Self {
            key_expr,
            payload,
            encoding: info
                .and_then(|i| i.encoding.clone())
                .unwrap_or_default(),
            kind,
            timestamp: info.and_then(|i| i.timestamp),
            source_info,
            qos: Qos { droppable },
        })
    }

    /// Project this sample back into wire metadata.
    pub(crate) fn to_data_info(&self) -> DataInfo {
        DataInfo {
            kind: match self.kind {
                SampleKind::Put => None,
                SampleKind::Delete => Some(self.kind.to_wire()),
            },
            encoding: if self.encoding == Encoding::default() {
                None
            } else {
                Some(self.encoding.clone())
            },
            timestamp: self.timestamp,
            source_id: self.source_info.map(|s| s.id.zid),
            source_sn: self.source_info.map(|s| s.sn),
        }
    }
}

/// One reply to a pending query. The end of the reply stream is signaled
/// by the reply channel disconnecting, not by a marker value.
#[derive(Debug, Clone)]
pub struct Reply {
    pub sample: Sample,
    pub replier_id: Option<picozen_core::id::ZenohId>,
}

/// Internal notification carried by a heartbeat sentinel: the latest
/// sequence number a publisher claims to have emitted.
#[derive(Debug, Clone)]
pub(crate) struct SentinelNotice {
    pub key: KeyExpr,
    pub source: SourceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kind_mapping() {
        assert_eq!(SampleKind::from_wire(0), Some(SampleKind::Put));
        assert_eq!(SampleKind::from_wire(1), Some(SampleKind::Delete));
        assert_eq!(SampleKind::from_wire(7), None);
    }

    #[test]
    fn missing_info_defaults_to_put() {
        let ke = KeyExpr::new("a/b").unwrap();
        let sample = Sample::from_wire(ke, Bytes::from_static(b"x"), None, false).unwrap();
        assert_eq!(sample.kind, SampleKind::Put);
        assert!(sample.timestamp.is_none());
        assert!(sample.source_info.is_none());
    }

    #[test]
    fn data_info_projection_skips_defaults() {
        let ke = KeyExpr::new("a/b").unwrap();
        let sample = Sample::from_wire(ke, Bytes::new(), None, false).unwrap();
        let info = sample.to_data_info();
        assert!(info.is_empty());
    }
}
