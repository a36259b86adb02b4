//! Admin space: a queryable exposing live transport and link state
//! under `@/<zid>/pico/session/**`, with JSON payloads.

use picozen_core::error::ZResult;
use picozen_core::id::{WhatAmI, ZenohId};
use picozen_core::keyexpr::KeyExpr;
use serde::Serialize;

use crate::connectivity::{LinkInfo, TransportVariant};

/// The admin subtree served by one session.
pub(crate) fn admin_prefix(zid: ZenohId) -> ZResult<KeyExpr> {
    KeyExpr::new(format!("@/{zid}/pico/session"))
}

/// Everything the admin queryable reports about one transport peer.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TransportAdminEntry {
    pub zid: String,
    pub whatami: String,
    pub is_qos: bool,
    pub is_multicast: bool,
    pub is_shm: bool,
    #[serde(skip)]
    pub variant: TransportVariant,
    #[serde(skip)]
    pub peer_zid: ZenohId,
}

impl TransportAdminEntry {
    pub(crate) fn new(
        variant: TransportVariant,
        peer_zid: ZenohId,
        whatami: Option<WhatAmI>,
    ) -> Self {
        Self {
            zid: peer_zid.to_string(),
            whatami: whatami.map_or_else(|| "unknown".to_string(), |w| w.to_string()),
            is_qos: false,
            is_multicast: !matches!(variant, TransportVariant::Unicast),
            is_shm: false,
            variant,
            peer_zid,
        }
    }

    /// `.../transport/<variant>/<peer_zid>`
    pub(crate) fn key(&self, prefix: &KeyExpr) -> ZResult<KeyExpr> {
        prefix.join(&format!(
            "transport/{}/{}",
            self.variant.as_str(),
            self.peer_zid
        ))
    }
}

/// Everything the admin queryable reports about one link.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct LinkAdminEntry {
    pub zid: String,
    pub src: String,
    pub dst: String,
    pub mtu: u16,
    pub is_streamed: bool,
    pub is_reliable: bool,
    #[serde(skip)]
    pub variant: TransportVariant,
    #[serde(skip)]
    pub peer_zid: ZenohId,
    #[serde(skip)]
    pub link_id: usize,
}

impl LinkAdminEntry {
    pub(crate) fn new(
        local_zid: ZenohId,
        variant: TransportVariant,
        peer_zid: ZenohId,
        link_id: usize,
        info: &LinkInfo,
    ) -> Self {
        Self {
            zid: local_zid.to_string(),
            src: info.src.clone().unwrap_or_default(),
            dst: info.dst.clone().unwrap_or_default(),
            mtu: info.mtu,
            is_streamed: info.is_streamed,
            is_reliable: info.is_reliable,
            variant,
            peer_zid,
            link_id,
        }
    }

    /// `.../transport/<variant>/<peer_zid>/link/<link_id>`
    pub(crate) fn key(&self, prefix: &KeyExpr) -> ZResult<KeyExpr> {
        prefix.join(&format!(
            "transport/{}/{}/link/{}",
            self.variant.as_str(),
            self.peer_zid,
            self.link_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zid(fill: u8) -> ZenohId {
        let mut bytes = [0u8; 16];
        bytes[0] = fill;
        ZenohId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn transport_entry_shape() {
        let entry =
            TransportAdminEntry::new(TransportVariant::Unicast, zid(2), Some(WhatAmI::Router));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["whatami"], "router");
        assert_eq!(json["is_multicast"], false);
        assert_eq!(json["is_qos"], false);
        assert_eq!(json["is_shm"], false);
        assert!(json["zid"].as_str().unwrap().contains("02"));
    }

    #[test]
    fn keys_live_under_the_admin_prefix() {
        let prefix = admin_prefix(zid(1)).unwrap();
        let entry = TransportAdminEntry::new(TransportVariant::Multicast, zid(2), None);
        let key = entry.key(&prefix).unwrap();
        assert!(key.as_str().starts_with(prefix.as_str()));
        assert!(key.as_str().contains("/transport/multicast/"));

        let link = LinkAdminEntry::new(
            zid(1),
            TransportVariant::Multicast,
            zid(2),
            0,
            &LinkInfo {
                src: Some("udp/224.0.0.224:7447".into()),
                dst: None,
                mtu: 8192,
                is_streamed: false,
                is_reliable: false,
            },
        );
        let key = link.key(&prefix).unwrap();
        assert!(key.as_str().ends_with("/link/0"));
    }

    #[test]
    fn admin_prefix_intersects_wild_queries() {
        let prefix = admin_prefix(zid(1)).unwrap();
        let all = prefix.join("**").unwrap();
        let entry = TransportAdminEntry::new(TransportVariant::Unicast, zid(2), None);
        assert!(all.includes(&entry.key(&prefix).unwrap()));
    }
}
