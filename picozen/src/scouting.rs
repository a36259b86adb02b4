//! Scouting: discovering a router through the multicast group before
//! opening a unicast session.

use std::sync::Arc;

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::{WhatAmIMatcher, ZenohId};
use picozen_core::link::LinkManager;
use picozen_core::locator::Locator;
use picozen_proto::codec::{decode_scouting_message, encode_scouting_message};
use picozen_proto::reader::Reader;
use picozen_proto::transport::ScoutingMessage;
use tracing::{debug, trace};

use crate::config::Config;
use crate::transport::maybe_timeout;

/// Scout the multicast group for a router (or peer) and return the
/// first unicast locator it advertises.
pub(crate) async fn scout_for_locator(
    config: &Config,
    link_manager: &Arc<dyn LinkManager>,
    local_zid: ZenohId,
) -> ZResult<Locator> {
    let link = link_manager.open_link(&config.multicast_address).await?;

    let scout = ScoutingMessage::make_scout(WhatAmIMatcher::router_or_peer(), Some(local_zid));
    let mut buf = bytes::BytesMut::new();
    encode_scouting_message(&mut buf, &scout);
    link.write_all(&buf).await?;
    debug!(group = %config.multicast_address, "scouting for a router");

    let deadline = config.scouting_timeout_ms;
    let result = maybe_timeout(deadline, async {
        let mut read_buf = vec![0u8; 2048];
        loop {
            let (n, _) = link.read(&mut read_buf).await?;
            if n == 0 {
                return Err(ZError::LinkClosed);
            }
            let mut reader = Reader::new(&read_buf[..n]);
            match decode_scouting_message(&mut reader) {
                Ok(ScoutingMessage::Hello(hello)) => {
                    if let Some(locator) = hello.locators.into_iter().next() {
                        debug!(zid = %hello.zid, %locator, "router discovered");
                        return Ok(locator);
                    }
                    trace!(zid = %hello.zid, "hello without locators, keep scouting");
                }
                Ok(ScoutingMessage::Scout(_)) => {
                    // Another scouting party; not an answer.
                }
                Err(e) => {
                    trace!(error = %e, "undecodable scouting datagram");
                }
            }
        }
    })
    .await;

    let _ = link.close().await;
    result.map_err(|_| ZError::open_failed("scouting timed out with no usable Hello"))
}
