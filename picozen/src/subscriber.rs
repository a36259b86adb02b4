//! Subscribers: push-mode sample consumers.

use std::sync::Weak;

use picozen_core::error::{ZError, ZResult};
use picozen_core::handlers::Callback;
use picozen_core::id::EntityId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::Reliability;

use crate::sample::Sample;
use crate::session::SessionInner;

/// Options for declaring a subscriber.
#[derive(Debug, Clone, Default)]
pub struct SubscriberOptions {
    pub reliability: Reliability,
}

pub(crate) struct SubscriberState {
    pub key: KeyExpr,
    pub callback: Callback<Sample>,
    /// Advanced subscribers also consume housekeeping sentinels.
    pub sentinel: Option<Callback<crate::sample::SentinelNotice>>,
}

/// A declared subscriber. Dropping it undeclares: the forget
/// declaration is queued immediately and flushed by the next drive.
pub struct Subscriber {
    pub(crate) session: Weak<SessionInner>,
    pub(crate) id: EntityId,
    pub(crate) key: KeyExpr,
}

impl Subscriber {
    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key
    }

    /// Undeclare explicitly, emitting the forget declaration now.
    pub async fn undeclare(self) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        session.undeclare_subscriber(self.id)?;
        session.flush().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.undeclare_subscriber(self.id);
        }
    }
}
