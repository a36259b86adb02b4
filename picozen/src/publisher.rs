//! Publishers: the writing side of pub/sub.
//!
//! A declared publisher registers its keyexpr as a numeric resource so
//! every publication cites the compact alias instead of the full string.

use std::sync::Weak;

use bytes::Bytes;

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::EntityId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::{Encoding, Reliability};

use crate::sample::SampleKind;
use crate::session::SessionInner;

/// Options for declaring a publisher or for a one-shot put.
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    pub encoding: Encoding,
    /// Publications may be dropped under congestion.
    pub droppable: bool,
    pub reliability: Reliability,
}

pub(crate) struct PublisherState {
    /// Resource alias the publisher writes through.
    pub rid: u64,
    pub options: PublisherOptions,
}

/// A declared publisher. Dropping it undeclares.
pub struct Publisher {
    pub(crate) session: Weak<SessionInner>,
    pub(crate) id: EntityId,
    pub(crate) key: KeyExpr,
}

impl Publisher {
    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key
    }

    /// Publish a PUT sample.
    pub async fn put(&self, payload: impl Into<Bytes>) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        session
            .publisher_write(self.id, SampleKind::Put, payload.into(), None)
            .await
    }

    /// Publish a DELETE sample.
    pub async fn delete(&self) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        session
            .publisher_write(self.id, SampleKind::Delete, Bytes::new(), None)
            .await
    }

    /// Undeclare explicitly, emitting the forget declarations now.
    pub async fn undeclare(self) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        session.undeclare_publisher(self.id)?;
        session.flush().await
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.undeclare_publisher(self.id);
        }
    }
}
