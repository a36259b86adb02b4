//! Queryables: the serving side of the query/reply path.

use std::sync::Arc;
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;

use picozen_core::error::{ZError, ZResult};
use picozen_core::handlers::Callback;
use picozen_core::id::EntityId;
use picozen_core::keyexpr::KeyExpr;
use picozen_proto::network::{DataInfo, Encoding};

use crate::sample::SampleKind;
use crate::session::SessionInner;

/// Options for declaring a queryable.
#[derive(Debug, Clone, Default)]
pub struct QueryableOptions {
    /// Advertise this queryable as holding the complete data set for its
    /// key expression.
    pub complete: bool,
}

/// One buffered reply, sent on the wire (or looped back) after the
/// queryable callback returns.
#[derive(Debug, Clone)]
pub(crate) struct QueuedReply {
    pub key: KeyExpr,
    pub payload: Bytes,
    pub info: DataInfo,
}

pub(crate) struct QueryInner {
    pub key: KeyExpr,
    pub parameters: String,
    pub payload: Option<(DataInfo, Bytes)>,
    pub replies: Mutex<Vec<QueuedReply>>,
}

/// A query under evaluation by a queryable callback.
///
/// Replies posted here are flushed, followed by the final marker, once
/// the callback returns.
#[derive(Clone)]
pub struct Query {
    pub(crate) inner: Arc<QueryInner>,
}

impl Query {
    pub(crate) fn new(
        key: KeyExpr,
        parameters: String,
        payload: Option<(DataInfo, Bytes)>,
    ) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                key,
                parameters,
                payload,
                replies: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.inner.key
    }

    #[must_use]
    pub fn parameters(&self) -> &str {
        &self.inner.parameters
    }

    /// Payload attached to the query, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> {
        self.inner.payload.as_ref().map(|(_, b)| b)
    }

    /// Post a PUT reply for `key`.
    pub fn reply(
        &self,
        key: &KeyExpr,
        payload: impl Into<Bytes>,
        encoding: Option<Encoding>,
    ) -> ZResult<()> {
        let info = DataInfo {
            encoding,
            ..DataInfo::default()
        };
        self.inner.replies.lock().push(QueuedReply {
            key: key.clone(),
            payload: payload.into(),
            info,
        });
        Ok(())
    }

    /// Post a DELETE reply for `key`.
    pub fn reply_del(&self, key: &KeyExpr) -> ZResult<()> {
        let info = DataInfo {
            kind: Some(SampleKind::Delete.to_wire()),
            ..DataInfo::default()
        };
        self.inner.replies.lock().push(QueuedReply {
            key: key.clone(),
            payload: Bytes::new(),
            info,
        });
        Ok(())
    }

    /// Post a reply with fully specified metadata.
    pub(crate) fn reply_info(
        &self,
        key: &KeyExpr,
        payload: impl Into<Bytes>,
        info: DataInfo,
    ) -> ZResult<()> {
        self.inner.replies.lock().push(QueuedReply {
            key: key.clone(),
            payload: payload.into(),
            info,
        });
        Ok(())
    }

    pub(crate) fn take_replies(&self) -> Vec<QueuedReply> {
        std::mem::take(&mut *self.inner.replies.lock())
    }
}

pub(crate) struct QueryableState {
    pub key: KeyExpr,
    pub complete: bool,
    pub callback: Callback<Query>,
}

/// A declared queryable. Dropping it undeclares.
pub struct Queryable {
    pub(crate) session: Weak<SessionInner>,
    pub(crate) id: EntityId,
    pub(crate) key: KeyExpr,
}

impl Queryable {
    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key
    }

    /// Undeclare explicitly, emitting the forget declaration now.
    pub async fn undeclare(self) -> ZResult<()> {
        let session = self
            .session
            .upgrade()
            .ok_or(ZError::SessionClosed)?;
        session.undeclare_queryable(self.id)?;
        session.flush().await
    }
}

impl Queryable {
    /// Detach the handle from undeclare-on-drop; the declaration then
    /// lives as long as the session. Used for internal queryables.
    pub(crate) fn into_raw(mut self) -> EntityId {
        self.session = Weak::new();
        self.id
    }
}

impl Drop for Queryable {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.undeclare_queryable(self.id);
        }
    }
}
