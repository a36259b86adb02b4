//! Liveliness: presence tokens and their observers.
//!
//! Tokens live under the reserved `@/liveliness` prefix. Declaring a
//! token publishes a PUT on `@/liveliness/<key>`; dropping the token or
//! closing the session publishes the matching DELETE. Observers are
//! plain subscribers declared on the prefixed expression.

use std::sync::Weak;

use picozen_core::error::{ZError, ZResult};
use picozen_core::id::EntityId;
use picozen_core::keyexpr::KeyExpr;

use crate::session::SessionInner;

/// Reserved keyexpr prefix for liveliness state.
pub const LIVELINESS_PREFIX: &str = "@/liveliness";

/// Prefix a user key with the liveliness namespace.
pub(crate) fn prefixed(key: &KeyExpr) -> ZResult<KeyExpr> {
    KeyExpr::new(format!("{LIVELINESS_PREFIX}/{key}"))
}

/// A declared liveliness token. Dropping it announces the loss.
pub struct LivelinessToken {
    pub(crate) session: Weak<SessionInner>,
    pub(crate) id: EntityId,
    pub(crate) key: KeyExpr,
}

impl LivelinessToken {
    /// The user-facing key of this token, without the reserved prefix.
    #[must_use]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key
    }

    /// Withdraw the token explicitly, emitting the DELETE now.
    pub async fn undeclare(self) -> ZResult<()> {
        let session = self.session.upgrade().ok_or(ZError::SessionClosed)?;
        session.undeclare_liveliness_token(self.id)?;
        session.flush().await
    }
}

impl Drop for LivelinessToken {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.undeclare_liveliness_token(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixing() {
        let key = KeyExpr::new("group/member1").unwrap();
        assert_eq!(
            prefixed(&key).unwrap().as_str(),
            "@/liveliness/group/member1"
        );
    }
}
