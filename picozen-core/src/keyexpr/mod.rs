//! Key expression engine: canonicalization, validation, inclusion,
//! intersection, and concatenation over the wildcard DSL.
//!
//! A key expression is a non-empty sequence of non-empty `/`-separated
//! chunks. A chunk is literal text (UTF-8 minus `/`, `?`, `#`), the
//! single-chunk wildcard `*`, the multi-chunk wildcard `**`, or literal
//! text embedding the substring wildcard `$*`.

mod canon;
mod matching;

pub use canon::{canonize, is_canon, KeyExprCanonStatus};
pub use matching::{includes, intersects};

use std::borrow::Cow;
use std::fmt;

use crate::error::{ZError, ZResult};

/// An owned, canonical key expression.
///
/// Construction canonicalizes: the stored string is guaranteed to pass
/// [`is_canon`], so matching and wire encoding never have to re-check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyExpr(String);

impl KeyExpr {
    /// Canonicalize and validate `s`.
    pub fn new(s: impl AsRef<str>) -> ZResult<Self> {
        match canonize(s.as_ref()) {
            Ok(Cow::Borrowed(_)) => Ok(Self(s.as_ref().to_string())),
            Ok(Cow::Owned(canon)) => Ok(Self(canon)),
            Err(status) => Err(ZError::KeyExpr(status)),
        }
    }

    /// Wrap a string that is already known canonical.
    ///
    /// Used on receive paths after the codec has validated the wire form.
    #[must_use]
    pub fn from_canonical_unchecked(s: String) -> Self {
        debug_assert_eq!(is_canon(&s), KeyExprCanonStatus::Success);
        Self(s)
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff the expression contains any wildcard token.
    #[must_use]
    pub fn is_wild(&self) -> bool {
        self.0.contains('*')
    }

    /// Every key matched by `other` is matched by `self`.
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        includes(&self.0, &other.0)
    }

    /// Some key is matched by both.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        intersects(&self.0, &other.0)
    }

    /// Concatenate with `/`, re-canonicalizing the result.
    pub fn join(&self, suffix: &str) -> ZResult<Self> {
        if suffix.is_empty() {
            return Ok(self.clone());
        }
        let joined = if suffix.starts_with('/') {
            format!("{}{suffix}", self.0)
        } else {
            format!("{}/{suffix}", self.0)
        };
        Self::new(joined)
    }
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = ZError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for KeyExpr {
    type Error = ZError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl AsRef<str> for KeyExpr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_canonicalizes() {
        let ke = KeyExpr::new("a$*$*b/c").unwrap();
        assert_eq!(ke.as_str(), "a$*b/c");
        assert!(KeyExpr::new("a//b").is_err());
        assert!(KeyExpr::new("a/$*/b").is_err());
    }

    #[test]
    fn join_inserts_separator() {
        let base = KeyExpr::new("a/b").unwrap();
        assert_eq!(base.join("c/d").unwrap().as_str(), "a/b/c/d");
        assert_eq!(base.join("/c").unwrap().as_str(), "a/b/c");
        assert_eq!(base.join("").unwrap().as_str(), "a/b");
        assert!(base.join("/").is_err());
    }

    #[test]
    fn wildness() {
        assert!(KeyExpr::new("a/**").unwrap().is_wild());
        assert!(KeyExpr::new("a/*").unwrap().is_wild());
        assert!(!KeyExpr::new("a/b").unwrap().is_wild());
    }

    #[test]
    fn matching_through_the_owned_type() {
        let wide = KeyExpr::new("a/**").unwrap();
        let narrow = KeyExpr::new("a/b/c").unwrap();
        assert!(wide.includes(&narrow));
        assert!(!narrow.includes(&wide));
        assert!(wide.intersects(&narrow));
    }
}
