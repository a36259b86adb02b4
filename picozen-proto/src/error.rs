//! Codec failure modes.

use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Buffer too short")]
    ShortBuffer,

    #[error("Malformed message header")]
    BadHeader,

    #[error("Malformed variable-length integer")]
    BadVle,

    #[error("Invalid flag combination")]
    BadFlag,

    #[error("Unknown mandatory extension")]
    UnknownMandatoryExtension,

    #[error("Non-canonical key expression on the wire")]
    BadKeyexpr,

    #[error("Serialized batch exceeds the maximum length")]
    TooLargeBatch,

    #[error("Invalid UTF-8 in a wire string")]
    BadUtf8,
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
