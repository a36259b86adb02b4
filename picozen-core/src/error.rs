//! Error taxonomy for all picozen operations.
//!
//! Every fallible public operation returns [`ZResult`]. Applications that
//! need a C-style status integer can project any error onto a stable
//! [`ResultCode`] via [`ZError::code`].

use std::io;
use thiserror::Error;

use crate::keyexpr::KeyExprCanonStatus;

/// Main error type for picozen operations
#[derive(Error, Debug)]
pub enum ZError {
    /// IO error during link operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unparseable configuration key or value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unparseable locator string
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Allocator refused a request on a hot path
    #[error("Out of memory")]
    OutOfMemory,

    /// Malformed or non-canonical key expression
    #[error("Invalid key expression: {0:?}")]
    KeyExpr(KeyExprCanonStatus),

    /// Wire-level decode/encode failure (propagated from the codec layer)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session establishment failed
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// The remote lease expired without traffic
    #[error("Transport lease expired")]
    LeaseExpired,

    /// Sequence-number gap on the reliable channel
    #[error("Invalid sequence number on reliable channel")]
    InvalidSn,

    /// The underlying link was closed by the peer
    #[error("Link closed")]
    LinkClosed,

    /// Serialized message exceeds the negotiated batch size
    #[error("Batch overflow: {size} bytes (max: {max})")]
    BatchOverflow { size: usize, max: usize },

    /// No transport is available for the requested operation
    #[error("Transport not available")]
    TransportNotAvailable,

    /// The session was closed
    #[error("Session closed")]
    SessionClosed,

    /// An entity with the same id is already declared
    #[error("Already declared")]
    AlreadyDeclared,

    /// Undeclare targeted an unknown declaration id
    #[error("Unknown declaration id: {0}")]
    UnknownDeclaration(u32),

    /// Handler channel was disconnected
    #[error("Channel disconnected")]
    ChannelDisconnected,

    /// Non-blocking receive found no data
    #[error("Channel has no data")]
    ChannelNoData,

    /// Scheduler rejected a zero period
    #[error("Invalid period")]
    InvalidPeriod,

    /// Scheduler task table is full
    #[error("Scheduler task table full")]
    SchedulerFull,

    /// Scheduler removal targeted an unknown task id
    #[error("Unknown task id: {0}")]
    UnknownTask(u32),

    /// Generic string parse failure
    #[error("Parse error: {0}")]
    ParseString(String),

    /// Catch-all failure
    #[error("Generic error")]
    Generic,
}

/// Result type alias for picozen operations
pub type ZResult<T> = std::result::Result<T, ZError>;

/// Stable status codes surfaced to applications.
///
/// `Ok` is zero; every failure is negative. The enum is open: codes not
/// listed here may appear in future releases, always negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ResultCode {
    Ok = 0,
    SystemOutOfMemory = -1,
    Invalid = -2,
    ParseString = -3,
    ConfigLocatorInvalid = -4,
    TransportNotAvailable = -5,
    SessionClosed = -6,
    ChannelDisconnected = -7,
    ChannelNodata = -8,
    Generic = -128,
}

impl ZError {
    /// Project this error onto its stable application-visible code.
    #[must_use]
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::OutOfMemory => ResultCode::SystemOutOfMemory,
            Self::KeyExpr(_)
            | Self::InvalidSn
            | Self::InvalidPeriod
            | Self::UnknownTask(_)
            | Self::UnknownDeclaration(_)
            | Self::AlreadyDeclared => ResultCode::Invalid,
            Self::ParseString(_) | Self::Config(_) => ResultCode::ParseString,
            Self::InvalidLocator(_) => ResultCode::ConfigLocatorInvalid,
            Self::TransportNotAvailable | Self::OpenFailed(_) => {
                ResultCode::TransportNotAvailable
            }
            Self::SessionClosed => ResultCode::SessionClosed,
            Self::ChannelDisconnected => ResultCode::ChannelDisconnected,
            Self::ChannelNoData => ResultCode::ChannelNodata,
            _ => ResultCode::Generic,
        }
    }

    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an open-failed error with a reason
    pub fn open_failed(msg: impl Into<String>) -> Self {
        Self::OpenFailed(msg.into())
    }

    /// Check if this error is recoverable: the session stays open and the
    /// offending operation may simply be retried or dropped.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
            ),
            Self::OutOfMemory | Self::ChannelNoData | Self::BatchOverflow { .. } => true,
            _ => false,
        }
    }

    /// Check if this error must tear the transport down.
    #[must_use]
    pub const fn is_fatal_for_transport(&self) -> bool {
        matches!(
            self,
            Self::LeaseExpired | Self::InvalidSn | Self::LinkClosed | Self::OpenFailed(_)
        )
    }
}
