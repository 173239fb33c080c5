//! Transport error taxonomy.
//!
//! [`TransportError`] describes a single failed link operation and is
//! absorbed by the channel's reconnect loop. [`ChannelError`] is what
//! channel callers actually observe once the channel gives up.

use std::time::Duration;

/// Failure of one physical link operation (connect, write, read).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Peer closed the connection or the stream ended.
    #[error("connection closed")]
    Closed,
    /// Opening handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Connect attempt exceeded its deadline.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// Peer refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// Socket level I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
    /// Framing or protocol violation on an established link.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Post-connect hook reported a failure.
    #[error("post-connect hook failed: {0}")]
    Hook(String),
    /// The address can never be connected to.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Whether the reconnect loop should retry after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_))
    }

    /// Short label used for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Handshake(_) => "handshake",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
            Self::Io(_) => "io",
            Self::Protocol(_) => "protocol",
            Self::Hook(_) => "hook",
            Self::InvalidUrl(_) => "invalid_url",
        }
    }
}

/// Error surfaced to channel callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The reconnect budget was used up.
    #[error("transport exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Connect attempts made in the final reconnect.
        attempts: u32,
        /// Error from the last attempt.
        last_error: TransportError,
    },
    /// A non-recoverable transport error.
    #[error("unrecoverable transport error: {0}")]
    Fatal(TransportError),
    /// The channel already shut down.
    #[error("channel closed")]
    Closed,
    /// The channel was cancelled while the operation was outstanding.
    #[error("channel cancelled")]
    Cancelled,
    /// Outbound message could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Whether this error is the exhausted reconnect budget.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
