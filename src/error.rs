//! Error types for the peerlink data plane.

use thiserror::Error;

/// Result type alias for peerlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the codec, queue, transport and proxy layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A buffer could not be decoded (truncated, bad version, bad tag).
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A well-formed message violated protocol rules (e.g. fragmented UDP).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A data channel with this label already exists on the transport.
    #[error("duplicate channel label: {0}")]
    DuplicateLabel(String),

    /// An operation was attempted on a channel that is no longer open.
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    /// Connection negotiation failed or the transport was torn down.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The queue holding this item was cleared before it was handled.
    #[error("cleared by handler")]
    Cleared,

    /// A single-shot consumer was replaced before its item arrived.
    #[error("cancelled by a new handler")]
    Cancelled,

    /// Network I/O error.
    #[error("network error: {0}")]
    Network(String),
}

impl Error {
    /// Create a new malformed-input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a new protocol-violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new transport-failure error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Check if this error came from decoding bytes off the wire.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Error::Malformed(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}
