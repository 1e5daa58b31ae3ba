//! Bolt protocol plumbing errors.

use std::io;

use thiserror::Error;

use super::codec::CodecError;

/// Result type for Bolt plumbing operations.
pub type BoltResult<T> = Result<T, BoltError>;

/// Errors produced by the transport, framing and handshake layers.
///
/// These never reach the public API directly; the connection translates them
/// into the driver error taxonomy at its boundary.
#[derive(Error, Debug)]
pub enum BoltError {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Version negotiation failed
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Message codec could not encode or decode a message
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Wire-level invariant broken (bad chunk, unexpected tag)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Idle read deadline exceeded
    #[error("Read timed out")]
    Timeout,

    /// Peer closed the connection
    #[error("Connection closed by server")]
    ConnectionClosed,
}

impl BoltError {
    /// Connection error with a message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Handshake error with a message.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BoltError::connection("refused");
        assert_eq!(err.to_string(), "Connection error: refused");

        assert_eq!(BoltError::Timeout.to_string(), "Read timed out");
        assert_eq!(
            BoltError::ConnectionClosed.to_string(),
            "Connection closed by server"
        );
    }

    #[test]
    fn test_error_from_io() {
        let err: BoltError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, BoltError::Io(_)));
    }
}
