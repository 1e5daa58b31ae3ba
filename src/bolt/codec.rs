//! Message codec interface.
//!
//! The byte-level packer/unpacker (PackStream) is an external collaborator:
//! this crate only defines the contract it must satisfy. A codec turns a
//! typed [`BoltRequest`](crate::bolt::message::BoltRequest) into message
//! bytes and message bytes back into a typed
//! [`BoltResponse`](crate::bolt::message::BoltResponse). Chunked framing is
//! handled separately by [`crate::bolt::frame`]; the codec sees whole
//! message payloads, never chunk headers.
//!
//! Contract:
//!
//! - `decode` receives exactly one complete message payload.
//! - A metadata map with an unexpected shape for a known key is a
//!   [`CodecError::Malformed`]; unknown keys must be passed through
//!   untouched (the response accessors tolerate them).
//! - An unknown structure tag is a [`CodecError::UnknownTag`].

use bytes::BytesMut;
use thiserror::Error;

use super::message::{BoltRequest, BoltResponse};

/// Errors a message codec may produce.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Message payload does not decode to a known structure
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Structure tag does not identify a known message
    #[error("Unknown message tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// A value could not be represented on the wire
    #[error("Unencodable value: {0}")]
    Unencodable(String),
}

/// Encodes requests to and decodes responses from message payload bytes.
///
/// Implementations live outside this crate and are injected at driver
/// construction time. A codec instance is owned by a single connection and
/// may keep per-connection state (negotiated type patches etc).
pub trait MessageCodec: Send {
    /// Append the encoded form of `request` to `dst`.
    fn encode(&mut self, request: &BoltRequest, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode one complete message payload.
    fn decode(&mut self, src: &[u8]) -> Result<BoltResponse, CodecError>;
}

/// Factory producing one codec per connection.
pub type CodecFactory = std::sync::Arc<dyn Fn() -> Box<dyn MessageCodec> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display() {
        assert_eq!(
            CodecError::UnknownTag(0x7E).to_string(),
            "Unknown message tag: 0x7E"
        );
        assert_eq!(
            CodecError::Malformed("truncated map".into()).to_string(),
            "Malformed message: truncated map"
        );
    }
}
