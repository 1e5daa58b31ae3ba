//! # Bolt Protocol Plumbing
//!
//! Low-level pieces of the Bolt 5.x client protocol:
//!
//! - [`handshake`] - version negotiation
//! - [`frame`] - chunked message framing over a transport
//! - [`codec`] - the (delegated) byte codec interface
//! - [`message`] - typed request/response messages
//! - [`value`] - structural wire values
//!
//! Most users should use the high-level [`crate::driver`] module instead of
//! interacting with the protocol directly.

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod value;

use std::future::Future;
use std::time::Duration;

pub use codec::{CodecError, CodecFactory, MessageCodec};
pub use error::{BoltError, BoltResult};
pub use frame::{ChunkCodec, FramedIo, MAX_CHUNK_SIZE};
pub use handshake::{negotiate, BoltVersion, BOLT_MAGIC, PROPOSED_VERSIONS};
pub use message::{BoltRequest, BoltResponse};
pub use value::Value;

/// A typed, ordered message channel to one server.
///
/// [`frame::FramedIo`] is the production implementation; tests substitute a
/// scripted one. Messages are strictly FIFO in both directions; the caller
/// is responsible for consuming replies in send order.
pub trait BoltIo: Send {
    /// The protocol version negotiated for this channel.
    fn version(&self) -> BoltVersion;

    /// Set or clear the idle read deadline applied to [`BoltIo::recv`].
    fn set_read_timeout(&mut self, timeout: Option<Duration>);

    /// Send one request message.
    fn send(&mut self, request: BoltRequest) -> impl Future<Output = BoltResult<()>> + Send;

    /// Receive one response message.
    fn recv(&mut self) -> impl Future<Output = BoltResult<BoltResponse>> + Send;

    /// Shut the channel down. Close errors are moot and not reported.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
