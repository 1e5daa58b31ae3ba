//! Bolt message types.
//!
//! Typed request and response messages exchanged over a connection. The
//! codec ([`crate::bolt::codec`]) maps these to and from message payload
//! bytes; nothing in this module touches the wire directly.

mod request;
mod response;

pub use request::{
    Auth, BeginMessage, BoltRequest, DiscardMessage, HelloMessage, PullMessage, RouteMessage,
    RunMessage,
};
pub use response::{BoltResponse, FailureMessage, RecordMessage, RoutingTable, SuccessMessage};

/// Structure tags identifying each message on the wire.
pub mod tag {
    /// HELLO - open and authenticate a connection
    pub const HELLO: u8 = 0x01;
    /// GOODBYE - close a connection gracefully
    pub const GOODBYE: u8 = 0x02;
    /// RESET - recover a connection to a clean state
    pub const RESET: u8 = 0x0F;
    /// RUN - execute a query
    pub const RUN: u8 = 0x10;
    /// BEGIN - open an explicit transaction
    pub const BEGIN: u8 = 0x11;
    /// COMMIT - commit the open transaction
    pub const COMMIT: u8 = 0x12;
    /// ROLLBACK - roll back the open transaction
    pub const ROLLBACK: u8 = 0x13;
    /// DISCARD - throw away records
    pub const DISCARD: u8 = 0x2F;
    /// PULL - request a batch of records
    pub const PULL: u8 = 0x3F;
    /// ROUTE - fetch the routing table
    pub const ROUTE: u8 = 0x66;
    /// SUCCESS - request completed
    pub const SUCCESS: u8 = 0x70;
    /// RECORD - one result row
    pub const RECORD: u8 = 0x71;
    /// IGNORED - request skipped after a failure
    pub const IGNORED: u8 = 0x7E;
    /// FAILURE - request failed
    pub const FAILURE: u8 = 0x7F;
}
