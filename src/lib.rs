//! # Grafite Driver
//!
//! An async Rust driver for the [Grafite](https://grafite.dev) graph
//! database speaking the Bolt 5.x protocol.
//!
//! ## Features
//!
//! - **Bolt Protocol 5.x** - handshake, authentication, batched result
//!   streaming, explicit transactions, routing
//! - **Async/Await** - built on Tokio; every I/O-bearing call is
//!   cancellable by dropping its future
//! - **Connection Pooling** - bounded pool with lazy recovery of failed
//!   connections
//! - **Managed Retries** - read/write transaction functions with jittered
//!   backoff and failure classification
//! - **Causal Consistency** - bookmark propagation across the session
//!
//! ## Basic Usage
//!
//! The byte-level PackStream codec ships separately and is injected as a
//! factory:
//!
//! ```rust,no_run
//! use grafite_driver::{AuthToken, Driver, Fetched, SessionConfig};
//! # fn packstream_codec() -> Box<dyn grafite_driver::bolt::MessageCodec> { unimplemented!() }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Driver::new(
//!     "grafite://localhost:7687",
//!     AuthToken::basic("grafite", "password"),
//!     std::sync::Arc::new(|| packstream_codec()),
//! )?;
//!
//! let mut session = driver.session(SessionConfig::default())?;
//! let stream = session.run("MATCH (n) RETURN n LIMIT 10", None, None).await?;
//! loop {
//!     match session.next(stream).await? {
//!         Fetched::Record(record) => println!("{:?}", record.values()),
//!         Fetched::Summary(_) => break,
//!     }
//! }
//!
//! session.close().await?;
//! driver.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Explicit Transactions
//!
//! ```rust,no_run
//! # use grafite_driver::{Driver, SessionConfig};
//! # async fn example(driver: Driver<grafite_driver::TcpConnect>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = driver.session(SessionConfig::default())?;
//!
//! let tx = session.begin_transaction(None).await?;
//! let stream = session.transaction_run(tx, "CREATE (n:Node) RETURN n", None).await?;
//! session.consume(stream).await?;
//! session.commit_transaction(tx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Managed Transactions
//!
//! Work units run under the retry coordinator and must be safe to replay:
//!
//! ```rust,no_run
//! use grafite_driver::{
//!     bolt::BoltIo, DriverResult, ManagedTransaction, TransactionWork,
//! };
//!
//! struct CountNodes;
//!
//! impl<IO: BoltIo> TransactionWork<IO> for CountNodes {
//!     type Output = i64;
//!
//!     async fn execute(&mut self, tx: &mut ManagedTransaction<IO>) -> DriverResult<i64> {
//!         let stream = tx.run("MATCH (n) RETURN count(n)", None).await?;
//!         tx.consume(stream).await?;
//!         Ok(0)
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - sessions, transactions, pooling, retries
//! - [`bolt`] - low-level protocol plumbing

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bolt;
pub mod driver;

// Re-exports for convenience
pub use driver::{
    AccessMode, AuthToken, Command, Connect, Connection, ConnectionState, DirectRouter, Driver,
    DriverConfig, DriverConfigBuilder, DriverError, DriverResult, Fetched, ManagedTransaction,
    Record, RetryPolicy, Router, RoutingTable, ServerAddress, ServerInfo, Session, SessionConfig,
    SessionConfigBuilder, StreamRef, Summary, TcpConnect, TransactionConfig, TransactionWork,
    TxRef, TxTimeout,
};

pub use bolt::{BoltError, BoltVersion, Value};
