//! Per-connection protocol engine.
//!
//! [`Connection`] drives one [`BoltIo`] channel through the Bolt 5.x state
//! machine: handshake metadata, HELLO, query execution with batched record
//! streaming, explicit transactions, recovery via RESET and routing table
//! fetches. It owns every stream opened on the channel and is the single
//! authority on the connection's health.
//!
//! State machine:
//!
//! ```text
//! Unauthorized -> Authenticating -> Ready
//! Ready --RUN--> Streaming --summary--> Ready
//! Ready --BEGIN--> Tx --RUN--> StreamingTx --summary--> Tx --COMMIT/ROLLBACK--> Ready
//! any --FAILURE--> Failed --RESET--> Ready
//! any --socket error / authorization expiry--> Dead (terminal)
//! ```
//!
//! A `Failed` connection refuses all work except RESET; `Dead` refuses
//! everything. Illegal operations in healthy states are usage errors and
//! never change state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bolt::message::{
    Auth, BeginMessage, BoltRequest, BoltResponse, DiscardMessage, FailureMessage, HelloMessage,
    PullMessage, RouteMessage, RoutingTable, RunMessage, SuccessMessage,
};
use crate::bolt::{BoltError, BoltIo, BoltVersion, Value};

use super::error::{DriverError, DriverResult};
use super::stream::{Fetched, Record, StreamBook, StreamHandle, Summary};

/// Fetch size used when the caller asks for the driver default.
pub const DEFAULT_FETCH_SIZE: i64 = 1000;

/// Access mode of a unit of work, used for routing and sent with BEGIN/RUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Route to a writer; the wire default
    #[default]
    Write,
    /// Route to a reader
    Read,
}

/// Transaction timeout: either unset (field omitted on the wire) or an
/// explicit non-negative duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxTimeout {
    /// No timeout configured; the server default applies
    #[default]
    Unset,
    /// Explicit timeout, sent as milliseconds
    Set(Duration),
}

/// Transaction configuration sent with BEGIN and auto-commit RUN.
#[derive(Debug, Clone, Default)]
pub struct TxConfig {
    /// Access mode
    pub mode: AccessMode,
    /// Bookmarks the transaction must causally follow
    pub bookmarks: Vec<String>,
    /// Transaction timeout
    pub timeout: TxTimeout,
    /// Caller-provided transaction metadata
    pub metadata: HashMap<String, Value>,
    /// User to impersonate
    pub impersonated_user: Option<String>,
}

impl TxConfig {
    /// Build the extra map for BEGIN / auto-commit RUN. Empty fields are
    /// omitted from the wire.
    fn extra(&self, database: Option<&str>) -> HashMap<String, Value> {
        let mut extra = HashMap::new();
        if self.mode == AccessMode::Read {
            extra.insert("mode".to_string(), Value::from("r"));
        }
        if !self.bookmarks.is_empty() {
            extra.insert(
                "bookmarks".to_string(),
                Value::List(self.bookmarks.iter().map(|b| Value::from(b.as_str())).collect()),
            );
        }
        if let TxTimeout::Set(timeout) = self.timeout {
            extra.insert(
                "tx_timeout".to_string(),
                Value::Integer(timeout.as_millis() as i64),
            );
        }
        if !self.metadata.is_empty() {
            extra.insert("tx_metadata".to_string(), Value::Map(self.metadata.clone()));
        }
        if let Some(ref user) = self.impersonated_user {
            extra.insert("imp_user".to_string(), Value::from(user.as_str()));
        }
        if let Some(db) = database {
            if !db.is_empty() {
                extra.insert("db".to_string(), Value::from(db));
            }
        }
        extra
    }
}

/// A query to execute.
#[derive(Debug, Clone)]
pub struct Command {
    /// Query text
    pub query: String,
    /// Query parameters
    pub parameters: HashMap<String, Value>,
    /// Records per PULL batch: positive, 0 for the driver default, -1 for
    /// fetch-all
    pub fetch_size: i64,
}

impl Command {
    /// A parameterless command with the default fetch size.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: HashMap::new(),
            fetch_size: 0,
        }
    }

    /// Set parameters.
    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the fetch size.
    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.fetch_size = fetch_size;
        self
    }
}

/// Normalize a configured fetch size to what goes on the wire.
pub(crate) fn normalize_fetch_size(fetch_size: i64) -> i64 {
    if fetch_size == 0 {
        DEFAULT_FETCH_SIZE
    } else if fetch_size < 0 {
        -1
    } else {
        fetch_size
    }
}

/// Opaque handle to the open explicit transaction on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle(u64);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel open, HELLO not yet sent
    Unauthorized,
    /// HELLO sent, reply pending
    Authenticating,
    /// Idle, ready for work
    Ready,
    /// Auto-commit stream attached
    Streaming,
    /// Explicit transaction open, no stream attached
    Tx,
    /// Explicit transaction open with a stream attached
    StreamingTx,
    /// Server reported a failure; only RESET is accepted
    Failed,
    /// Terminal; no further I/O is attempted
    Dead,
}

/// One authenticated connection to a server.
pub struct Connection<IO: BoltIo> {
    io: IO,
    state: ConnectionState,
    server_name: String,
    version: BoltVersion,
    server_agent: Option<String>,
    connection_id: Option<String>,
    database: Option<String>,
    bookmark: String,
    streams: StreamBook,
    tx_counter: u64,
    current_tx: Option<u64>,
    pending_error: Option<DriverError>,
}

impl<IO: BoltIo> Connection<IO> {
    /// Authenticate a handshaken channel with HELLO.
    ///
    /// The `routing` context, when configured (even empty), is announced in
    /// HELLO on protocol 5.1+. An authentication failure leaves nothing to
    /// salvage; the channel is closed and the error returned.
    pub async fn connect(
        mut io: IO,
        server_name: impl Into<String>,
        auth: Auth,
        user_agent: &str,
        routing: Option<&HashMap<String, String>>,
    ) -> DriverResult<Self> {
        let version = io.version();
        if version.major != 5 {
            io.close().await;
            return Err(DriverError::connectivity(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let mut hello = HelloMessage::new(user_agent, auth);
        if version.minor >= 1 {
            if let Some(context) = routing {
                hello = hello.with_routing(context.clone());
            }
        }

        let mut connection = Self {
            io,
            state: ConnectionState::Unauthorized,
            server_name: server_name.into(),
            version,
            server_agent: None,
            connection_id: None,
            database: None,
            bookmark: String::new(),
            streams: StreamBook::new(),
            tx_counter: 0,
            current_tx: None,
            pending_error: None,
        };

        if let Err(err) = connection.authenticate(hello).await {
            connection.io.close().await;
            return Err(err);
        }
        Ok(connection)
    }

    async fn authenticate(&mut self, hello: HelloMessage) -> DriverResult<()> {
        self.send(BoltRequest::Hello(hello)).await?;
        self.state = ConnectionState::Authenticating;

        match self.recv().await? {
            BoltResponse::Success(success) => {
                self.server_agent = success.server().map(String::from);
                self.connection_id = success.connection_id().map(String::from);
                if let Some(timeout) = success.recv_timeout() {
                    self.io.set_read_timeout(Some(timeout));
                }
                self.state = ConnectionState::Ready;
                Ok(())
            }
            BoltResponse::Failure(failure) => {
                // Nothing to recover; the server closes its side after a
                // failed HELLO.
                let err = DriverError::database(failure.code, failure.message);
                self.state = ConnectionState::Dead;
                self.pending_error = Some(err.clone());
                Err(err)
            }
            other => Err(self.on_unexpected(&other, "HELLO")),
        }
    }

    // ------------------------------------------------------------------
    // Query execution
    // ------------------------------------------------------------------

    /// Execute an auto-commit query. Valid in `Ready` only; pipelines
    /// RUN + PULL and returns the attached stream without waiting for
    /// records.
    pub async fn run(&mut self, command: Command, config: TxConfig) -> DriverResult<StreamHandle> {
        self.assert_state(&[ConnectionState::Ready], "run")?;
        let extra = config.extra(self.database.as_deref());
        let handle = self.run_with(command, extra).await?;
        self.state = ConnectionState::Streaming;
        Ok(handle)
    }

    /// Execute a query inside the open explicit transaction. Valid in `Tx`
    /// only.
    pub async fn run_tx(&mut self, tx: TxHandle, command: Command) -> DriverResult<StreamHandle> {
        self.assert_state(&[ConnectionState::Tx], "run_tx")?;
        self.assert_current_tx(tx)?;
        let handle = self.run_with(command, HashMap::new()).await?;
        self.state = ConnectionState::StreamingTx;
        Ok(handle)
    }

    async fn run_with(
        &mut self,
        command: Command,
        extra: HashMap<String, Value>,
    ) -> DriverResult<StreamHandle> {
        let fetch_size = normalize_fetch_size(command.fetch_size);

        self.send(BoltRequest::Run(RunMessage::new(
            command.query,
            command.parameters,
            extra,
        )))
        .await?;
        self.send(BoltRequest::Pull(PullMessage::new(fetch_size))).await?;

        match self.recv().await? {
            BoltResponse::Success(success) => {
                let keys = Arc::new(success.fields().unwrap_or_default());
                let qid = success.qid().unwrap_or(-1);
                let t_first = success.t_first();
                Ok(self.streams.open(keys, qid, fetch_size, t_first))
            }
            BoltResponse::Failure(failure) => Err(self.on_failure(failure)),
            other => Err(self.on_unexpected(&other, "RUN")),
        }
    }

    /// Result field names of a stream.
    pub fn keys(&self, handle: StreamHandle) -> DriverResult<Arc<Vec<String>>> {
        self.streams
            .get(handle)
            .map(|s| s.keys.clone())
            .ok_or_else(|| DriverError::usage("unknown stream handle"))
    }

    // ------------------------------------------------------------------
    // Stream consumption
    // ------------------------------------------------------------------

    /// Fetch the next record, or the summary once the stream completes.
    ///
    /// Buffered records are served even when the connection is dead; a
    /// sticky stream error is returned on every call after the buffer
    /// drains.
    pub async fn next(&mut self, handle: StreamHandle) -> DriverResult<Fetched> {
        let stream = self
            .streams
            .get_mut(handle)
            .ok_or_else(|| DriverError::usage("unknown stream handle"))?;

        if let Some(record) = stream.buffer.pop_front() {
            return Ok(Fetched::Record(record));
        }
        if let Some(err) = &stream.error {
            return Err(err.clone());
        }
        if let Some(summary) = &stream.summary {
            return Ok(Fetched::Summary(summary.clone()));
        }
        if !stream.attached {
            return Err(DriverError::usage("stream is no longer attached"));
        }
        self.receive_next(handle).await
    }

    /// Read from the wire until the attached stream yields a record or
    /// finishes. Batch boundaries are crossed transparently with a fresh
    /// PULL.
    async fn receive_next(&mut self, handle: StreamHandle) -> DriverResult<Fetched> {
        loop {
            match self.recv_for_stream(handle).await? {
                BoltResponse::Record(record) => {
                    let stream = self.streams.get_mut(handle).expect("attached stream");
                    let keys = stream.keys.clone();
                    return Ok(Fetched::Record(Record::new(keys, record.values)));
                }
                BoltResponse::Success(success) => {
                    if success.has_more() {
                        let n = self
                            .streams
                            .get(handle)
                            .map(|s| s.fetch_size)
                            .unwrap_or(-1);
                        self.send_for_stream(handle, BoltRequest::Pull(PullMessage::new(n)))
                            .await?;
                        continue;
                    }
                    let summary = self.finish_stream(handle, &success);
                    return Ok(Fetched::Summary(summary));
                }
                BoltResponse::Failure(failure) => {
                    return Err(self.fail_stream(handle, failure));
                }
                other => return Err(self.on_unexpected(&other, "stream")),
            }
        }
    }

    /// Drain all remaining records (across batches) into the stream buffer.
    ///
    /// A terminal failure while draining becomes the stream's sticky error
    /// and does not fail this call; only an unknown handle does.
    pub async fn buffer(&mut self, handle: StreamHandle) -> DriverResult<()> {
        {
            let stream = self
                .streams
                .get(handle)
                .ok_or_else(|| DriverError::usage("unknown stream handle"))?;
            if stream.is_finished() || !stream.attached {
                return Ok(());
            }
        }

        loop {
            let response = match self.recv_for_stream(handle).await {
                Ok(response) => response,
                // Sticky on the stream; the buffered prefix stays readable
                Err(_) => return Ok(()),
            };
            match response {
                BoltResponse::Record(record) => {
                    let stream = self.streams.get_mut(handle).expect("attached stream");
                    let keys = stream.keys.clone();
                    stream.buffer.push_back(Record::new(keys, record.values));
                }
                BoltResponse::Success(success) => {
                    if success.has_more() {
                        let n = self
                            .streams
                            .get(handle)
                            .map(|s| s.fetch_size)
                            .unwrap_or(-1);
                        if self
                            .send_for_stream(handle, BoltRequest::Pull(PullMessage::new(n)))
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                        continue;
                    }
                    self.finish_stream(handle, &success);
                    return Ok(());
                }
                BoltResponse::Failure(failure) => {
                    self.fail_stream(handle, failure);
                    return Ok(());
                }
                other => {
                    self.on_unexpected(&other, "stream");
                    return Ok(());
                }
            }
        }
    }

    /// Discard all remaining records and return the summary.
    ///
    /// Drains the in-flight batch; if the server reports more, a single
    /// `DISCARD(-1)` ends the stream regardless of what its reply claims.
    pub async fn consume(&mut self, handle: StreamHandle) -> DriverResult<Summary> {
        let stream = self
            .streams
            .get(handle)
            .ok_or_else(|| DriverError::usage("unknown stream handle"))?;
        if let Some(err) = &stream.error {
            return Err(err.clone());
        }
        if let Some(summary) = &stream.summary {
            return Ok(summary.clone());
        }
        if !stream.attached {
            return Err(DriverError::usage("stream is no longer attached"));
        }
        self.discard_stream(handle).await
    }

    async fn discard_stream(&mut self, handle: StreamHandle) -> DriverResult<Summary> {
        loop {
            match self.recv_for_stream(handle).await? {
                BoltResponse::Record(_) => continue,
                BoltResponse::Success(success) => {
                    if !success.has_more() {
                        return Ok(self.finish_stream(handle, &success));
                    }
                    // Batch exhausted but the stream continues on the
                    // server; one DISCARD ends it.
                    self.send_for_stream(handle, BoltRequest::Discard(DiscardMessage::all()))
                        .await?;
                    loop {
                        match self.recv_for_stream(handle).await? {
                            BoltResponse::Record(_) => continue,
                            BoltResponse::Success(reply) => {
                                return Ok(self.finish_stream(handle, &reply));
                            }
                            BoltResponse::Failure(failure) => {
                                return Err(self.fail_stream(handle, failure));
                            }
                            other => return Err(self.on_unexpected(&other, "DISCARD")),
                        }
                    }
                }
                BoltResponse::Failure(failure) => {
                    return Err(self.fail_stream(handle, failure));
                }
                other => return Err(self.on_unexpected(&other, "stream")),
            }
        }
    }

    // ------------------------------------------------------------------
    // Explicit transactions
    // ------------------------------------------------------------------

    /// Open an explicit transaction. BEGIN is sent eagerly; any failure
    /// surfaces immediately and fails the connection.
    pub async fn tx_begin(&mut self, config: TxConfig) -> DriverResult<TxHandle> {
        self.assert_state(&[ConnectionState::Ready], "tx_begin")?;

        let extra = config.extra(self.database.as_deref());
        self.send(BoltRequest::Begin(BeginMessage::new(extra))).await?;
        match self.recv().await? {
            BoltResponse::Success(_) => {
                self.state = ConnectionState::Tx;
                self.tx_counter += 1;
                self.current_tx = Some(self.tx_counter);
                Ok(TxHandle(self.tx_counter))
            }
            BoltResponse::Failure(failure) => Err(self.on_failure(failure)),
            other => Err(self.on_unexpected(&other, "BEGIN")),
        }
    }

    /// Commit the open transaction, capturing the bookmark on success.
    ///
    /// A stream still attached is discarded first so COMMIT meets a clean
    /// connection. In `Failed` state the original failure is returned.
    pub async fn tx_commit(&mut self, tx: TxHandle) -> DriverResult<()> {
        self.assert_state(
            &[ConnectionState::Tx, ConnectionState::StreamingTx],
            "tx_commit",
        )?;
        self.assert_current_tx(tx)?;

        if let Some(attached) = self.streams.attached() {
            self.discard_stream(attached).await?;
        }

        self.send(BoltRequest::Commit).await?;
        match self.recv().await? {
            BoltResponse::Success(success) => {
                if let Some(bookmark) = success.bookmark() {
                    if !bookmark.is_empty() {
                        self.bookmark = bookmark.to_string();
                    }
                }
                self.state = ConnectionState::Ready;
                self.current_tx = None;
                Ok(())
            }
            BoltResponse::Failure(failure) => Err(self.on_failure(failure)),
            other => Err(self.on_unexpected(&other, "COMMIT")),
        }
    }

    /// Roll back the open transaction. No bookmark is captured.
    pub async fn tx_rollback(&mut self, tx: TxHandle) -> DriverResult<()> {
        self.assert_state(
            &[ConnectionState::Tx, ConnectionState::StreamingTx],
            "tx_rollback",
        )?;
        self.assert_current_tx(tx)?;

        if let Some(attached) = self.streams.attached() {
            self.discard_stream(attached).await?;
        }

        self.send(BoltRequest::Rollback).await?;
        match self.recv().await? {
            BoltResponse::Success(_) => {
                self.state = ConnectionState::Ready;
                self.current_tx = None;
                Ok(())
            }
            BoltResponse::Failure(failure) => Err(self.on_failure(failure)),
            other => Err(self.on_unexpected(&other, "ROLLBACK")),
        }
    }

    // ------------------------------------------------------------------
    // Recovery and routing
    // ------------------------------------------------------------------

    /// Bring the connection back to `Ready`.
    ///
    /// No-op when already `Ready`; refused when `Dead`. Otherwise every
    /// open stream is abandoned, RESET is sent, and replies to pipelined
    /// requests (IGNORED, stale records and failures) are drained until the
    /// RESET's own SUCCESS arrives.
    pub async fn reset(&mut self) -> DriverResult<()> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        self.force_reset().await
    }

    /// RESET regardless of state; the pool uses this as a liveness probe on
    /// idle connections.
    pub(crate) async fn force_reset(&mut self) -> DriverResult<()> {
        if self.state == ConnectionState::Dead {
            return Err(self.dead_error());
        }

        self.streams
            .abandon(DriverError::usage("stream discarded by connection reset"));
        self.current_tx = None;

        self.send(BoltRequest::Reset).await?;
        loop {
            match self.recv().await? {
                BoltResponse::Success(_) => {
                    self.state = ConnectionState::Ready;
                    self.pending_error = None;
                    return Ok(());
                }
                // Replies to requests pipelined before the RESET
                BoltResponse::Ignored | BoltResponse::Record(_) | BoltResponse::Failure(_) => {
                    continue
                }
            }
        }
    }

    /// Fetch the routing table for a database.
    pub async fn route(
        &mut self,
        context: HashMap<String, String>,
        bookmarks: Vec<String>,
        database: Option<&str>,
        impersonated_user: Option<&str>,
    ) -> DriverResult<RoutingTable> {
        self.assert_state(&[ConnectionState::Ready], "route")?;

        self.send(BoltRequest::Route(RouteMessage {
            context,
            bookmarks,
            database: database
                .filter(|db| !db.is_empty())
                .map(String::from)
                .or_else(|| self.database.clone()),
            impersonated_user: impersonated_user
                .filter(|user| !user.is_empty())
                .map(String::from),
        }))
        .await?;

        match self.recv().await? {
            BoltResponse::Success(success) => success
                .routing_table()
                .ok_or_else(|| DriverError::protocol("ROUTE reply carries no routing table")),
            BoltResponse::Failure(failure) => Err(self.on_failure(failure)),
            other => Err(self.on_unexpected(&other, "ROUTE")),
        }
    }

    /// Close the connection: best-effort GOODBYE, then channel shutdown.
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Dead {
            let _ = self.io.send(BoltRequest::Goodbye).await;
        }
        self.io.close().await;
        self.state = ConnectionState::Dead;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection can still do I/O.
    pub fn is_alive(&self) -> bool {
        self.state != ConnectionState::Dead
    }

    /// Name of the server this connection talks to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Server agent string from HELLO.
    pub fn server_agent(&self) -> Option<&str> {
        self.server_agent.as_deref()
    }

    /// Server-assigned connection id.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> BoltVersion {
        self.version
    }

    /// Latest bookmark observed on this connection; empty until one was.
    pub fn bookmark(&self) -> &str {
        &self.bookmark
    }

    /// Forget the observed bookmark. The pool calls this on release so a
    /// bookmark never leaks into the next borrower's session.
    pub(crate) fn clear_bookmark(&mut self) {
        self.bookmark.clear();
    }

    /// Select the database subsequent work runs against.
    pub fn select_database(&mut self, database: impl Into<String>) {
        self.database = Some(database.into());
    }

    /// Selected database, if any.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Whether the server can address multiple databases. Always true on
    /// protocol 5.
    pub fn supports_multi_database(&self) -> bool {
        self.version.major >= 4
    }

    // ------------------------------------------------------------------
    // Failure plumbing
    // ------------------------------------------------------------------

    fn assert_state(&self, allowed: &[ConnectionState], operation: &str) -> DriverResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        match self.state {
            ConnectionState::Dead | ConnectionState::Failed => Err(self.dead_error()),
            state => Err(DriverError::usage(format!(
                "{} is not allowed in state {:?}",
                operation, state
            ))),
        }
    }

    fn assert_current_tx(&self, tx: TxHandle) -> DriverResult<()> {
        if self.current_tx == Some(tx.0) {
            Ok(())
        } else {
            Err(DriverError::usage("transaction handle is not open"))
        }
    }

    fn dead_error(&self) -> DriverError {
        self.pending_error
            .clone()
            .unwrap_or_else(|| DriverError::connectivity("connection is not usable"))
    }

    async fn send(&mut self, request: BoltRequest) -> DriverResult<()> {
        match self.io.send(request).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.on_io_error(err)),
        }
    }

    async fn recv(&mut self) -> DriverResult<BoltResponse> {
        match self.io.recv().await {
            Ok(response) => Ok(response),
            Err(err) => Err(self.on_io_error(err)),
        }
    }

    /// Like [`Self::send`], but a failure also poisons the given stream.
    async fn send_for_stream(
        &mut self,
        handle: StreamHandle,
        request: BoltRequest,
    ) -> DriverResult<()> {
        self.send(request).await.map_err(|err| {
            if let Some(stream) = self.streams.get_mut(handle) {
                stream.error.get_or_insert(err.clone());
            }
            err
        })
    }

    /// Like [`Self::recv`], but a failure also poisons the given stream.
    async fn recv_for_stream(&mut self, handle: StreamHandle) -> DriverResult<BoltResponse> {
        self.recv().await.map_err(|err| {
            if let Some(stream) = self.streams.get_mut(handle) {
                stream.error.get_or_insert(err.clone());
            }
            err
        })
    }

    /// Record a terminal summary: store it, detach, leave streaming state,
    /// capture the bookmark when the server issued one.
    fn finish_stream(&mut self, handle: StreamHandle, success: &SuccessMessage) -> Summary {
        let stream = self.streams.get_mut(handle).expect("open stream");
        let summary = Summary::from_success(success, stream.t_first);
        stream.summary = Some(summary.clone());
        self.streams.detach();
        self.state = match self.state {
            ConnectionState::Streaming => ConnectionState::Ready,
            ConnectionState::StreamingTx => ConnectionState::Tx,
            state => state,
        };
        if let Some(bookmark) = success.bookmark() {
            if !bookmark.is_empty() {
                self.bookmark = bookmark.to_string();
            }
        }
        summary
    }

    /// Record a FAILURE that terminates a stream: sticky on the stream,
    /// connection state per the failure class.
    fn fail_stream(&mut self, handle: StreamHandle, failure: FailureMessage) -> DriverError {
        let err = self.on_failure(failure);
        if let Some(stream) = self.streams.get_mut(handle) {
            stream.error = Some(err.clone());
        }
        self.streams.detach();
        err
    }

    /// Server-reported FAILURE: authorization expiry kills the connection,
    /// anything else leaves it `Failed` and recoverable via RESET.
    fn on_failure(&mut self, failure: FailureMessage) -> DriverError {
        let authorization_expired = failure.is_authorization_expired();
        let err = DriverError::database(failure.code, failure.message);
        self.state = if authorization_expired {
            ConnectionState::Dead
        } else {
            ConnectionState::Failed
        };
        self.pending_error = Some(err.clone());
        err
    }

    /// Channel-level error: the connection is unrecoverable. Unfinished
    /// streams are poisoned; their buffered records stay readable.
    fn on_io_error(&mut self, err: BoltError) -> DriverError {
        let err = DriverError::from(err);
        tracing::debug!(server = %self.server_name, error = %err, "connection lost");
        self.state = ConnectionState::Dead;
        self.pending_error = Some(err.clone());
        self.streams.abandon(err.clone());
        err
    }

    /// A reply that cannot occur at this point in the protocol.
    fn on_unexpected(&mut self, response: &BoltResponse, context: &str) -> DriverError {
        let err = DriverError::protocol(format!(
            "unexpected {} in response to {}",
            response.name(),
            context
        ));
        self.state = ConnectionState::Dead;
        self.pending_error = Some(err.clone());
        self.streams.abandon(err.clone());
        err
    }
}

impl<IO: BoltIo> std::fmt::Debug for Connection<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server_name)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("connection_id", &self.connection_id)
            .field("database", &self.database)
            .finish()
    }
}
