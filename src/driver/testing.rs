//! Scripted test doubles.
//!
//! The original test suite runs the engine against a scripted server; here
//! the script sits directly behind the [`BoltIo`] seam. A [`ScriptIo`]
//! replays canned responses in order and records every request sent, and a
//! [`ScriptConnect`] hands the pool one scripted connection per expected
//! dial.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::bolt::message::{
    Auth, BoltRequest, BoltResponse, FailureMessage, RecordMessage, SuccessMessage,
};
use crate::bolt::{BoltError, BoltIo, BoltResult, BoltVersion, Value};

use super::connection::Connection;
use super::error::DriverResult;
use super::pool::Connect;
use super::retry::RetryPolicy;
use super::routing::Router;

/// One scripted server action.
#[derive(Debug, Clone)]
pub(crate) enum ScriptReply {
    /// Deliver a response
    Reply(BoltResponse),
    /// Close the connection instead of answering
    Hangup,
}

/// Requests recorded by a scripted channel, shared with the test body.
pub(crate) type SentLog = Arc<Mutex<Vec<BoltRequest>>>;

pub(crate) fn success(entries: &[(&str, Value)]) -> ScriptReply {
    ScriptReply::Reply(BoltResponse::Success(SuccessMessage::new(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )))
}

pub(crate) fn success_empty() -> ScriptReply {
    success(&[])
}

pub(crate) fn record(values: Vec<Value>) -> ScriptReply {
    ScriptReply::Reply(BoltResponse::Record(RecordMessage { values }))
}

pub(crate) fn failure(code: &str, message: &str) -> ScriptReply {
    ScriptReply::Reply(BoltResponse::Failure(FailureMessage::new(code, message)))
}

pub(crate) fn hangup() -> ScriptReply {
    ScriptReply::Hangup
}

/// The standard faked RUN exchange: reply header, three records, a summary
/// with bookmark "bm".
pub(crate) fn run_response() -> Vec<ScriptReply> {
    vec![
        success(&[
            ("fields", Value::List(vec!["f1".into(), "f2".into()])),
            ("t_first", Value::Integer(1)),
            ("qid", Value::Integer(7)),
        ]),
        record(vec!["1v1".into(), "1v2".into()]),
        record(vec!["2v1".into(), "2v2".into()]),
        record(vec!["3v1".into(), "3v2".into()]),
        success(&[("bookmark", "bm".into()), ("type", "r".into())]),
    ]
}

/// Scripted message channel.
pub(crate) struct ScriptIo {
    version: BoltVersion,
    replies: VecDeque<ScriptReply>,
    sent: SentLog,
    pub(crate) read_timeout: Option<Duration>,
}

/// Build a scripted channel and the handle to its request log.
pub(crate) fn script_io(version: BoltVersion, replies: Vec<ScriptReply>) -> (ScriptIo, SentLog) {
    let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
    (
        ScriptIo {
            version,
            replies: replies.into(),
            sent: sent.clone(),
            read_timeout: None,
        },
        sent,
    )
}

impl BoltIo for ScriptIo {
    fn version(&self) -> BoltVersion {
        self.version
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    async fn send(&mut self, request: BoltRequest) -> BoltResult<()> {
        self.sent.lock().push(request);
        Ok(())
    }

    async fn recv(&mut self) -> BoltResult<BoltResponse> {
        match self.replies.pop_front() {
            Some(ScriptReply::Reply(response)) => Ok(response),
            Some(ScriptReply::Hangup) | None => Err(BoltError::ConnectionClosed),
        }
    }

    async fn close(&mut self) {}
}

fn hello_success() -> ScriptReply {
    success(&[
        ("server", "Grafite/5.0".into()),
        ("connection_id", "bolt-1".into()),
    ])
}

/// A connection authenticated against the default HELLO script, followed by
/// `replies`.
pub(crate) async fn connected(replies: Vec<ScriptReply>) -> (Connection<ScriptIo>, SentLog) {
    connected_with(BoltVersion::new(5, 0), hello_success(), replies, None).await
}

/// Like [`connected`], with explicit version, HELLO reply and routing
/// context.
pub(crate) async fn connected_with(
    version: BoltVersion,
    hello_reply: ScriptReply,
    replies: Vec<ScriptReply>,
    routing: Option<HashMap<String, String>>,
) -> (Connection<ScriptIo>, SentLog) {
    let mut script = vec![hello_reply];
    script.extend(replies);
    let (io, sent) = script_io(version, script);
    let connection = Connection::connect(
        io,
        "serverName",
        Auth::basic("grafite", "pass"),
        "GrafiteDriver/test",
        routing.as_ref(),
    )
    .await
    .expect("scripted HELLO should succeed");
    (connection, sent)
}

/// Connector producing one scripted connection per queued script, in order.
///
/// Clones share the queue, so a test can keep a handle for inspecting the
/// per-connection request logs.
#[derive(Clone, Default)]
pub(crate) struct ScriptConnect {
    scripts: Arc<Mutex<VecDeque<Vec<ScriptReply>>>>,
    logs: Arc<Mutex<Vec<SentLog>>>,
}

impl ScriptConnect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next dialed connection. The HELLO exchange
    /// is implicit.
    pub fn push_script(&self, replies: Vec<ScriptReply>) {
        self.scripts.lock().push_back(replies);
    }

    /// Request logs of every connection dialed so far.
    pub fn sent_logs(&self) -> Vec<SentLog> {
        self.logs.lock().clone()
    }
}

impl Connect for ScriptConnect {
    type Io = ScriptIo;

    async fn connect(&self, address: &str) -> DriverResult<Connection<ScriptIo>> {
        let Some(replies) = self.scripts.lock().pop_front() else {
            return Err(crate::driver::error::DriverError::connectivity(format!(
                "no scripted connection left for {}",
                address
            )));
        };
        let mut script = vec![hello_success()];
        script.extend(replies);
        let (io, sent) = script_io(BoltVersion::new(5, 0), script);
        self.logs.lock().push(sent);
        Connection::connect(
            io,
            address,
            Auth::basic("grafite", "pass"),
            "GrafiteDriver/test",
            None,
        )
        .await
    }
}

/// Router whose answers are fixed and whose calls are recorded.
pub(crate) struct RecordingRouter {
    address: String,
    home: String,
    home_calls: AtomicUsize,
    invalidated_readers: Mutex<Vec<String>>,
    invalidated_writers: Mutex<Vec<String>>,
}

impl RecordingRouter {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            home: String::new(),
            home_calls: AtomicUsize::new(0),
            invalidated_readers: Mutex::new(Vec::new()),
            invalidated_writers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_home_database(mut self, home: impl Into<String>) -> Self {
        self.home = home.into();
        self
    }

    pub fn home_calls(&self) -> usize {
        self.home_calls.load(Ordering::SeqCst)
    }

    pub fn invalidated_writers(&self) -> Vec<String> {
        self.invalidated_writers.lock().clone()
    }

    #[allow(dead_code)]
    pub fn invalidated_readers(&self) -> Vec<String> {
        self.invalidated_readers.lock().clone()
    }
}

impl Router for RecordingRouter {
    fn readers<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>> {
        Box::pin(async move { Ok(vec![self.address.clone()]) })
    }

    fn writers<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _database: &'a str,
    ) -> BoxFuture<'a, DriverResult<Vec<String>>> {
        Box::pin(async move { Ok(vec![self.address.clone()]) })
    }

    fn default_database<'a>(
        &'a self,
        _bookmarks: &'a [String],
        _impersonated_user: Option<&'a str>,
    ) -> BoxFuture<'a, DriverResult<String>> {
        self.home_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.home.clone()) })
    }

    fn invalidate_reader<'a>(
        &'a self,
        _database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>> {
        self.invalidated_readers.lock().push(server.to_string());
        Box::pin(async move { Ok(()) })
    }

    fn invalidate_writer<'a>(
        &'a self,
        _database: &'a str,
        server: &'a str,
    ) -> BoxFuture<'a, DriverResult<()>> {
        self.invalidated_writers.lock().push(server.to_string());
        Box::pin(async move { Ok(()) })
    }

    fn clean_up(&self) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// A retry policy on a fake clock: sleeping advances the clock by the slept
/// duration, and every sleep is recorded.
pub(crate) fn fake_time_policy(
    max: Duration,
) -> (RetryPolicy, Arc<Mutex<Duration>>, Arc<Mutex<Vec<Duration>>>) {
    let base = Instant::now();
    let elapsed = Arc::new(Mutex::new(Duration::ZERO));
    let sleeps = Arc::new(Mutex::new(Vec::new()));

    let clock_elapsed = elapsed.clone();
    let sleep_elapsed = elapsed.clone();
    let sleep_log = sleeps.clone();
    let policy = RetryPolicy {
        max_retry_time: max,
        clock: Arc::new(move || base + *clock_elapsed.lock()),
        sleeper: Arc::new(move |delay| -> BoxFuture<'static, ()> {
            *sleep_elapsed.lock() += delay;
            sleep_log.lock().push(delay);
            Box::pin(async {})
        }),
    };
    (policy, elapsed, sleeps)
}
