//! Result streams.
//!
//! A stream is the per-query cursor the protocol engine hands out for a
//! RUN: an opaque handle backed by state the connection keeps in its
//! [`StreamBook`]. At most one stream per connection is *attached*, meaning
//! the next unsolicited records on the wire belong to it. Records already
//! buffered survive the connection dying; only live fetches need a healthy
//! connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::bolt::message::SuccessMessage;
use crate::bolt::Value;

use super::error::DriverError;

/// Opaque identity of a stream on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u64);

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    keys: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Record {
    /// Create a record over shared keys.
    pub(crate) fn new(keys: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { keys, values }
    }

    /// Field names, in result order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Field values, in result order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by field name.
    pub fn get_by_key(&self, key: &str) -> Option<&Value> {
        let index = self.keys.iter().position(|k| k == key)?;
        self.values.get(index)
    }

    /// Consume into the value vector.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Metadata from a stream's terminal SUCCESS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Causal consistency bookmark, when the server issued one
    pub bookmark: Option<String>,
    /// Query type ("r", "w", "rw", "s")
    pub query_type: Option<String>,
    /// Database the query ran against
    pub database: Option<String>,
    /// Milliseconds until the first record was available
    pub t_first: Option<i64>,
    /// Milliseconds until the last record was consumed
    pub t_last: Option<i64>,
}

impl Summary {
    /// Build a summary from terminal SUCCESS metadata.
    pub(crate) fn from_success(success: &SuccessMessage, t_first: Option<i64>) -> Self {
        Self {
            bookmark: success.bookmark().map(String::from),
            query_type: success.query_type().map(String::from),
            database: success.db().map(String::from),
            t_first,
            t_last: success.t_last(),
        }
    }
}

/// What a fetch from a stream produced.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// The next record
    Record(Record),
    /// The stream is complete; repeated fetches return the summary again
    Summary(Summary),
}

impl Fetched {
    /// The record, if this is one.
    pub fn record(self) -> Option<Record> {
        match self {
            Fetched::Record(r) => Some(r),
            Fetched::Summary(_) => None,
        }
    }

    /// The summary, if this is one.
    pub fn summary(self) -> Option<Summary> {
        match self {
            Fetched::Summary(s) => Some(s),
            Fetched::Record(_) => None,
        }
    }
}

/// Per-stream state kept by the connection.
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Server-assigned query id; -1 addresses the most recent query
    pub qid: i64,
    /// PULL batch size; -1 fetches everything
    pub fetch_size: i64,
    /// Result field names, shared with every record
    pub keys: Arc<Vec<String>>,
    /// `t_first` from the RUN reply
    pub t_first: Option<i64>,
    /// Records buffered ahead of the consumer
    pub buffer: VecDeque<Record>,
    /// Terminal summary, once observed
    pub summary: Option<Summary>,
    /// Sticky terminal error, surfaced after the buffer drains
    pub error: Option<DriverError>,
    /// Whether this stream is the connection's attached stream
    pub attached: bool,
}

impl StreamState {
    /// A stream is finished once it has a summary or a sticky error.
    pub fn is_finished(&self) -> bool {
        self.summary.is_some() || self.error.is_some()
    }
}

/// Registry of the open streams on one connection.
#[derive(Debug, Default)]
pub(crate) struct StreamBook {
    streams: HashMap<u64, StreamState>,
    attached: Option<u64>,
    next_id: u64,
}

impl StreamBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new stream and attach it. At most one stream may be attached;
    /// the engine guarantees the previous one finished first.
    pub fn open(
        &mut self,
        keys: Arc<Vec<String>>,
        qid: i64,
        fetch_size: i64,
        t_first: Option<i64>,
    ) -> StreamHandle {
        debug_assert!(self.attached.is_none());
        self.next_id += 1;
        let id = self.next_id;
        self.streams.insert(
            id,
            StreamState {
                qid,
                fetch_size,
                keys,
                t_first,
                buffer: VecDeque::new(),
                summary: None,
                error: None,
                attached: true,
            },
        );
        self.attached = Some(id);
        StreamHandle(id)
    }

    pub fn get(&self, handle: StreamHandle) -> Option<&StreamState> {
        self.streams.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: StreamHandle) -> Option<&mut StreamState> {
        self.streams.get_mut(&handle.0)
    }

    /// Handle of the attached stream, if any.
    pub fn attached(&self) -> Option<StreamHandle> {
        self.attached.map(StreamHandle)
    }

    /// Detach the attached stream (it stays readable from its buffer).
    pub fn detach(&mut self) {
        if let Some(id) = self.attached.take() {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.attached = false;
            }
        }
    }

    /// Detach and poison every unfinished stream, e.g. after RESET.
    pub fn abandon(&mut self, error: DriverError) {
        self.attached = None;
        for stream in self.streams.values_mut() {
            stream.attached = false;
            if !stream.is_finished() {
                stream.error = Some(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Arc<Vec<String>> {
        Arc::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_record_access() {
        let record = Record::new(
            keys(&["name", "age"]),
            vec![Value::from("Alice"), Value::from(30i64)],
        );

        assert_eq!(record.get(0).and_then(Value::as_str), Some("Alice"));
        assert_eq!(record.get_by_key("age").and_then(Value::as_int), Some(30));
        assert!(record.get_by_key("missing").is_none());
        assert!(record.get(5).is_none());
        assert_eq!(record.keys(), &["name".to_string(), "age".to_string()]);
    }

    #[test]
    fn test_stream_book_open_detach() {
        let mut book = StreamBook::new();
        let handle = book.open(keys(&["n"]), 7, 10, Some(1));

        assert_eq!(book.attached(), Some(handle));
        assert!(book.get(handle).unwrap().attached);
        assert_eq!(book.get(handle).unwrap().qid, 7);

        book.detach();
        assert!(book.attached().is_none());
        assert!(!book.get(handle).unwrap().attached);
    }

    #[test]
    fn test_stream_book_abandon_poisons_unfinished() {
        let mut book = StreamBook::new();
        let unfinished = book.open(keys(&["n"]), -1, -1, None);

        book.abandon(DriverError::usage("stream discarded by connection reset"));
        let stream = book.get(unfinished).unwrap();
        assert!(!stream.attached);
        assert!(stream.error.is_some());
    }

    #[test]
    fn test_stream_book_abandon_keeps_finished() {
        let mut book = StreamBook::new();
        let done = book.open(keys(&["n"]), -1, -1, None);
        book.get_mut(done).unwrap().summary = Some(Summary::default());
        book.detach();

        book.abandon(DriverError::usage("reset"));
        assert!(book.get(done).unwrap().error.is_none());
    }

    #[test]
    fn test_finished() {
        let mut book = StreamBook::new();
        let handle = book.open(keys(&["n"]), -1, -1, None);
        assert!(!book.get(handle).unwrap().is_finished());

        book.get_mut(handle).unwrap().summary = Some(Summary::default());
        assert!(book.get(handle).unwrap().is_finished());
    }
}
