//! Response messages received from the server.

use std::collections::HashMap;
use std::time::Duration;

use crate::bolt::value::Value;

/// All response messages.
#[derive(Debug, Clone)]
pub enum BoltResponse {
    /// SUCCESS - request completed, with metadata
    Success(SuccessMessage),
    /// RECORD - one result row
    Record(RecordMessage),
    /// FAILURE - request failed, with code and message
    Failure(FailureMessage),
    /// IGNORED - request skipped because the connection is in a failed state
    Ignored,
}

impl BoltResponse {
    /// Message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BoltResponse::Success(_) => "SUCCESS",
            BoltResponse::Record(_) => "RECORD",
            BoltResponse::Failure(_) => "FAILURE",
            BoltResponse::Ignored => "IGNORED",
        }
    }
}

/// RECORD - the field values of one result row.
#[derive(Debug, Clone)]
pub struct RecordMessage {
    /// Field values, ordered as the stream's keys
    pub values: Vec<Value>,
}

/// SUCCESS metadata with typed accessors.
///
/// Unknown keys are tolerated and ignored; known keys with unexpected
/// shapes read as absent.
#[derive(Debug, Clone, Default)]
pub struct SuccessMessage {
    /// Raw metadata map
    pub metadata: HashMap<String, Value>,
}

impl SuccessMessage {
    /// Wrap a metadata map.
    pub fn new(metadata: HashMap<String, Value>) -> Self {
        Self { metadata }
    }

    /// `server` - server agent string.
    pub fn server(&self) -> Option<&str> {
        self.metadata.get("server").and_then(Value::as_str)
    }

    /// `connection_id` - server-assigned connection identifier.
    pub fn connection_id(&self) -> Option<&str> {
        self.metadata.get("connection_id").and_then(Value::as_str)
    }

    /// `fields` - ordered result field names from a RUN reply.
    pub fn fields(&self) -> Option<Vec<String>> {
        let list = self.metadata.get("fields")?.as_list()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        )
    }

    /// `t_first` - milliseconds until the first record is available.
    pub fn t_first(&self) -> Option<i64> {
        self.metadata.get("t_first").and_then(Value::as_int)
    }

    /// `t_last` - milliseconds until the last record was consumed.
    pub fn t_last(&self) -> Option<i64> {
        self.metadata.get("t_last").and_then(Value::as_int)
    }

    /// `qid` - server-assigned query id.
    pub fn qid(&self) -> Option<i64> {
        self.metadata.get("qid").and_then(Value::as_int)
    }

    /// `has_more` - whether the stream has more batches to pull.
    pub fn has_more(&self) -> bool {
        self.metadata
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `bookmark` - causal consistency bookmark.
    pub fn bookmark(&self) -> Option<&str> {
        self.metadata.get("bookmark").and_then(Value::as_str)
    }

    /// `type` - query type of a completed auto-commit stream.
    pub fn query_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(Value::as_str)
    }

    /// `db` - database the query executed against.
    pub fn db(&self) -> Option<&str> {
        self.metadata.get("db").and_then(Value::as_str)
    }

    /// The `connection.recv_timeout_seconds` hint from HELLO metadata.
    ///
    /// Only positive integers count; any other shape reads as absent and
    /// leaves the idle read timeout disabled.
    pub fn recv_timeout(&self) -> Option<Duration> {
        let hints = self.metadata.get("hints")?.as_map()?;
        let seconds = hints.get("connection.recv_timeout_seconds")?.as_int()?;
        if seconds > 0 {
            Some(Duration::from_secs(seconds as u64))
        } else {
            None
        }
    }

    /// `rt` - the routing table from a ROUTE reply.
    pub fn routing_table(&self) -> Option<RoutingTable> {
        let rt = self.metadata.get("rt")?.as_map()?;

        let ttl = rt.get("ttl").and_then(Value::as_int).unwrap_or(300) as u64;
        let database = rt.get("db").and_then(Value::as_str).map(String::from);

        let mut routers = Vec::new();
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for server in rt.get("servers")?.as_list()? {
            let Some(entry) = server.as_map() else {
                continue;
            };
            let addresses: Vec<String> = entry
                .get("addresses")
                .and_then(Value::as_list)
                .map(|list| {
                    list.iter()
                        .filter_map(|a| a.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            match entry.get("role").and_then(Value::as_str).unwrap_or("") {
                "ROUTE" => routers.extend(addresses),
                "READ" => readers.extend(addresses),
                "WRITE" => writers.extend(addresses),
                _ => {}
            }
        }

        Some(RoutingTable {
            ttl,
            database,
            routers,
            readers,
            writers,
        })
    }
}

/// Routing table parsed from a ROUTE reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// Seconds the table stays valid
    pub ttl: u64,
    /// Database the table routes for
    pub database: Option<String>,
    /// Routing servers
    pub routers: Vec<String>,
    /// Read servers
    pub readers: Vec<String>,
    /// Write servers
    pub writers: Vec<String>,
}

/// FAILURE - a server-reported error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMessage {
    /// Error code, "Neo.{Classification}.{Category}.{Title}"
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl FailureMessage {
    /// Create a failure.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The credentials were rejected outright.
    pub fn is_authentication_failed(&self) -> bool {
        self.code == "Neo.ClientError.Security.Unauthorized"
            || self.code == "Neo.ClientError.Security.AuthenticationRateLimit"
    }

    /// The authorization backing this connection expired; the connection
    /// must not serve further work.
    pub fn is_authorization_expired(&self) -> bool {
        self.code == "Status.Security.AuthorizationExpired"
    }

    /// The SSO token expired; re-authentication at a higher layer may help.
    pub fn is_token_expired(&self) -> bool {
        self.code == "Neo.ClientError.Security.TokenExpired"
    }

    /// Transient server condition, safe to retry.
    pub fn is_transient(&self) -> bool {
        self.code.starts_with("Neo.TransientError")
    }

    /// Caller-side error class.
    pub fn is_client_error(&self) -> bool {
        self.code.starts_with("Neo.ClientError")
    }

    /// Server-side error class.
    pub fn is_database_error(&self) -> bool {
        self.code.starts_with("Neo.DatabaseError")
    }

    /// Any security-classified error.
    pub fn is_security_error(&self) -> bool {
        self.code.contains(".Security.")
    }
}

impl std::fmt::Display for FailureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
