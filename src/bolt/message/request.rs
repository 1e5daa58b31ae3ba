//! Request messages sent from the driver to the server.

use std::collections::HashMap;

use super::tag;
use crate::bolt::value::Value;

/// Authentication material carried inside HELLO.
#[derive(Debug, Clone)]
pub struct Auth {
    /// Authentication scheme ("basic", "bearer", "kerberos", "none", custom)
    pub scheme: String,
    /// Principal (user name)
    pub principal: Option<String>,
    /// Credentials (password or token)
    pub credentials: Option<String>,
    /// Realm
    pub realm: Option<String>,
    /// Scheme-specific extra parameters
    pub parameters: HashMap<String, Value>,
}

impl Auth {
    /// Basic user/password authentication.
    pub fn basic(principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            scheme: "basic".to_string(),
            principal: Some(principal.into()),
            credentials: Some(credentials.into()),
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// Bearer token authentication.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: "bearer".to_string(),
            principal: None,
            credentials: Some(token.into()),
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// Kerberos ticket authentication.
    pub fn kerberos(ticket: impl Into<String>) -> Self {
        Self {
            scheme: "kerberos".to_string(),
            principal: None,
            credentials: Some(ticket.into()),
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// No authentication.
    pub fn none() -> Self {
        Self {
            scheme: "none".to_string(),
            principal: None,
            credentials: None,
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// Fields as they appear inside the HELLO extra map.
    pub fn to_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("scheme".to_string(), Value::String(self.scheme.clone()));
        if let Some(ref p) = self.principal {
            map.insert("principal".to_string(), Value::String(p.clone()));
        }
        if let Some(ref c) = self.credentials {
            map.insert("credentials".to_string(), Value::String(c.clone()));
        }
        if let Some(ref r) = self.realm {
            map.insert("realm".to_string(), Value::String(r.clone()));
        }
        for (k, v) in &self.parameters {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

/// All request messages.
#[derive(Debug, Clone)]
pub enum BoltRequest {
    /// HELLO - open and authenticate
    Hello(HelloMessage),
    /// GOODBYE - graceful close
    Goodbye,
    /// RESET - recover to a clean state
    Reset,
    /// RUN - execute a query
    Run(RunMessage),
    /// PULL - request a batch of records
    Pull(PullMessage),
    /// DISCARD - throw away remaining records
    Discard(DiscardMessage),
    /// BEGIN - open an explicit transaction
    Begin(BeginMessage),
    /// COMMIT - commit the open transaction
    Commit,
    /// ROLLBACK - roll back the open transaction
    Rollback,
    /// ROUTE - fetch the routing table
    Route(RouteMessage),
}

impl BoltRequest {
    /// Structure tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            BoltRequest::Hello(_) => tag::HELLO,
            BoltRequest::Goodbye => tag::GOODBYE,
            BoltRequest::Reset => tag::RESET,
            BoltRequest::Run(_) => tag::RUN,
            BoltRequest::Pull(_) => tag::PULL,
            BoltRequest::Discard(_) => tag::DISCARD,
            BoltRequest::Begin(_) => tag::BEGIN,
            BoltRequest::Commit => tag::COMMIT,
            BoltRequest::Rollback => tag::ROLLBACK,
            BoltRequest::Route(_) => tag::ROUTE,
        }
    }

    /// Message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BoltRequest::Hello(_) => "HELLO",
            BoltRequest::Goodbye => "GOODBYE",
            BoltRequest::Reset => "RESET",
            BoltRequest::Run(_) => "RUN",
            BoltRequest::Pull(_) => "PULL",
            BoltRequest::Discard(_) => "DISCARD",
            BoltRequest::Begin(_) => "BEGIN",
            BoltRequest::Commit => "COMMIT",
            BoltRequest::Rollback => "ROLLBACK",
            BoltRequest::Route(_) => "ROUTE",
        }
    }
}

/// HELLO - opens and authenticates the connection.
#[derive(Debug, Clone)]
pub struct HelloMessage {
    /// User agent reported to the server
    pub user_agent: String,
    /// Authentication material
    pub auth: Auth,
    /// Routing context; `Some` (even empty) makes the driver announce
    /// itself as routing-aware on protocol 5.1+
    pub routing: Option<HashMap<String, String>>,
}

impl HelloMessage {
    /// Create a HELLO with the given agent and auth.
    pub fn new(user_agent: impl Into<String>, auth: Auth) -> Self {
        Self {
            user_agent: user_agent.into(),
            auth,
            routing: None,
        }
    }

    /// Attach a routing context.
    pub fn with_routing(mut self, routing: HashMap<String, String>) -> Self {
        self.routing = Some(routing);
        self
    }

    /// The single extra map HELLO carries on the wire.
    pub fn extra(&self) -> HashMap<String, Value> {
        let mut extra = self.auth.to_map();
        extra.insert(
            "user_agent".to_string(),
            Value::String(self.user_agent.clone()),
        );
        if let Some(ref routing) = self.routing {
            let ctx: HashMap<String, Value> = routing
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            extra.insert("routing".to_string(), Value::Map(ctx));
        }
        extra
    }
}

/// RUN - executes a query, inside or outside an explicit transaction.
#[derive(Debug, Clone)]
pub struct RunMessage {
    /// Query text
    pub query: String,
    /// Query parameters
    pub parameters: HashMap<String, Value>,
    /// Transaction metadata (mode, bookmarks, timeout, db, imp_user);
    /// empty inside an explicit transaction
    pub extra: HashMap<String, Value>,
}

impl RunMessage {
    /// Create a RUN message.
    pub fn new(
        query: impl Into<String>,
        parameters: HashMap<String, Value>,
        extra: HashMap<String, Value>,
    ) -> Self {
        Self {
            query: query.into(),
            parameters,
            extra,
        }
    }
}

/// PULL - requests up to `n` records from the attached stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullMessage {
    /// Batch size; -1 requests all remaining records
    pub n: i64,
    /// Query id; absent addresses the most recent query
    pub qid: Option<i64>,
}

impl PullMessage {
    /// Pull a batch of `n` records.
    pub fn new(n: i64) -> Self {
        Self { n, qid: None }
    }

    /// Pull everything that remains.
    pub fn all() -> Self {
        Self { n: -1, qid: None }
    }
}

/// DISCARD - throws away up to `n` remaining records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardMessage {
    /// Number of records to discard; -1 discards all remaining
    pub n: i64,
    /// Query id; absent addresses the most recent query
    pub qid: Option<i64>,
}

impl DiscardMessage {
    /// Discard everything that remains.
    pub fn all() -> Self {
        Self { n: -1, qid: None }
    }
}

/// BEGIN - opens an explicit transaction.
#[derive(Debug, Clone)]
pub struct BeginMessage {
    /// Transaction metadata (mode, bookmarks, timeout, db, imp_user)
    pub extra: HashMap<String, Value>,
}

impl BeginMessage {
    /// Create a BEGIN with the given metadata.
    pub fn new(extra: HashMap<String, Value>) -> Self {
        Self { extra }
    }
}

/// ROUTE - requests the routing table for a database.
#[derive(Debug, Clone)]
pub struct RouteMessage {
    /// Routing context from the driver configuration
    pub context: HashMap<String, String>,
    /// Bookmarks the table must be at least as fresh as
    pub bookmarks: Vec<String>,
    /// Database to route for; absent means the default database
    pub database: Option<String>,
    /// Impersonated user whose home database applies
    pub impersonated_user: Option<String>,
}
