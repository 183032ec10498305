//! Query-execution collaborator interface.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::net::ConnectionId;
use crate::protocol::{Query, Response, ResponseType};

/// Identifies one query: the session it arrived on and its arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId {
    pub connection: ConnectionId,
    pub seq: u64,
}

impl QueryId {
    pub fn new(connection: ConnectionId, seq: u64) -> Self {
        Self { connection, seq }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/q{}", self.connection, self.seq)
    }
}

/// Failure reported by the query backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The interruptor fired before the query finished.
    #[error("query interrupted")]
    Interrupted,

    /// The query failed. `close_connection` asks the gateway to hang up after replying.
    #[error("{message}")]
    Failed {
        message: String,
        close_connection: bool,
    },
}

impl QueryError {
    pub fn failed(message: impl Into<String>) -> Self {
        QueryError::Failed {
            message: message.into(),
            close_connection: false,
        }
    }

    /// Response owed to the client for this failure.
    pub fn into_response(self, token: i64) -> Response {
        match self {
            QueryError::Interrupted => Response::shutting_down(token),
            QueryError::Failed { message, .. } => {
                Response::error(token, ResponseType::RuntimeError, message)
            }
        }
    }
}

/// The query-execution backend the gateway dispatches to.
///
/// `Cache` is the per-session state the backend keeps between queries
/// (open cursors, prepared terms). The gateway creates one per driver
/// connection or HTTP session, never hands it to another session, and drops
/// it when the session ends.
pub trait QueryHandler: Send + Sync + 'static {
    type Cache: Send + Sync + 'static;

    /// Build the per-session cache for a new client.
    fn create_cache(&self, peer: SocketAddr) -> Self::Cache;

    /// Execute one query. Should return promptly once `interruptor` fires.
    fn run_query(
        &self,
        id: QueryId,
        query: Query,
        cache: &Self::Cache,
        interruptor: CancellationToken,
    ) -> impl Future<Output = Result<Response, QueryError>> + Send;

    /// Response for a request whose payload did not parse.
    fn unparseable_query(&self, token: i64, info: &str) -> Response {
        Response::error(token, ResponseType::ClientError, info)
    }
}
