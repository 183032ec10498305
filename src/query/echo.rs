//! Built-in backend that answers every query with its own term.
//!
//! Used by the `query-gateway` binary when no real query engine is linked
//! in, and handy for smoke-testing drivers against the gateway.

use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Query, QueryType, Response, ResponseType};
use crate::query::handler::{QueryError, QueryHandler, QueryId};

/// Per-session state for [`EchoQueryHandler`].
#[derive(Debug)]
pub struct EchoCache {
    peer: SocketAddr,
    answered: AtomicU64,
}

impl EchoCache {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queries answered on this session so far.
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoQueryHandler;

impl QueryHandler for EchoQueryHandler {
    type Cache = EchoCache;

    fn create_cache(&self, peer: SocketAddr) -> EchoCache {
        EchoCache {
            peer,
            answered: AtomicU64::new(0),
        }
    }

    fn run_query(
        &self,
        id: QueryId,
        query: Query,
        cache: &EchoCache,
        interruptor: CancellationToken,
    ) -> impl Future<Output = Result<Response, QueryError>> + Send {
        let outcome = if interruptor.is_cancelled() {
            Err(QueryError::Interrupted)
        } else {
            cache.answered.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(query_id = %id, peer = %cache.peer, kind = ?query.kind, "Echoing query");
            Ok(match query.kind {
                QueryType::Start => Response::atom(query.token, query.term.unwrap_or(Value::Null)),
                QueryType::Continue | QueryType::Stop => Response::sequence(query.token, Vec::new()),
                QueryType::NoreplyWait => {
                    Response::new(query.token, ResponseType::WaitComplete, Vec::new())
                }
            })
        };
        std::future::ready(outcome)
    }
}
