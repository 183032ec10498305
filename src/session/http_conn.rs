//! State of one HTTP session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::net::ConnectionId;

/// One HTTP client session: its query cache, activity clock and interruptor.
///
/// Shared between the session index and any request currently using it.
/// Dropping the last `Arc` releases the query cache.
#[derive(Debug)]
pub struct HttpConn<C> {
    id: i32,
    connection: ConnectionId,
    peer: SocketAddr,
    interruptor: CancellationToken,
    last_accessed: Mutex<Instant>,
    next_seq: AtomicU64,
    cache: tokio::sync::Mutex<C>,
}

impl<C> HttpConn<C> {
    pub(crate) fn new(id: i32, peer: SocketAddr, cache: C, interruptor: CancellationToken) -> Self {
        Self {
            id,
            connection: ConnectionId::new(),
            peer,
            interruptor,
            last_accessed: Mutex::new(Instant::now()),
            next_seq: AtomicU64::new(0),
            cache: tokio::sync::Mutex::new(cache),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Identity used for tracing and query ids.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Trips when the session is closed or the cache shuts down.
    pub fn interruptor(&self) -> &CancellationToken {
        &self.interruptor
    }

    /// Arrival number for the next query on this session.
    pub fn next_query_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Record activity now.
    pub fn pulse(&self) {
        let mut last = self.last_accessed.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.last_accessed.lock().unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(*last)
    }

    pub fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.idle_for(now) >= idle_timeout
    }

    /// Exclusive use of the query cache. Calls on one session queue here.
    pub async fn lock_cache(&self) -> MutexGuard<'_, C> {
        self.cache.lock().await
    }
}
