//! Index of live HTTP sessions with idle eviction.
//!
//! # Responsibilities
//! - Hand out session ids and keep the id → session map
//! - Evict sessions idle longer than the configured timeout
//! - Interrupt every session when the cache shuts down
//!
//! # Design Decisions
//! - The map is owned by a single task; handles send it commands over a
//!   channel and await the reply, so no lock guards the index
//! - Eviction only unlinks a session. Requests holding it keep working and
//!   the query cache is released when the last holder lets go

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::observability::metrics;
use crate::session::http_conn::HttpConn;

const COMMAND_BUFFER: usize = 256;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("session cache is shut down")]
    ShutDown,

    #[error("no free session id")]
    Exhausted,
}

enum Command<C> {
    Find {
        id: i32,
        reply: oneshot::Sender<Option<Arc<HttpConn<C>>>>,
    },
    Create {
        peer: SocketAddr,
        cache: C,
        reply: oneshot::Sender<Result<Arc<HttpConn<C>>, CacheError>>,
    },
    Erase {
        id: i32,
        reply: oneshot::Sender<bool>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// The id → session map. Only the cache task touches it.
struct SessionIndex<C> {
    sessions: HashMap<i32, Arc<HttpConn<C>>>,
    next_id: i32,
    max_id: i32,
    shutdown: CancellationToken,
}

impl<C> SessionIndex<C> {
    fn new(max_id: i32, shutdown: CancellationToken) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 0,
            max_id: max_id.max(0),
            shutdown,
        }
    }

    /// Next id from the wrapping counter that no live session holds.
    fn allocate_id(&mut self) -> Option<i32> {
        let space = self.max_id as u64 + 1;
        if self.sessions.len() as u64 >= space {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = if id >= self.max_id { 0 } else { id + 1 };
            if !self.sessions.contains_key(&id) {
                return Some(id);
            }
        }
    }

    fn create(&mut self, peer: SocketAddr, cache: C) -> Result<Arc<HttpConn<C>>, CacheError> {
        let id = self.allocate_id().ok_or(CacheError::Exhausted)?;
        let conn = Arc::new(HttpConn::new(id, peer, cache, self.shutdown.child_token()));
        self.sessions.insert(id, conn.clone());
        metrics::record_http_sessions(self.sessions.len());
        tracing::debug!(session_id = id, peer_addr = %peer, "HTTP session created");
        Ok(conn)
    }

    fn erase(&mut self, id: i32) -> bool {
        match self.sessions.remove(&id) {
            Some(conn) => {
                conn.interruptor().cancel();
                metrics::record_http_sessions(self.sessions.len());
                tracing::debug!(session_id = id, "HTTP session closed");
                true
            }
            None => false,
        }
    }

    fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, conn| !conn.is_expired(now, idle_timeout));
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            metrics::record_sessions_evicted(evicted);
            metrics::record_http_sessions(self.sessions.len());
            tracing::debug!(evicted, remaining = self.sessions.len(), "Evicted idle HTTP sessions");
        }
        evicted
    }

    fn apply(&mut self, command: Command<C>) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match command {
            Command::Find { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).cloned());
            }
            Command::Create { peer, cache, reply } => {
                let _ = reply.send(self.create(peer, cache));
            }
            Command::Erase { id, reply } => {
                let _ = reply.send(self.erase(id));
            }
            Command::Len { reply } => {
                let _ = reply.send(self.sessions.len());
            }
        }
    }

    fn close_all(&mut self) {
        for (_, conn) in self.sessions.drain() {
            conn.interruptor().cancel();
        }
        metrics::record_http_sessions(0);
    }
}

/// Handle to the session cache task.
pub struct ConnectionCache<C> {
    commands: mpsc::Sender<Command<C>>,
    shutdown: CancellationToken,
    /// Tripped once the task has dropped every session.
    stopped: CancellationToken,
}

impl<C> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ConnectionCache<C> {
    /// Start the cache task. It stops when `shutdown` (or [`Self::shutdown`]) fires.
    pub fn spawn(config: &SessionConfig, shutdown: &CancellationToken) -> Self {
        Self::spawn_with_id_limit(config, shutdown, i32::MAX)
    }

    /// Like [`Self::spawn`], handing out ids in `0..=max_id` only.
    pub fn spawn_with_id_limit(config: &SessionConfig, shutdown: &CancellationToken, max_id: i32) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let token = shutdown.child_token();
        let index = SessionIndex::new(max_id, token.clone());
        let sweep_interval = config.sweep_interval().max(MIN_SWEEP_INTERVAL);
        let stopped = CancellationToken::new();
        tokio::spawn(run(
            index,
            rx,
            token.clone(),
            stopped.clone(),
            sweep_interval,
            config.idle_timeout(),
        ));
        Self {
            commands: tx,
            shutdown: token,
            stopped,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<C>) -> Option<T> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn find(&self, id: i32) -> Option<Arc<HttpConn<C>>> {
        self.request(|reply| Command::Find { id, reply }).await.flatten()
    }

    /// Register a new session holding `cache`.
    pub async fn create(&self, peer: SocketAddr, cache: C) -> Result<Arc<HttpConn<C>>, CacheError> {
        self.request(|reply| Command::Create { peer, cache, reply })
            .await
            .unwrap_or(Err(CacheError::ShutDown))
    }

    /// Remove a session and trip its interruptor. Returns false if it was not open.
    pub async fn erase(&self, id: i32) -> bool {
        self.request(|reply| Command::Erase { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.request(|reply| Command::Len { reply }).await.unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Drop every session and interrupt their in-flight queries.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the cache task has exited and released its sessions.
    pub async fn closed(&self) {
        self.stopped.cancelled().await
    }
}

async fn run<C>(
    mut index: SessionIndex<C>,
    mut commands: mpsc::Receiver<Command<C>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    sweep_interval: Duration,
    idle_timeout: Duration,
) {
    let _stopped = stopped.drop_guard();
    tracing::debug!(
        sweep_interval_secs = sweep_interval.as_secs(),
        idle_timeout_secs = idle_timeout.as_secs(),
        "Session cache started"
    );

    let mut ticker = time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                index.sweep(Instant::now(), idle_timeout);
            }

            command = commands.recv() => match command {
                Some(command) => index.apply(command),
                None => break,
            },
        }
    }

    index.close_all();
    tracing::debug!("Session cache stopped");
}
