//! The query server: driver listener, worker pool, HTTP endpoint, shutdown.
//!
//! # Responsibilities
//! - Accept driver connections and hand each to a worker, round-robin
//! - Run handshake then dispatch loop for each connection on its worker
//! - Own the HTTP session cache and serve the HTTP endpoint
//! - Stop accepting, interrupt everything and wait for the drain on shutdown
//!
//! # Design Decisions
//! - A connection is counted by the drain barrier from the moment it is
//!   accepted, before it reaches a worker
//! - A connection accepted while shutdown is underway gets an already
//!   tripped signal and ends in the handshake

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialStore;
use crate::config::validation::validate_config;
use crate::config::{ConfigError, GatewayConfig, LimitsConfig};
use crate::http::{HttpServer, HttpState};
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionId, DrainGuard, Listener, ListenerError, WorkerPool};
use crate::observability::metrics;
use crate::protocol::{negotiate, HandshakeError, HandshakeLimits};
use crate::query::{ConnectionLoop, QueryHandler};
use crate::session::ConnectionCache;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Invalid HTTP bind address '{0}'")]
    InvalidHttpAddress(String),

    #[error("Failed to bind HTTP endpoint {addr}: {source}")]
    HttpBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a connection task needs, shared by all accept loops.
struct Acceptor<H: QueryHandler> {
    handler: Arc<H>,
    credentials: Arc<dyn CredentialStore>,
    workers: WorkerPool,
    limits: LimitsConfig,
    shutdown: Shutdown,
}

impl<H: QueryHandler> Acceptor<H> {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let stop = self.shutdown.token().clone();
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            self.dispatch(stream, peer);
        }
        tracing::debug!(address = ?listener.local_addr().ok(), "Accept loop stopped");
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let guard = self.shutdown.track();
        let worker = self.workers.next_worker();
        let interruptor = self.workers.task_signal(worker);

        // Re-registered on the worker's own reactor.
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer_addr = %peer, error = %e, "Failed to detach accepted socket");
                return;
            }
        };

        tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, worker, "Connection accepted");

        let this = self.clone();
        self.workers.spawn_on(worker, move || async move {
            this.serve(stream, peer, worker, interruptor, guard).await;
        });
    }

    async fn serve(
        &self,
        stream: std::net::TcpStream,
        peer: SocketAddr,
        worker: usize,
        interruptor: CancellationToken,
        guard: DrainGuard,
    ) {
        let id: ConnectionId = guard.id();
        let mut stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(connection_id = %id, peer_addr = %peer, error = %e, "Failed to register socket");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(connection_id = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        let limits = HandshakeLimits {
            max_auth_key_size: self.limits.max_auth_key_size,
        };
        let variant = match negotiate(&mut stream, self.credentials.as_ref(), limits, &interruptor).await {
            Ok(variant) => variant,
            Err(HandshakeError::Interrupted) => {
                metrics::record_handshake_failure(HandshakeError::Interrupted.kind());
                tracing::debug!(connection_id = %id, peer_addr = %peer, "Handshake interrupted by shutdown");
                return;
            }
            Err(e) => {
                metrics::record_handshake_failure(e.kind());
                tracing::warn!(
                    connection_id = %id,
                    peer_addr = %peer,
                    worker,
                    kind = e.kind(),
                    error = %e,
                    "Handshake failed"
                );
                return;
            }
        };

        tracing::info!(connection_id = %id, peer_addr = %peer, worker, protocol = %variant, "Client connected");

        let cache = self.handler.create_cache(peer);
        let conn = ConnectionLoop::new(id, stream, variant, self.handler.clone(), cache, &self.limits);
        match conn.run(interruptor).await {
            Ok(exit) => {
                tracing::info!(connection_id = %id, peer_addr = %peer, exit = ?exit, "Client disconnected")
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, peer_addr = %peer, error = %e, "Connection closed on error")
            }
        }
        drop(guard);
    }
}

/// A running gateway.
///
/// [`QueryServer::shutdown`] is the only place that waits for connections
/// and sessions to drain. Dropping the server trips the shutdown signal and
/// returns at once; tasks finish in the background.
pub struct QueryServer<H: QueryHandler> {
    port: u16,
    local_addrs: Vec<SocketAddr>,
    http_addr: Option<SocketAddr>,
    shutdown: Shutdown,
    sessions: ConnectionCache<H::Cache>,
    tasks: Vec<JoinHandle<()>>,
}

impl<H: QueryHandler> QueryServer<H> {
    /// Bind the listeners and start serving.
    pub async fn start(
        config: &GatewayConfig,
        handler: Arc<H>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ServerError> {
        validate_config(config).map_err(ConfigError::Validation)?;
        let shutdown = Shutdown::new();

        let listener = Listener::bind(&config.listener).await?;
        let port = listener.port();
        let local_addrs = listener.local_addrs();

        let sessions = ConnectionCache::spawn(&config.sessions, shutdown.token());

        let http = if config.http.enabled {
            let addr: SocketAddr = config
                .http
                .bind_address
                .parse()
                .map_err(|_| ServerError::InvalidHttpAddress(config.http.bind_address.clone()))?;
            let tcp = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::HttpBind { addr, source })?;
            let bound = tcp
                .local_addr()
                .map_err(|source| ServerError::HttpBind { addr, source })?;
            let state = HttpState {
                handler: handler.clone(),
                sessions: sessions.clone(),
                credentials: credentials.clone(),
                shutdown: shutdown.token().clone(),
            };
            Some((tcp, bound, HttpServer::new(state, &config.http)))
        } else {
            None
        };

        let acceptor = Arc::new(Acceptor {
            handler,
            credentials,
            workers: WorkerPool::new(config.listener.worker_count(), shutdown.token()),
            limits: config.limits.clone(),
            shutdown: shutdown.clone(),
        });

        let mut tasks: Vec<JoinHandle<()>> = listener
            .into_inner()
            .into_iter()
            .map(|tcp| tokio::spawn(acceptor.clone().accept_loop(tcp)))
            .collect();

        let http_addr = match http {
            Some((tcp, bound, server)) => {
                let stop = shutdown.token().clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = server.run(tcp, stop).await {
                        tracing::error!(error = %e, "HTTP server failed");
                    }
                }));
                Some(bound)
            }
            None => None,
        };

        tracing::info!(
            port,
            addresses = ?local_addrs,
            http = ?http_addr,
            workers = acceptor.workers.size(),
            "Query server started"
        );

        Ok(Self {
            port,
            local_addrs,
            http_addr,
            shutdown,
            sessions,
            tasks,
        })
    }

    /// Port the driver listener is bound on.
    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Port of the HTTP endpoint, if enabled.
    pub fn http_port(&self) -> Option<u16> {
        self.http_addr.map(|addr| addr.port())
    }

    pub fn sessions(&self) -> &ConnectionCache<H::Cache> {
        &self.sessions
    }

    /// Connection tasks (handshake or dispatch) still running.
    pub fn active_connections(&self) -> usize {
        self.shutdown.active()
    }

    /// Stop accepting, interrupt every connection and session, and wait
    /// until all connection tasks have finished.
    pub async fn shutdown(mut self) {
        self.shutdown.trigger();

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Server task panicked");
            }
        }

        self.sessions.closed().await;
        self.shutdown.drained().await;
        tracing::info!("Query server stopped");
    }
}

impl<H: QueryHandler> Drop for QueryServer<H> {
    fn drop(&mut self) {
        if !self.shutdown.is_triggered() && self.shutdown.active() > 0 {
            tracing::warn!(
                active = self.shutdown.active(),
                "Query server dropped without shutdown; connections are cancelled, not drained"
            );
        }
        self.shutdown.trigger();
    }
}
