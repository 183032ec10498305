//! Fixed pool of worker contexts for driver connections.
//!
//! # Responsibilities
//! - Run each connection on one worker thread for its whole lifetime
//! - Pick workers round-robin
//! - Forward the process-wide shutdown signal to every worker
//!
//! # Design Decisions
//! - Each worker is a single-threaded runtime (`LocalPoolHandle`), so a
//!   connection's tasks never migrate between threads
//! - Sockets are moved as `std::net::TcpStream` and re-registered on the
//!   worker's reactor
//! - A worker's signal is a child of the root token; anything derived after
//!   shutdown starts is born cancelled

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::LocalPoolHandle;

/// Pool of sticky worker contexts.
pub struct WorkerPool {
    pool: LocalPoolHandle,
    signals: Vec<CancellationToken>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Start `size` workers whose signals derive from `shutdown`.
    pub fn new(size: usize, shutdown: &CancellationToken) -> Self {
        let size = size.max(1);
        let signals = (0..size).map(|_| shutdown.child_token()).collect();
        tracing::info!(workers = size, "Worker pool started");
        Self {
            pool: LocalPoolHandle::new(size),
            signals,
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.signals.len()
    }

    /// Pick the next worker, round-robin.
    pub fn next_worker(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.signals.len()
    }

    /// Derive a cancellation signal for a task running on `worker`.
    ///
    /// The signal trips when the task's own token is cancelled or when
    /// shutdown reaches the worker.
    pub fn task_signal(&self, worker: usize) -> CancellationToken {
        self.signals[worker % self.signals.len()].child_token()
    }

    /// Run a task on the given worker. The future stays on that worker's thread.
    pub fn spawn_on<F, Fut>(&self, worker: usize, create: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        self.pool
            .spawn_pinned_by_idx(create, worker % self.signals.len())
    }
}
