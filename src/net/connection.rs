//! Connection identity and drain tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count in-flight handshake and dispatch tasks
//! - Let shutdown wait until that count reaches zero

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::observability::metrics;

/// Source of connection IDs. Only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Drain barrier for in-flight connection tasks.
///
/// The count lives in a watch channel so waiters are woken on every change
/// instead of polling.
#[derive(Debug, Clone)]
pub struct DrainTracker {
    active: Arc<watch::Sender<usize>>,
}

impl DrainTracker {
    /// Create a tracker with zero outstanding tasks.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new task. Returns a guard that decrements on drop.
    pub fn track(&self) -> DrainGuard {
        self.active.send_modify(|n| *n += 1);
        metrics::record_task_started();
        DrainGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::new(),
        }
    }

    /// Get current outstanding task count.
    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every guard has been dropped.
    pub async fn drained(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks one task's lifetime.
/// Decrements the outstanding count when dropped.
#[derive(Debug)]
pub struct DrainGuard {
    active: Arc<watch::Sender<usize>>,
    id: ConnectionId,
}

impl DrainGuard {
    /// Get the ID assigned to this task's connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        metrics::record_task_finished();
        tracing::trace!(connection_id = %self.id, "Task drained");
    }
}
