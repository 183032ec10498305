//! Shutdown coordination for the gateway.

use tokio_util::sync::CancellationToken;

use crate::net::{DrainGuard, DrainTracker};

/// Coordinator for graceful shutdown.
///
/// Holds the root cancellation token every worker, session and accept loop
/// derives its signal from, plus the drain barrier shutdown waits on.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    drain: DrainTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root signal. Derive child tokens from it; never cancel it directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Register a task that shutdown has to wait for.
    pub fn track(&self) -> DrainGuard {
        self.drain.track()
    }

    /// Tasks still registered.
    pub fn active(&self) -> usize {
        self.drain.active_count()
    }

    /// Trip the signal. Idempotent.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!(active = self.active(), "Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once every tracked task has finished.
    pub async fn drained(&self) {
        self.drain.drained().await;
    }
}
