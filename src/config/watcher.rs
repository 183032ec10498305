//! Config file watcher. A reloaded file feeds the auth key of a live
//! [`SharedCredentials`]; every other setting is fixed at startup.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::{AuthKey, SharedCredentials};
use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Reloads the config file when it changes and sends each valid result.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for reloaded configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive for updates to keep flowing.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if let Some(config) = reload(&path) {
                        let _ = tx.send(config);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Load and validate `path`, keeping the current settings on failure.
fn reload(path: &Path) -> Option<GatewayConfig> {
    tracing::info!(path = ?path, "Config file changed, reloading");
    match load_config(path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload config, keeping current auth key");
            None
        }
    }
}

/// Apply the auth key of every reloaded config until the watcher goes away.
pub async fn forward_credentials(
    mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
    credentials: SharedCredentials,
) {
    while let Some(config) = updates.recv().await {
        credentials.update(AuthKey::new(config.auth.auth_key));
    }
    tracing::debug!("Credential updates stopped");
}

/// Watch `path` and keep `credentials` in step with its `auth.auth_key`.
pub fn watch_credentials(
    path: &Path,
    credentials: SharedCredentials,
) -> Result<RecommendedWatcher, notify::Error> {
    let (watcher, updates) = ConfigWatcher::new(path);
    let watcher = watcher.run()?;
    tokio::spawn(forward_credentials(updates, credentials));
    Ok(watcher)
}
