//! `query-gateway` binary.
//!
//! Runs the gateway with the built-in echo backend until SIGINT or SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use query_gateway::auth::{AuthKey, SharedCredentials};
use query_gateway::config::watcher::watch_credentials;
use query_gateway::config::{load_config, GatewayConfig};
use query_gateway::lifecycle::shutdown_signal;
use query_gateway::observability::{logging, metrics};
use query_gateway::{EchoQueryHandler, QueryServer};

#[derive(Parser)]
#[command(name = "query-gateway")]
#[command(about = "Client-driver front end for a query server", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Driver port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Required authorization key (overrides the config file)
    #[arg(long)]
    auth_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if let Some(key) = &cli.auth_key {
        config.auth.auth_key = key.clone();
    }

    logging::init(&config.observability);
    tracing::info!("query-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let credentials = SharedCredentials::new(AuthKey::new(config.auth.auth_key.clone()));

    // Reload the auth key when the config file changes. A key given on the
    // command line stays fixed.
    let _watcher = match (&cli.config, &cli.auth_key) {
        (Some(path), None) => Some(watch_credentials(path, credentials.clone())?),
        _ => None,
    };

    let server = QueryServer::start(&config, Arc::new(EchoQueryHandler), Arc::new(credentials)).await?;
    tracing::info!(
        port = server.get_port(),
        http_port = ?server.http_port(),
        "Ready for connections"
    );

    shutdown_signal().await;
    server.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
