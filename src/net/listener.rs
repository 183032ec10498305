//! TCP listener bound to a set of local addresses.
//!
//! # Responsibilities
//! - Bind every configured address on one shared port
//! - Resolve port 0 to a single ephemeral port used by all addresses
//! - Hand the bound sockets to the server's accept loops

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Configured address is not an IP address.
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    /// No addresses configured.
    #[error("No bind addresses configured")]
    NoAddresses,

    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// The driver listener: one `TcpListener` per local address, all on the same port.
pub struct Listener {
    inner: Vec<TcpListener>,
    port: u16,
}

impl Listener {
    /// Bind to every configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let ips = config
            .bind_addresses
            .iter()
            .map(|a| a.parse::<IpAddr>().map_err(|_| ListenerError::InvalidAddress(a.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        if ips.is_empty() {
            return Err(ListenerError::NoAddresses);
        }

        let mut port = config.port;
        let mut inner = Vec::with_capacity(ips.len());
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ListenerError::Bind { addr, source })?;
            let local_addr = listener
                .local_addr()
                .map_err(|source| ListenerError::Bind { addr, source })?;

            // Port 0 resolves on the first bind; the rest reuse it.
            port = local_addr.port();

            tracing::info!(address = %local_addr, "Listener bound");
            inner.push(listener);
        }

        Ok(Self { inner, port })
    }

    /// The port every address is bound on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the local addresses this listener is bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    /// Take the bound sockets.
    pub fn into_inner(self) -> Vec<TcpListener> {
        self.inner
    }
}
