//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the query gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Driver listener configuration (bind addresses, port, workers).
    pub listener: ListenerConfig,

    /// HTTP endpoint configuration.
    pub http: HttpConfig,

    /// Per-connection limits.
    pub limits: LimitsConfig,

    /// HTTP session cache settings.
    pub sessions: SessionConfig,

    /// Credential settings.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Driver listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Local addresses to bind (e.g., "127.0.0.1", "::1").
    pub bind_addresses: Vec<String>,

    /// TCP port shared by every bind address. 0 picks an ephemeral port.
    pub port: u16,

    /// Number of worker contexts connections are spread across.
    /// 0 means one per available CPU.
    pub workers: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: vec!["127.0.0.1".to_string()],
            port: 28015,
            workers: 0,
        }
    }
}

impl ListenerConfig {
    /// Resolve the worker count, falling back to available parallelism.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Serve the HTTP adapter.
    pub enabled: bool,

    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8080".to_string(),
            max_body_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Limits applied to every driver connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Admission bound for protocols that allow parallel queries.
    pub max_concurrent_queries: usize,

    /// Maximum size of one framed request in bytes.
    pub max_query_size: usize,

    /// Maximum length of the handshake auth key in bytes.
    pub max_auth_key_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 1024,
            max_query_size: 64 * 1024 * 1024,
            max_auth_key_size: 2048,
        }
    }
}

/// HTTP session cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are evicted.
    pub idle_timeout_secs: u64,

    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 5 * 60,
            sweep_interval_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Credential configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Key clients must present during the handshake. Empty disables the check.
    pub auth_key: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
