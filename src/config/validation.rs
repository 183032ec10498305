//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_addresses must not be empty")]
    NoBindAddresses,

    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("invalid socket address for {field}: '{value}'")]
    InvalidSocketAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("sessions.sweep_interval_secs ({sweep}) exceeds idle_timeout_secs ({idle})")]
    SweepLongerThanIdle { sweep: u64, idle: u64 },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_addresses.is_empty() {
        errors.push(ValidationError::NoBindAddresses);
    }
    for addr in &config.listener.bind_addresses {
        if addr.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress(addr.clone()));
        }
    }

    if config.http.enabled && config.http.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidSocketAddress {
            field: "http.bind_address",
            value: config.http.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidSocketAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if config.limits.max_concurrent_queries == 0 {
        errors.push(ValidationError::Zero("limits.max_concurrent_queries"));
    }
    if config.limits.max_query_size == 0 {
        errors.push(ValidationError::Zero("limits.max_query_size"));
    }
    if config.sessions.idle_timeout_secs == 0 {
        errors.push(ValidationError::Zero("sessions.idle_timeout_secs"));
    }
    if config.sessions.sweep_interval_secs == 0 {
        errors.push(ValidationError::Zero("sessions.sweep_interval_secs"));
    } else if config.sessions.sweep_interval_secs > config.sessions.idle_timeout_secs {
        errors.push(ValidationError::SweepLongerThanIdle {
            sweep: config.sessions.sweep_interval_secs,
            idle: config.sessions.idle_timeout_secs,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.bind_addresses = vec!["not-an-ip".into()];
        config.limits.max_concurrent_queries = 0;
        config.http.bind_address = "nowhere".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::InvalidBindAddress("not-an-ip".into())));
        assert!(errors.contains(&ValidationError::Zero("limits.max_concurrent_queries")));
    }

    #[test]
    fn test_sweep_must_fit_in_idle_timeout() {
        let mut config = GatewayConfig::default();
        config.sessions.idle_timeout_secs = 2;
        config.sessions.sweep_interval_secs = 10;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::SweepLongerThanIdle { sweep: 10, idle: 2 }]
        );
    }
}
