//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};
use std::net::SocketAddr;

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a `host:port` socket address
pub fn validate_socket_address(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    validate_required_string(value, field_name, domain)?;

    let address: SocketAddr = value.parse().map_err(|e| ConfigError::DomainError {
        domain: domain.to_string(),
        message: format!("{} has invalid address format '{}': {}", field_name, value, e),
    })?;

    if address.port() == 0 {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} port cannot be 0", field_name),
        });
    }

    Ok(())
}

/// Validate a complete configuration object
pub fn validate_config(config: &crate::domains::HiveConfig) -> ConfigResult<()> {
    config.transport.validate()?;
    config.security.validate()?;
    config.server.validate()?;
    config.client.validate()?;
    config.logging.validate()?;
    Ok(())
}
