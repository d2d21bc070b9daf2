//! Domain-driven configuration management for Hive
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    client::ClientConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    security::{SecurityConfig, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RATE_LIMIT_PER_SECOND},
    server::ServerConfig,
    transport::{TransportConfig, TransportKind},
    HiveConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration_ms, serde_duration_ms_option};
