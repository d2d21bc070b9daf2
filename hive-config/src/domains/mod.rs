//! Domain-specific configuration modules

pub mod client;
pub mod logging;
pub mod security;
pub mod server;
pub mod transport;
pub mod utils;

use crate::error::ConfigResult;
use serde::{Deserialize, Serialize};

/// Main Hive configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    /// Transport selection and addressing
    #[serde(default)]
    pub transport: transport::TransportConfig,

    /// Authentication, allow-list, size and rate limits
    #[serde(default)]
    pub security: security::SecurityConfig,

    /// Server behaviour
    #[serde(default)]
    pub server: server::ServerConfig,

    /// Client reconnection, heartbeat and request timeouts
    #[serde(default)]
    pub client: client::ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl HiveConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        crate::validation::validate_config(self)
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = HiveConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
