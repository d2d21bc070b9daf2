//! Configuration loading and environment variable handling

use crate::domains::HiveConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "HIVE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<HiveConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml_str(&content)
    }

    /// Parse a YAML document, apply environment overrides and validate
    pub fn from_yaml_str(&self, content: &str) -> ConfigResult<HiveConfig> {
        // An empty document deserializes to unit, not to a mapping
        let mut config: HiveConfig = if content.trim().is_empty() {
            HiveConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<HiveConfig> {
        let mut config = HiveConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<HiveConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut HiveConfig) -> ConfigResult<()> {
        self.apply_transport_overrides(&mut config.transport)?;
        self.apply_security_overrides(&mut config.security)?;
        self.apply_client_overrides(&mut config.client)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply transport config overrides
    fn apply_transport_overrides(
        &self,
        config: &mut crate::domains::transport::TransportConfig,
    ) -> ConfigResult<()> {
        if let Ok(kind) = self.get_env_var("TRANSPORT") {
            config.kind = crate::domains::transport::TransportKind::from_str(&kind)
                .map_err(|_| ConfigError::EnvError(format!("Invalid TRANSPORT: {}", kind)))?;
        }

        if let Ok(path) = self.get_env_var("SOCKET_PATH") {
            config.path = Some(path);
        }

        if let Ok(address) = self.get_env_var("HTTP_ADDRESS") {
            config.http_address = address;
        }

        Ok(())
    }

    /// Apply security config overrides
    fn apply_security_overrides(
        &self,
        config: &mut crate::domains::security::SecurityConfig,
    ) -> ConfigResult<()> {
        if let Ok(enabled) = self.get_env_var("ENABLE_AUTH") {
            config.enable_authentication = enabled
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid ENABLE_AUTH: {}", e)))?;
        }

        if let Ok(token) = self.get_env_var("AUTH_TOKEN") {
            config.auth_token = Some(token);
        }

        if let Ok(processes) = self.get_env_var("ALLOWED_PROCESSES") {
            config.allowed_processes = processes
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(size) = self.get_env_var("MAX_MESSAGE_SIZE") {
            config.max_message_size = size
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid MAX_MESSAGE_SIZE: {}", e)))?;
        }

        if let Ok(rate) = self.get_env_var("RATE_LIMIT") {
            let rate: u32 = rate
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid RATE_LIMIT: {}", e)))?;
            // Zero switches rate limiting off
            config.rate_limit_per_second = (rate > 0).then_some(rate);
        }

        Ok(())
    }

    /// Apply client config overrides
    fn apply_client_overrides(
        &self,
        config: &mut crate::domains::client::ClientConfig,
    ) -> ConfigResult<()> {
        if let Ok(attempts) = self.get_env_var("RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = attempts
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid RECONNECT_ATTEMPTS: {}", e)))?;
        }

        if let Ok(delay) = self.get_env_var("RECONNECT_DELAY_MS") {
            config.reconnect_delay = self.parse_millis("RECONNECT_DELAY_MS", &delay)?;
        }

        if let Ok(interval) = self.get_env_var("HEARTBEAT_INTERVAL_MS") {
            let interval = self.parse_millis("HEARTBEAT_INTERVAL_MS", &interval)?;
            config.heartbeat_interval = (!interval.is_zero()).then_some(interval);
        }

        if let Ok(timeout) = self.get_env_var("REQUEST_TIMEOUT_MS") {
            config.request_timeout = self.parse_millis("REQUEST_TIMEOUT_MS", &timeout)?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn parse_millis(&self, name: &str, value: &str) -> ConfigResult<Duration> {
        let millis: u64 = value
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
        Ok(Duration::from_millis(millis))
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
