//! IPC server configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How long an unauthenticated peer may take to complete its handshake
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Capacity of the server event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Install the `ping`, `server-info` and `list-connections` handlers
    #[serde(default = "crate::domains::utils::default_true")]
    pub builtin_handlers: bool,
}

pub(crate) fn default_handshake_timeout() -> Duration {
    Duration::from_millis(5_000)
}

pub(crate) fn default_event_buffer() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            event_buffer: default_event_buffer(),
            builtin_handlers: true,
        }
    }
}

impl Validatable for ServerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.handshake_timeout.as_millis(),
            "handshake_timeout",
            self.domain_name(),
        )?;
        validate_positive(self.event_buffer, "event_buffer", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "server"
    }
}
