//! IPC client configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum consecutive reconnection attempts; 0 disables reconnection
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Base reconnection delay, doubled on every failed attempt
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Ceiling for the reconnection delay
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: Duration,

    /// Spread each reconnection delay by ±20%
    #[serde(default)]
    pub reconnect_jitter: bool,

    /// Interval between heartbeats while connected; `None` disables heartbeats
    #[serde(with = "crate::domains::utils::serde_duration_ms_option", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Option<Duration>,

    /// Default timeout for correlated requests
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Timeout for the handshake acknowledgement during connect
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "crate::domains::server::default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Process name announced in the handshake; defaults to the executable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,

    /// Capabilities announced in the handshake
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Logical source address stamped on outgoing envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Capacity of the client event channel
    #[serde(default = "crate::domains::server::default_event_buffer")]
    pub event_buffer: usize,
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(1_000)
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_millis(30_000)
}

fn default_heartbeat_interval() -> Option<Duration> {
    Some(Duration::from_millis(30_000))
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(30_000)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_delay: default_max_reconnect_delay(),
            reconnect_jitter: false,
            heartbeat_interval: default_heartbeat_interval(),
            request_timeout: default_request_timeout(),
            handshake_timeout: crate::domains::server::default_handshake_timeout(),
            process_name: None,
            capabilities: Vec::new(),
            source: None,
            event_buffer: crate::domains::server::default_event_buffer(),
        }
    }
}

impl Validatable for ClientConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();

        validate_positive(self.reconnect_delay.as_millis(), "reconnect_delay", domain)?;
        validate_positive(self.request_timeout.as_millis(), "request_timeout", domain)?;
        validate_positive(self.handshake_timeout.as_millis(), "handshake_timeout", domain)?;
        validate_positive(self.event_buffer, "event_buffer", domain)?;

        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(self.validation_error(
                "max_reconnect_delay must not be shorter than reconnect_delay",
            ));
        }

        if let Some(interval) = self.heartbeat_interval {
            validate_positive(interval.as_millis(), "heartbeat_interval", domain)?;
        }

        if let Some(name) = &self.process_name {
            validate_required_string(name, "process_name", domain)?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "client"
    }
}
