//! Inbound traffic policy shared by IPC servers and clients

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};

/// Default ceiling for a serialized envelope (10 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default per-connection admission rate
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 100;

/// Security policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require a shared token in the connection handshake
    #[serde(default = "crate::domains::utils::default_false")]
    pub enable_authentication: bool,

    /// Shared token checked when authentication is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Process names allowed to connect; empty admits everyone
    #[serde(default)]
    pub allowed_processes: Vec<String>,

    /// Maximum serialized envelope size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Token refill rate per connection; `None` disables rate limiting
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: Option<u32>,

    /// Bucket capacity; defaults to the refill rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_burst: Option<u32>,

    /// Reserved; no cipher is applied by the IPC layer
    #[serde(default = "crate::domains::utils::default_false")]
    pub enable_encryption: bool,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_rate_limit() -> Option<u32> {
    Some(DEFAULT_RATE_LIMIT_PER_SECOND)
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_authentication: false,
            auth_token: None,
            allowed_processes: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rate_limit_per_second: Some(DEFAULT_RATE_LIMIT_PER_SECOND),
            rate_limit_burst: None,
            enable_encryption: false,
        }
    }
}

impl SecurityConfig {
    /// Whether peers must complete a handshake before other traffic is admitted
    pub fn requires_handshake(&self) -> bool {
        self.enable_authentication || !self.allowed_processes.is_empty()
    }

    /// Whether `process_name` passes the allow-list
    pub fn is_process_allowed(&self, process_name: &str) -> bool {
        self.allowed_processes.is_empty()
            || self.allowed_processes.iter().any(|allowed| allowed == process_name)
    }
}

impl Validatable for SecurityConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_message_size, "max_message_size", self.domain_name())?;

        if self.enable_authentication {
            let token = self
                .auth_token
                .as_deref()
                .ok_or_else(|| self.validation_error("auth_token is required when authentication is enabled"))?;
            validate_required_string(token, "auth_token", self.domain_name())?;
        }

        if let Some(rate) = self.rate_limit_per_second {
            validate_positive(rate, "rate_limit_per_second", self.domain_name())?;
        }

        if let Some(burst) = self.rate_limit_burst {
            validate_positive(burst, "rate_limit_burst", self.domain_name())?;
        }

        if self.allowed_processes.iter().any(|name| name.trim().is_empty()) {
            return Err(self.validation_error("allowed_processes cannot contain empty names"));
        }

        if self.enable_encryption {
            tracing::warn!("enable_encryption is set but the IPC layer does not encrypt traffic");
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "security"
    }
}
