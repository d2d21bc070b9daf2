//! Transport selection and addressing

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_socket_address, Validatable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of byte transport carrying IPC envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unix domain socket (POSIX)
    UnixSocket,
    /// Named pipe (Windows)
    NamedPipe,
    /// HTTP fallback with a server-sent event stream for server→client delivery
    Http,
}

impl TransportKind {
    /// Default transport for the platform this binary was built for
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            TransportKind::NamedPipe
        } else {
            TransportKind::UnixSocket
        }
    }

    /// Whether the transport can be used on the current platform
    pub fn is_supported(&self) -> bool {
        match self {
            TransportKind::UnixSocket => cfg!(unix),
            TransportKind::NamedPipe => cfg!(windows),
            TransportKind::Http => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::UnixSocket => "unix_socket",
            TransportKind::NamedPipe => "named_pipe",
            TransportKind::Http => "http",
        }
    }
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unix_socket" | "unix" | "socket" => Ok(TransportKind::UnixSocket),
            "named_pipe" | "pipe" => Ok(TransportKind::NamedPipe),
            "http" => Ok(TransportKind::Http),
            _ => Err(format!("Invalid transport kind: {}", s)),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport kind
    #[serde(default)]
    pub kind: TransportKind,

    /// Socket path or pipe name; derived from the endpoint role when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Bind / connect address of the HTTP fallback transport
    #[serde(default = "default_http_address")]
    pub http_address: String,

    /// Hard ceiling for a single encoded frame on stream transports
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_http_address() -> String {
    "127.0.0.1:47700".to_string()
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::platform_default(),
            path: None,
            http_address: default_http_address(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Validatable for TransportConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !self.kind.is_supported() {
            return Err(self.validation_error(format!(
                "transport '{}' is not available on this platform",
                self.kind
            )));
        }

        if let Some(path) = &self.path {
            if path.trim().is_empty() {
                return Err(self.validation_error("path cannot be empty when set"));
            }
        }

        if self.kind == TransportKind::Http {
            validate_socket_address(&self.http_address, "http_address", self.domain_name())?;
        }

        validate_positive(self.max_frame_size, "max_frame_size", self.domain_name())?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_default_is_supported() {
        assert!(TransportKind::platform_default().is_supported());
        assert!(TransportKind::Http.is_supported());
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("unix-socket".parse::<TransportKind>().unwrap(), TransportKind::UnixSocket);
        assert_eq!("PIPE".parse::<TransportKind>().unwrap(), TransportKind::NamedPipe);
        assert_eq!("http".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_http_address_validation() {
        let mut config = TransportConfig {
            kind: TransportKind::Http,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.http_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }
}
