//! IPC transport implementations

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use hive_config::{TransportConfig, TransportKind};

use crate::connection::{Connection, ConnectionSettings};
use crate::error::{IpcError, IpcResult};

pub mod http;
#[cfg(windows)]
pub mod named_pipe;
#[cfg(unix)]
pub mod unix;

pub use http::HttpTransport;
#[cfg(windows)]
pub use named_pipe::NamedPipeTransport;
#[cfg(unix)]
pub use unix::UnixSocketTransport;

/// Accepted connections, one per peer
pub type Incoming = mpsc::Receiver<Connection>;

/// Backlog of accepted connections not yet picked up by the server
pub(crate) const ACCEPT_BACKLOG: usize = 64;

/// Pluggable channel abstraction producing connections
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bind the underlying resource; accepted peers arrive on the returned channel
    async fn listen(&self) -> IpcResult<Incoming>;

    /// Open one outbound connection
    async fn connect(&self) -> IpcResult<Connection>;

    /// Release the bound resource. Idempotent.
    async fn close(&self) -> IpcResult<()>;

    fn is_listening(&self) -> bool;

    /// Human readable address, for logs and `server-info`
    fn endpoint(&self) -> String;
}

/// Build the transport described by `config`.
///
/// Stream transports need `config.path`; the factory fills it from the role.
pub fn create_transport(
    config: &TransportConfig,
    settings: ConnectionSettings,
) -> IpcResult<Arc<dyn Transport>> {
    if !config.kind.is_supported() {
        return Err(IpcError::TransportError(format!(
            "transport '{}' is not available on this platform",
            config.kind
        )));
    }

    match config.kind {
        TransportKind::Http => Ok(Arc::new(HttpTransport::new(
            config.http_address.clone(),
            settings,
        ))),
        #[cfg(unix)]
        TransportKind::UnixSocket => Ok(Arc::new(UnixSocketTransport::new(
            required_path(config)?,
            settings,
        ))),
        #[cfg(windows)]
        TransportKind::NamedPipe => Ok(Arc::new(NamedPipeTransport::new(
            required_path(config)?,
            settings,
        ))),
        #[allow(unreachable_patterns)]
        other => Err(IpcError::TransportError(format!(
            "transport '{}' is not available on this platform",
            other
        ))),
    }
}

#[allow(dead_code)]
fn required_path(config: &TransportConfig) -> IpcResult<String> {
    config.path.clone().ok_or_else(|| {
        IpcError::TransportError(format!("transport '{}' requires a path", config.kind))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_stream_transport_requires_path() {
        let config = TransportConfig {
            kind: TransportKind::platform_default(),
            path: None,
            ..Default::default()
        };
        let err = create_transport(&config, ConnectionSettings::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::TransportError);
    }

    #[test]
    fn test_http_transport_needs_no_path() {
        let config = TransportConfig {
            kind: TransportKind::Http,
            ..Default::default()
        };
        let transport = create_transport(&config, ConnectionSettings::default()).unwrap();
        assert_eq!(transport.kind(), TransportKind::Http);
        assert!(!transport.is_listening());
    }

    #[test]
    fn test_unsupported_kind() {
        let foreign = if cfg!(windows) {
            TransportKind::UnixSocket
        } else {
            TransportKind::NamedPipe
        };
        let config = TransportConfig {
            kind: foreign,
            path: Some("hive-test".to_string()),
            ..Default::default()
        };
        assert!(create_transport(&config, ConnectionSettings::default()).is_err());
    }
}
