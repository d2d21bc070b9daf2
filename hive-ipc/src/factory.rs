//! Platform defaults and wiring of servers and clients

use std::path::PathBuf;
use std::sync::Arc;

use hive_config::{
    ClientConfig, HiveConfig, SecurityConfig, ServerConfig, TransportConfig, TransportKind,
};

use crate::client::IpcClient;
use crate::connection::ConnectionSettings;
use crate::error::IpcResult;
use crate::server::IpcServer;
use crate::transport::{create_transport, Transport};

/// Directory under the temp dir holding well-known sockets
const SOCKET_DIR: &str = "hive";
/// Prefix of well-known pipe names
const PIPE_PREFIX: &str = "hive";

/// Well-known endpoint roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointRole {
    Orchestrator,
    Agent(String),
    Swarm(String),
}

impl EndpointRole {
    /// Socket path on POSIX systems
    pub fn socket_path(&self) -> PathBuf {
        let base = std::env::temp_dir().join(SOCKET_DIR);
        match self {
            EndpointRole::Orchestrator => base.join("orchestrator.sock"),
            EndpointRole::Agent(id) => base.join("agents").join(format!("{}.sock", id)),
            EndpointRole::Swarm(id) => base.join("swarms").join(format!("{}.sock", id)),
        }
    }

    /// Pipe name on Windows
    pub fn pipe_name(&self) -> String {
        match self {
            EndpointRole::Orchestrator => format!(r"\\.\pipe\{}-orchestrator", PIPE_PREFIX),
            EndpointRole::Agent(id) => format!(r"\\.\pipe\{}-agent-{}", PIPE_PREFIX, id),
            EndpointRole::Swarm(id) => format!(r"\\.\pipe\{}-swarm-{}", PIPE_PREFIX, id),
        }
    }

    /// Address for `kind`; `None` for the HTTP transport, which uses an address instead
    pub fn default_path(&self, kind: TransportKind) -> Option<String> {
        match kind {
            TransportKind::UnixSocket => Some(self.socket_path().to_string_lossy().into_owned()),
            TransportKind::NamedPipe => Some(self.pipe_name()),
            TransportKind::Http => None,
        }
    }
}

/// Partial server configuration; unset fields take the factory defaults
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub transport: Option<TransportKind>,
    pub path: Option<String>,
    pub http_address: Option<String>,
    pub security: Option<SecurityConfig>,
    pub server: Option<ServerConfig>,
}

/// Partial client configuration; unset fields take the factory defaults
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub transport: Option<TransportKind>,
    pub path: Option<String>,
    pub http_address: Option<String>,
    pub client: Option<ClientConfig>,
    pub auth_token: Option<String>,
}

/// Resolves defaults and builds servers and clients.
///
/// Holds its own copy of the base configuration; nothing global is touched.
#[derive(Debug, Clone, Default)]
pub struct IpcFactory {
    base: HiveConfig,
}

impl IpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a loaded configuration as the base instead of built-in defaults
    pub fn with_config(config: HiveConfig) -> Self {
        Self { base: config }
    }

    pub fn config(&self) -> &HiveConfig {
        &self.base
    }

    pub fn default_transport_kind() -> TransportKind {
        TransportKind::platform_default()
    }

    /// Authentication off, size ceiling and rate limit on
    pub fn default_security() -> SecurityConfig {
        SecurityConfig::default()
    }

    /// Transport configuration for `role` with `kind`, path filled in from the role
    pub fn transport_config(
        &self,
        role: &EndpointRole,
        kind: Option<TransportKind>,
        path: Option<String>,
        http_address: Option<String>,
    ) -> TransportConfig {
        let mut config = self.base.transport.clone();
        if let Some(kind) = kind {
            config.kind = kind;
            // A path configured for another kind does not carry over
            if kind != self.base.transport.kind {
                config.path = None;
            }
        }
        if let Some(path) = path {
            config.path = Some(path);
        }
        if let Some(address) = http_address {
            config.http_address = address;
        }
        if config.path.is_none() {
            config.path = role.default_path(config.kind);
        }
        config
    }

    fn settings(&self, transport: &TransportConfig, event_buffer: usize) -> ConnectionSettings {
        ConnectionSettings {
            max_frame_size: transport.max_frame_size,
            event_buffer,
        }
    }

    pub fn create_transport(
        &self,
        role: &EndpointRole,
        kind: Option<TransportKind>,
        path: Option<String>,
    ) -> IpcResult<Arc<dyn Transport>> {
        let config = self.transport_config(role, kind, path, None);
        create_transport(&config, self.settings(&config, self.base.server.event_buffer))
    }

    /// Build an unstarted server for `role`
    pub fn create_server(&self, role: &EndpointRole, options: ServerOptions) -> IpcResult<IpcServer> {
        let transport_config =
            self.transport_config(role, options.transport, options.path, options.http_address);
        let security = options.security.unwrap_or_else(|| self.base.security.clone());
        let server_config = options.server.unwrap_or_else(|| self.base.server.clone());
        let transport = create_transport(
            &transport_config,
            self.settings(&transport_config, server_config.event_buffer),
        )?;
        Ok(IpcServer::new(transport, security, server_config))
    }

    /// Build a disconnected client targeting `role`
    pub fn create_client(&self, role: &EndpointRole, options: ClientOptions) -> IpcResult<IpcClient> {
        let transport_config =
            self.transport_config(role, options.transport, options.path, options.http_address);
        let client_config = options.client.unwrap_or_else(|| self.base.client.clone());
        let auth_token = options
            .auth_token
            .or_else(|| self.base.security.auth_token.clone());
        let transport = create_transport(
            &transport_config,
            self.settings(&transport_config, client_config.event_buffer),
        )?;
        Ok(IpcClient::new(transport, client_config, auth_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_socket_paths() {
        let base = std::env::temp_dir().join("hive");
        assert_eq!(
            EndpointRole::Orchestrator.socket_path(),
            base.join("orchestrator.sock")
        );
        assert_eq!(
            EndpointRole::Agent("a1".to_string()).socket_path(),
            base.join("agents").join("a1.sock")
        );
        assert_eq!(
            EndpointRole::Swarm("s1".to_string()).socket_path(),
            base.join("swarms").join("s1.sock")
        );
    }

    #[test]
    fn test_role_pipe_names() {
        assert_eq!(EndpointRole::Orchestrator.pipe_name(), r"\\.\pipe\hive-orchestrator");
        assert_eq!(
            EndpointRole::Agent("a1".to_string()).pipe_name(),
            r"\\.\pipe\hive-agent-a1"
        );
        assert_eq!(
            EndpointRole::Swarm("s1".to_string()).pipe_name(),
            r"\\.\pipe\hive-swarm-s1"
        );
    }

    #[test]
    fn test_default_security_is_permissive_but_bounded() {
        let security = IpcFactory::default_security();
        assert!(!security.enable_authentication);
        assert_eq!(security.max_message_size, 10 * 1024 * 1024);
        assert!(security.rate_limit_per_second.is_some());
    }

    #[test]
    fn test_transport_config_fills_path_from_role() {
        let factory = IpcFactory::new();
        let config = factory.transport_config(&EndpointRole::Orchestrator, None, None, None);
        assert_eq!(config.kind, IpcFactory::default_transport_kind());
        assert_eq!(
            config.path,
            EndpointRole::Orchestrator.default_path(config.kind)
        );

        let explicit = factory.transport_config(
            &EndpointRole::Orchestrator,
            None,
            Some("/tmp/custom.sock".to_string()),
            None,
        );
        assert_eq!(explicit.path.as_deref(), Some("/tmp/custom.sock"));

        let http = factory.transport_config(
            &EndpointRole::Orchestrator,
            Some(TransportKind::Http),
            None,
            Some("127.0.0.1:0".to_string()),
        );
        assert_eq!(http.path, None);
        assert_eq!(http.http_address, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_partial_options_merge_over_defaults() {
        let factory = IpcFactory::new();
        let server = factory
            .create_server(
                &EndpointRole::Agent("a1".to_string()),
                ServerOptions {
                    transport: Some(TransportKind::Http),
                    security: Some(SecurityConfig {
                        max_message_size: 1024,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(server.security().max_message_size, 1024);
        assert_eq!(server.transport().kind(), TransportKind::Http);
        assert!(!server.is_running());

        let client = factory
            .create_client(
                &EndpointRole::Agent("a1".to_string()),
                ClientOptions {
                    transport: Some(TransportKind::Http),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.config(), &ClientConfig::default());

        // The factory's own base is untouched by per-call options
        assert_eq!(factory.config(), &HiveConfig::default());
    }
}
