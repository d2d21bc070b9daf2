//! IPC server: accepts connections, polices traffic, dispatches commands

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_config::{SecurityConfig, ServerConfig, TransportKind};

use crate::connection::{Connection, ConnectionEvent, ConnectionHandle};
use crate::error::{ErrorCode, IpcError, IpcResult};
use crate::handler::{handler_fn, CommandHandler, RequestContext};
use crate::protocol::{
    Envelope, HandshakeAck, HandshakeRequest, Message, RemoteInfo, IPC_PROTOCOL_VERSION,
};
use crate::rate_limiter::RateLimiter;
use crate::transport::Transport;

/// Version reported in handshake acknowledgements and `server-info`
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Events a server reports to its owner
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A peer connected
    Connection {
        connection_id: String,
        remote_info: Option<RemoteInfo>,
    },
    /// A peer went away
    Disconnection { connection_id: String },
    /// `process_*` traffic for a process registry
    ProcessMessage {
        connection_id: String,
        envelope: Envelope,
    },
    /// Traffic the server does not route itself
    Message {
        connection_id: String,
        envelope: Envelope,
    },
    /// Transport fault on one connection
    ConnectionError {
        connection_id: String,
        error: IpcError,
    },
}

/// Snapshot returned by `server-info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub transport: TransportKind,
    pub endpoint: String,
    pub connections: usize,
    pub uptime_ms: u64,
    pub handlers: Vec<String>,
}

/// Entry returned by `list-connections`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_info: Option<RemoteInfo>,
}

struct Running {
    started_at: Instant,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Starting,
    Running(Running),
}

struct ServerInner {
    transport: Arc<dyn Transport>,
    security: SecurityConfig,
    config: ServerConfig,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    lifecycle: Mutex<Lifecycle>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
}

/// State owned by one connection's task
struct ConnectionState {
    limiter: Option<RateLimiter>,
    admitted: bool,
}

/// IPC server over one transport
#[derive(Clone)]
pub struct IpcServer {
    inner: Arc<ServerInner>,
}

impl IpcServer {
    pub fn new(transport: Arc<dyn Transport>, security: SecurityConfig, config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let inner = Arc::new(ServerInner {
            transport,
            security,
            config,
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::Stopped),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        ServerInner::install_builtins(&inner);
        Self { inner }
    }

    /// Hand out the event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Bind the transport and start accepting connections
    pub async fn start(&self) -> IpcResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Stopped) {
                return Err(IpcError::TransportError("server already started".to_string()));
            }
            *lifecycle = Lifecycle::Starting;
        }

        let mut incoming = match self.inner.transport.listen().await {
            Ok(incoming) => incoming,
            Err(e) => {
                *self.inner.lifecycle.lock() = Lifecycle::Stopped;
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let weak = Arc::downgrade(&self.inner);

        let accept_task = tokio::spawn(async move {
            loop {
                let connection = tokio::select! {
                    _ = token.cancelled() => break,
                    connection = incoming.recv() => match connection {
                        Some(connection) => connection,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                ServerInner::admit(&inner, connection);
            }
        });

        *self.inner.lifecycle.lock() = Lifecycle::Running(Running {
            started_at: Instant::now(),
            shutdown,
            accept_task,
        });

        info!(
            transport = %self.inner.transport.kind(),
            endpoint = %self.inner.transport.endpoint(),
            "IPC server started"
        );
        Ok(())
    }

    /// Close every connection, release the transport and reset registrations.
    /// No-op when not started.
    pub async fn stop(&self) -> IpcResult<()> {
        let running = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        running.shutdown.cancel();
        let _ = running.accept_task.await;

        let handles: Vec<ConnectionHandle> = self
            .inner
            .connections
            .write()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        join_all(handles.iter().map(|handle| handle.close())).await;

        let result = self.inner.transport.close().await;

        self.inner.handlers.write().clear();
        ServerInner::install_builtins(&self.inner);

        info!(closed = handles.len(), "IPC server stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Running(_))
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.inner.security
    }

    /// Register a handler; the last registration for a command wins
    pub fn register_handler(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let command = command.into();
        if self
            .inner
            .handlers
            .write()
            .insert(command.clone(), handler)
            .is_some()
        {
            warn!(command = %command, "Replacing existing command handler");
        }
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&self, command: impl Into<String>, func: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IpcResult<Value>> + Send + 'static,
    {
        self.register_handler(command, handler_fn(func));
    }

    pub fn unregister_handler(&self, command: &str) -> bool {
        self.inner.handlers.write().remove(command).is_some()
    }

    pub fn has_handler(&self, command: &str) -> bool {
        self.inner.handlers.read().contains_key(command)
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.inner.handler_names()
    }

    /// Send to every live connection except `exclude`; returns how many got it
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        let targets: Vec<ConnectionHandle> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|handle| Some(handle.id()) != exclude)
            .cloned()
            .collect();

        let mut delivered = 0;
        for handle in targets {
            match handle.send(envelope) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection_id = %handle.id(), error = %e, "Broadcast delivery failed")
                }
            }
        }
        delivered
    }

    /// Send to one connection
    pub fn send_to(&self, connection_id: &str, envelope: &Envelope) -> IpcResult<()> {
        let handle = self.connection(connection_id).ok_or_else(|| {
            IpcError::ConnectionLost(format!("no connection with id {}", connection_id))
        })?;
        handle.send(envelope)
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.inner.connections.read().get(connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        self.inner.list_connections()
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server_info()
    }

    /// Allow-list check against the peer's process name
    pub fn validate_connection(&self, remote_info: Option<&RemoteInfo>) -> IpcResult<()> {
        self.inner.validate_connection(remote_info)
    }
}

impl ServerInner {
    fn install_builtins(inner: &Arc<ServerInner>) {
        if !inner.config.builtin_handlers {
            return;
        }
        let mut handlers = inner.handlers.write();
        handlers.insert("ping".to_string(), Arc::new(PingHandler));
        handlers.insert(
            "server-info".to_string(),
            Arc::new(ServerInfoHandler {
                server: Arc::downgrade(inner),
            }),
        );
        handlers.insert(
            "list-connections".to_string(),
            Arc::new(ListConnectionsHandler {
                server: Arc::downgrade(inner),
            }),
        );
    }

    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "Server event dropped");
        }
    }

    fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn list_connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .connections
            .read()
            .values()
            .map(|handle| ConnectionSummary {
                id: handle.id().to_string(),
                remote_info: handle.remote_info(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn server_info(&self) -> ServerInfo {
        let uptime_ms = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running.started_at.elapsed().as_millis() as u64,
            _ => 0,
        };
        ServerInfo {
            version: SERVER_VERSION.to_string(),
            transport: self.transport.kind(),
            endpoint: self.transport.endpoint(),
            connections: self.connections.read().len(),
            uptime_ms,
            handlers: self.handler_names(),
        }
    }

    fn validate_connection(&self, remote_info: Option<&RemoteInfo>) -> IpcResult<()> {
        if self.security.allowed_processes.is_empty() {
            return Ok(());
        }
        match remote_info.and_then(|info| info.process_name.as_deref()) {
            Some(name) if self.security.is_process_allowed(name) => Ok(()),
            Some(name) => Err(IpcError::AuthenticationFailed(format!(
                "process '{}' is not allowed",
                name
            ))),
            None => Err(IpcError::AuthenticationFailed(
                "process name is required".to_string(),
            )),
        }
    }

    /// Take ownership of a freshly accepted connection
    fn admit(inner: &Arc<ServerInner>, connection: Connection) {
        let (handle, events) = connection.into_parts();
        let remote_info = handle.remote_info();

        // Transports that know the peer's name are checked up front
        if remote_info.as_ref().is_some_and(|info| info.process_name.is_some()) {
            if let Err(e) = inner.validate_connection(remote_info.as_ref()) {
                warn!(connection_id = %handle.id(), error = %e, "Rejecting connection");
                let _ = handle.send(&Envelope::error(None, &e));
                handle.request_close();
                return;
            }
        }

        let limiter = inner
            .security
            .rate_limit_per_second
            .map(|rate| RateLimiter::new(rate, inner.security.rate_limit_burst));
        let state = ConnectionState {
            limiter,
            admitted: !inner.security.requires_handshake(),
        };

        inner
            .connections
            .write()
            .insert(handle.id().to_string(), handle.clone());
        debug!(connection_id = %handle.id(), "Connection admitted");
        inner.emit(ServerEvent::Connection {
            connection_id: handle.id().to_string(),
            remote_info,
        });

        let handshake_deadline = (!state.admitted)
            .then(|| tokio::time::Instant::now() + inner.config.handshake_timeout);
        tokio::spawn(run_connection(
            Arc::downgrade(inner),
            handle,
            events,
            state,
            handshake_deadline,
        ));
    }

    /// Route one inbound envelope: rate limit, size limit, then type
    fn dispatch(&self, handle: &ConnectionHandle, state: &mut ConnectionState, envelope: Envelope) {
        if let Some(limiter) = state.limiter.as_mut() {
            if !limiter.try_consume() {
                warn!(connection_id = %handle.id(), "Rate limit exceeded");
                let err = IpcError::RateLimitExceeded(format!(
                    "more than {} messages per second",
                    self.security.rate_limit_per_second.unwrap_or_default()
                ));
                reply(handle, Envelope::error(Some(envelope.id), &err));
                return;
            }
        }

        let size = envelope.encoded_len().unwrap_or(usize::MAX);
        if size > self.security.max_message_size {
            warn!(connection_id = %handle.id(), size, "Message too large");
            let err = IpcError::too_large(size, self.security.max_message_size);
            reply(handle, Envelope::error(Some(envelope.id), &err));
            return;
        }

        if !state.admitted && !matches!(envelope.message, Message::Handshake(_)) {
            let err = IpcError::AuthenticationFailed("handshake required".to_string());
            reply(handle, Envelope::error(Some(envelope.id), &err));
            return;
        }

        match &envelope.message {
            Message::Heartbeat(payload) => {
                reply(handle, Envelope::new(Message::Heartbeat(payload.clone())));
            }
            Message::Handshake(request) => {
                let request = request.clone();
                self.handle_handshake(handle, state, &envelope, &request);
            }
            Message::CommandRequest { command, payload } => {
                let (command, payload) = (command.clone(), payload.clone());
                self.handle_command(handle, envelope, command, payload);
            }
            message if message.message_type().is_process() => {
                self.emit(ServerEvent::ProcessMessage {
                    connection_id: handle.id().to_string(),
                    envelope,
                });
            }
            _ => {
                self.emit(ServerEvent::Message {
                    connection_id: handle.id().to_string(),
                    envelope,
                });
            }
        }
    }

    fn handle_handshake(
        &self,
        handle: &ConnectionHandle,
        state: &mut ConnectionState,
        envelope: &Envelope,
        request: &HandshakeRequest,
    ) {
        if request.protocol_version != IPC_PROTOCOL_VERSION {
            let err = IpcError::ProtocolError(format!(
                "protocol version {} not supported, expected {}",
                request.protocol_version, IPC_PROTOCOL_VERSION
            ));
            reply(handle, Envelope::error(Some(envelope.id.clone()), &err));
            return;
        }

        let info = RemoteInfo::merge_handshake(handle.remote_info().as_ref(), request);
        if let Err(e) = self
            .authenticate(request)
            .and_then(|_| self.validate_connection(Some(&info)))
        {
            warn!(connection_id = %handle.id(), error = %e, "Handshake rejected");
            reply(handle, Envelope::error(Some(envelope.id.clone()), &e));
            handle.request_close();
            return;
        }

        debug!(
            connection_id = %handle.id(),
            process_name = ?info.process_name,
            pid = ?info.pid,
            "Handshake accepted"
        );
        handle.set_remote_info(info);
        state.admitted = true;

        let ack = HandshakeAck {
            connection_id: handle.id().to_string(),
            server_version: SERVER_VERSION.to_string(),
        };
        let payload = serde_json::to_value(ack).unwrap_or(Value::Null);
        reply(handle, Envelope::acknowledge(&envelope.id, payload));
    }

    fn authenticate(&self, request: &HandshakeRequest) -> IpcResult<()> {
        if !self.security.enable_authentication {
            return Ok(());
        }
        match (&self.security.auth_token, &request.auth_token) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (_, None) => Err(IpcError::AuthenticationFailed(
                "auth token required".to_string(),
            )),
            _ => Err(IpcError::AuthenticationFailed("invalid auth token".to_string())),
        }
    }

    fn handle_command(
        &self,
        handle: &ConnectionHandle,
        envelope: Envelope,
        command: String,
        payload: Value,
    ) {
        let handler = self.handlers.read().get(&command).cloned();
        let Some(handler) = handler else {
            let err = IpcError::ProtocolError(format!("unknown command '{}'", command));
            reply(handle, Envelope::error(Some(envelope.id), &err));
            return;
        };

        let request_id = envelope.id.clone();
        let reply_target = envelope.source.clone();
        let ctx = RequestContext {
            connection: handle.clone(),
            envelope,
        };
        let handle = handle.clone();

        // Handlers run concurrently; replies are correlated by id, not order
        tokio::spawn(async move {
            let mut response = match handler.handle(payload, ctx).await {
                Ok(value) => Envelope::response(&request_id, value),
                Err(e) => {
                    debug!(command = %command, error = %e, "Command handler failed");
                    Envelope::error(Some(request_id.clone()), &e)
                }
            };
            response.target = reply_target;

            match handle.send(&response) {
                Ok(()) => {}
                Err(e @ IpcError::MessageTooLarge(_)) => {
                    reply(&handle, Envelope::error(Some(request_id), &e));
                }
                Err(e) => {
                    debug!(connection_id = %handle.id(), command = %command, error = %e, "Could not deliver response")
                }
            }
        });
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = self.lifecycle.get_mut() {
            running.shutdown.cancel();
            running.accept_task.abort();
        }
    }
}

fn reply(handle: &ConnectionHandle, envelope: Envelope) {
    if let Err(e) = handle.send(&envelope) {
        debug!(connection_id = %handle.id(), error = %e, "Could not send reply");
    }
}

async fn run_connection(
    server: Weak<ServerInner>,
    handle: ConnectionHandle,
    mut events: mpsc::Receiver<ConnectionEvent>,
    mut state: ConnectionState,
    mut handshake_deadline: Option<tokio::time::Instant>,
) {
    loop {
        let pending_deadline = handshake_deadline.filter(|_| !state.admitted);
        let event = match pending_deadline {
            None => events.recv().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    warn!(connection_id = %handle.id(), "No handshake received in time");
                    let err = IpcError::AuthenticationFailed("handshake timed out".to_string());
                    reply(&handle, Envelope::error(None, &err));
                    handle.request_close();
                    handshake_deadline = None;
                    continue;
                }
            },
        };

        let Some(inner) = server.upgrade() else {
            handle.request_close();
            break;
        };

        match event {
            Some(ConnectionEvent::Message(envelope)) => {
                inner.dispatch(&handle, &mut state, envelope);
            }
            Some(ConnectionEvent::Error(error)) => {
                // The stream survives a bad frame; tell the peer why it was dropped
                if matches!(error.code(), ErrorCode::MessageTooLarge | ErrorCode::ProtocolError) {
                    reply(&handle, Envelope::error(None, &error));
                }
                inner.emit(ServerEvent::ConnectionError {
                    connection_id: handle.id().to_string(),
                    error,
                });
            }
            Some(ConnectionEvent::Closed) | None => break,
        }
    }

    if let Some(inner) = server.upgrade() {
        inner.connections.write().remove(handle.id());
        inner.emit(ServerEvent::Disconnection {
            connection_id: handle.id().to_string(),
        });
    }
    debug!(connection_id = %handle.id(), "Connection task finished");
}

struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _payload: Value, _ctx: RequestContext) -> IpcResult<Value> {
        Ok(json!({
            "pong": true,
            "timestamp": chrono::Utc::now(),
        }))
    }
}

struct ServerInfoHandler {
    server: Weak<ServerInner>,
}

#[async_trait]
impl CommandHandler for ServerInfoHandler {
    async fn handle(&self, _payload: Value, _ctx: RequestContext) -> IpcResult<Value> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| IpcError::TransportError("server is gone".to_string()))?;
        Ok(serde_json::to_value(server.server_info())?)
    }
}

struct ListConnectionsHandler {
    server: Weak<ServerInner>,
}

#[async_trait]
impl CommandHandler for ListConnectionsHandler {
    async fn handle(&self, _payload: Value, _ctx: RequestContext) -> IpcResult<Value> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| IpcError::TransportError("server is gone".to_string()))?;
        Ok(serde_json::to_value(server.list_connections())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{new_connection, ConnectionSettings};
    use crate::transport::Incoming;

    /// Transport whose connections are created in-process by the test
    struct MemoryTransport {
        incoming: Mutex<Option<Incoming>>,
        listening: std::sync::atomic::AtomicBool,
    }

    impl MemoryTransport {
        fn new() -> (Arc<Self>, mpsc::Sender<Connection>) {
            let (tx, rx) = mpsc::channel(8);
            let transport = Arc::new(Self {
                incoming: Mutex::new(Some(rx)),
                listening: std::sync::atomic::AtomicBool::new(false),
            });
            (transport, tx)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::platform_default()
        }

        async fn listen(&self) -> IpcResult<Incoming> {
            self.listening.store(true, std::sync::atomic::Ordering::SeqCst);
            self.incoming
                .lock()
                .take()
                .ok_or_else(|| IpcError::TransportError("already listened".to_string()))
        }

        async fn connect(&self) -> IpcResult<Connection> {
            Err(IpcError::ConnectionFailed("memory transport".to_string()))
        }

        async fn close(&self) -> IpcResult<()> {
            self.listening.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_listening(&self) -> bool {
            self.listening.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn endpoint(&self) -> String {
            "memory".to_string()
        }
    }

    fn server_with(security: SecurityConfig) -> (IpcServer, mpsc::Sender<Connection>) {
        let (transport, tx) = MemoryTransport::new();
        (IpcServer::new(transport, security, ServerConfig::default()), tx)
    }

    #[tokio::test]
    async fn test_start_twice_is_transport_error() {
        let (server, _tx) = server_with(SecurityConfig::default());
        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportError);
        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (server, _tx) = server_with(SecurityConfig::default());
        assert!(server.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_builtins_present_and_restored_after_stop() {
        let (server, _tx) = server_with(SecurityConfig::default());
        assert_eq!(server.handler_names(), vec!["list-connections", "ping", "server-info"]);

        server.register_fn("echo", |payload, _ctx| async move { Ok(payload) });
        assert!(server.has_handler("echo"));
        server.start().await.unwrap();
        server.stop().await.unwrap();

        assert!(!server.has_handler("echo"));
        assert!(server.has_handler("ping"));
    }

    #[tokio::test]
    async fn test_unregister_handler() {
        let (server, _tx) = server_with(SecurityConfig::default());
        server.register_fn("echo", |payload, _ctx| async move { Ok(payload) });
        assert!(server.unregister_handler("echo"));
        assert!(!server.unregister_handler("echo"));
    }

    #[test]
    fn test_validate_connection_allow_list() {
        let (server, _tx) = server_with(SecurityConfig {
            allowed_processes: vec!["hive-agent".to_string()],
            ..Default::default()
        });
        let allowed = RemoteInfo {
            process_name: Some("hive-agent".to_string()),
            ..Default::default()
        };
        let denied = RemoteInfo {
            process_name: Some("intruder".to_string()),
            ..Default::default()
        };

        assert!(server.validate_connection(Some(&allowed)).is_ok());
        assert_eq!(
            server.validate_connection(Some(&denied)).unwrap_err().code(),
            ErrorCode::AuthenticationFailed
        );
        assert!(server.validate_connection(None).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_and_closed() {
        let (server, tx) = server_with(SecurityConfig::default());
        let mut events = server.take_events().unwrap();
        server.start().await.unwrap();

        let mut ids = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (connection, sink, outbound) =
                new_connection(TransportKind::platform_default(), None, ConnectionSettings::default());
            tx.send(connection).await.unwrap();
            match events.recv().await {
                Some(ServerEvent::Connection { connection_id, .. }) => ids.push(connection_id),
                other => panic!("unexpected event: {:?}", other),
            }
            peers.push((sink, outbound));
        }

        let delivered = server.broadcast(&Envelope::heartbeat(), Some(&ids[0]));
        assert_eq!(delivered, 2);

        assert!(peers[0].1.try_recv().is_err());
        assert!(peers[1].1.try_recv().is_ok());
        assert!(peers[2].1.try_recv().is_ok());

        for (sink, _) in &peers {
            sink.finish().await;
        }
        server.stop().await.unwrap();
        assert_eq!(server.connection_count(), 0);
    }
}
