//! IPC client with request/reply correlation, heartbeat and reconnection
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected`, and on unexpected
//! loss `Connected -> Reconnecting -> Connecting`. `disconnect()` returns to
//! `Disconnected` from any state. Each state owns at most one timer task,
//! aborted when the state is left.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_config::ClientConfig;
use hive_resilience::BackoffCalculator;

use crate::connection::{ConnectionEvent, ConnectionHandle};
use crate::error::{IpcError, IpcResult};
use crate::protocol::{Envelope, HandshakeAck, HandshakeRequest, Message};
use crate::transport::Transport;

/// Events a client reports to its owner
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { connection_id: String },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnection gave up after `attempts` failures
    ReconnectionFailed { attempts: u32 },
    /// Envelope not claimed by a pending request
    Message(Envelope),
    Error(IpcError),
}

/// Observable client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Session {
    handle: ConnectionHandle,
    heartbeat: Option<JoinHandle<()>>,
}

enum Phase {
    Disconnected,
    Connecting,
    Connected(Session),
    Reconnecting { timer: JoinHandle<()> },
}

struct ClientState {
    phase: Phase,
    /// Consecutive failed reconnect attempts
    attempts: u32,
    /// Bumped by `connect()` and `disconnect()`; stale timers and tasks compare against it
    generation: u64,
}

struct Pending {
    tx: oneshot::Sender<IpcResult<Envelope>>,
    command: String,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    auth_token: Option<String>,
    backoff: BackoffCalculator,
    state: Mutex<ClientState>,
    pending: Mutex<HashMap<String, Pending>>,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

/// Removes a pending entry when the waiting future finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, Pending>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// IPC client owning at most one connection at a time
#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<ClientInner>,
}

impl IpcClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        auth_token: Option<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let backoff =
            BackoffCalculator::exponential(config.reconnect_delay, config.max_reconnect_delay)
                .with_jitter(config.reconnect_jitter);
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                auth_token,
                backoff,
                state: Mutex::new(ClientState {
                    phase: Phase::Disconnected,
                    attempts: 0,
                    generation: 0,
                }),
                pending: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Hand out the event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.inner.events_rx.lock().take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ClientStatus {
        match self.inner.state.lock().phase {
            Phase::Disconnected => ClientStatus::Disconnected,
            Phase::Connecting => ClientStatus::Connecting,
            Phase::Connected(_) => ClientStatus::Connected,
            Phase::Reconnecting { .. } => ClientStatus::Reconnecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.current_handle().map(|handle| handle.id().to_string())
    }

    /// Requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Establish a connection and complete the handshake
    pub async fn connect(&self) -> IpcResult<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            match &state.phase {
                Phase::Connected(_) => {
                    return Err(IpcError::ConnectionFailed("already connected".to_string()))
                }
                Phase::Connecting => {
                    return Err(IpcError::ConnectionFailed(
                        "connection already in progress".to_string(),
                    ))
                }
                Phase::Disconnected | Phase::Reconnecting { .. } => {}
            }
            if let Phase::Reconnecting { timer } =
                std::mem::replace(&mut state.phase, Phase::Connecting)
            {
                timer.abort();
            }
            state.generation += 1;
            state.generation
        };

        let result = ClientInner::establish(&self.inner, generation).await;
        if result.is_err() {
            let mut state = self.inner.state.lock();
            if state.generation == generation && matches!(state.phase, Phase::Connecting) {
                state.phase = Phase::Disconnected;
            }
        }
        result
    }

    /// Close the connection, cancel any scheduled reconnect and fail pending requests
    pub async fn disconnect(&self) {
        let (session, was_disconnected) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.attempts = 0;
            match std::mem::replace(&mut state.phase, Phase::Disconnected) {
                Phase::Connected(session) => (Some(session), false),
                Phase::Reconnecting { timer } => {
                    timer.abort();
                    (None, false)
                }
                Phase::Connecting => (None, false),
                Phase::Disconnected => (None, true),
            }
        };

        if let Some(session) = session {
            if let Some(heartbeat) = session.heartbeat {
                heartbeat.abort();
            }
            session.handle.close().await;
        }

        self.inner
            .reject_all(|| IpcError::ConnectionLost("client disconnected".to_string()));

        if !was_disconnected {
            info!("IPC client disconnected");
            self.inner.emit(ClientEvent::Disconnected);
        }
    }

    /// Fire-and-forget send
    pub fn send(&self, envelope: Envelope) -> IpcResult<()> {
        let handle = self
            .inner
            .current_handle()
            .ok_or_else(|| IpcError::ConnectionLost("not connected".to_string()))?;
        handle.send(&self.inner.stamp(envelope))
    }

    /// Call a command with the configured default timeout
    pub async fn request(&self, command: &str, payload: Value) -> IpcResult<Value> {
        self.request_with_timeout(command, payload, None).await
    }

    pub async fn request_with_timeout(
        &self,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> IpcResult<Value> {
        let response = self
            .request_envelope(Envelope::request(command, payload), timeout)
            .await?;
        match response.message {
            Message::CommandResponse { payload, .. } | Message::Acknowledge { payload, .. } => {
                Ok(payload)
            }
            other => Err(IpcError::ProtocolError(format!(
                "unexpected reply of type {}",
                other.message_type()
            ))),
        }
    }

    /// Send an envelope and wait for the envelope answering it.
    ///
    /// Resolves exactly once: with the reply, with the carried error, with
    /// `TIMEOUT`, or with `CONNECTION_LOST`. A reply arriving later is dropped.
    pub async fn request_envelope(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> IpcResult<Envelope> {
        let handle = self
            .inner
            .current_handle()
            .ok_or_else(|| IpcError::ConnectionLost("not connected".to_string()))?;

        let envelope = self.inner.stamp(envelope);
        let command = envelope
            .command()
            .map(str::to_string)
            .unwrap_or_else(|| envelope.message_type().to_string());
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            envelope.id.clone(),
            Pending {
                tx,
                command: command.clone(),
            },
        );
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: envelope.id.clone(),
        };

        handle.send(&envelope)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpcError::ConnectionLost(format!(
                "request '{}' was abandoned",
                command
            ))),
            Err(_) => {
                debug!(command = %command, request_id = %envelope.id, "Request timed out");
                Err(IpcError::timeout(&command, timeout))
            }
        }
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "Client event dropped");
        }
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        match &self.state.lock().phase {
            Phase::Connected(session) => Some(session.handle.clone()),
            _ => None,
        }
    }

    fn stamp(&self, mut envelope: Envelope) -> Envelope {
        if envelope.source.is_none() {
            envelope.source = self.config.source.clone();
        }
        envelope
    }

    fn reject_all(&self, error: impl Fn() -> IpcError) {
        let drained: Vec<(String, Pending)> = self.pending.lock().drain().collect();
        for (id, pending) in drained {
            debug!(request_id = %id, command = %pending.command, "Rejecting pending request");
            let _ = pending.tx.send(Err(error()));
        }
    }

    /// Connect, handshake, then install the session if still wanted
    async fn establish(inner: &Arc<ClientInner>, generation: u64) -> IpcResult<()> {
        let connection = inner.transport.connect().await?;
        let (handle, mut events) = connection.into_parts();

        let hello = inner.stamp(Envelope::handshake(HandshakeRequest {
            auth_token: inner.auth_token.clone(),
            ..HandshakeRequest::for_current_process(
                inner.config.process_name.clone(),
                inner.config.capabilities.clone(),
            )
        }));
        handle.send(&hello)?;

        let ack = tokio::time::timeout(
            inner.config.handshake_timeout,
            await_acknowledge(&mut events, &hello.id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(IpcError::Timeout(format!(
                "no handshake acknowledgement within {}ms",
                inner.config.handshake_timeout.as_millis()
            )))
        });

        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                handle.close().await;
                return Err(e);
            }
        };

        let mut state = inner.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
            drop(state);
            handle.request_close();
            return Err(IpcError::ConnectionFailed(
                "connect superseded by disconnect".to_string(),
            ));
        }

        tokio::spawn(pump(Arc::downgrade(inner), handle.clone(), events));
        let heartbeat = inner
            .config
            .heartbeat_interval
            .map(|interval| tokio::spawn(heartbeat_loop(handle.clone(), interval)));

        let connection_id = handle.id().to_string();
        state.phase = Phase::Connected(Session { handle, heartbeat });
        state.attempts = 0;
        inner.emit(ClientEvent::Connected {
            connection_id: connection_id.clone(),
        });
        drop(state);

        info!(
            connection_id = %connection_id,
            server_version = ?ack.as_ref().map(|ack| ack.server_version.as_str()),
            "IPC client connected"
        );
        Ok(())
    }

    /// Route one inbound envelope
    fn route(&self, envelope: Envelope) {
        match &envelope.message {
            Message::CommandResponse { in_reply_to, .. }
            | Message::Acknowledge {
                in_reply_to: Some(in_reply_to),
                ..
            } => {
                let id = in_reply_to.clone();
                match self.pending.lock().remove(&id) {
                    Some(pending) => {
                        let _ = pending.tx.send(Ok(envelope));
                    }
                    None => debug!(request_id = %id, "Dropping reply for unknown request"),
                }
            }
            Message::Error { in_reply_to, error } => {
                let error = IpcError::from(error.clone());
                let pending = in_reply_to
                    .as_ref()
                    .and_then(|id| self.pending.lock().remove(id));
                match pending {
                    Some(pending) => {
                        let _ = pending.tx.send(Err(error));
                    }
                    None => self.emit(ClientEvent::Error(error)),
                }
            }
            // Liveness is the connection itself
            Message::Heartbeat(_) => {}
            _ => self.emit(ClientEvent::Message(envelope)),
        }
    }

    /// The active connection went away without `disconnect()`
    fn handle_lost(inner: &Arc<ClientInner>, connection_id: &str) {
        let generation = {
            let mut state = inner.state.lock();
            let is_current = matches!(
                &state.phase,
                Phase::Connected(session) if session.handle.id() == connection_id
            );
            if !is_current {
                return;
            }
            if let Phase::Connected(session) =
                std::mem::replace(&mut state.phase, Phase::Disconnected)
            {
                if let Some(heartbeat) = session.heartbeat {
                    heartbeat.abort();
                }
            }
            state.generation
        };

        warn!(connection_id = %connection_id, "IPC connection lost");
        inner.reject_all(|| IpcError::ConnectionLost("connection closed".to_string()));
        inner.emit(ClientEvent::Disconnected);
        ClientInner::schedule_reconnect(inner, generation);
    }

    fn schedule_reconnect(inner: &Arc<ClientInner>, generation: u64) {
        let mut state = inner.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Disconnected) {
            return;
        }

        let max_attempts = inner.config.reconnect_attempts;
        if max_attempts == 0 {
            return;
        }
        if state.attempts >= max_attempts {
            let attempts = state.attempts;
            drop(state);
            warn!(attempts, "Giving up on reconnection");
            inner.emit(ClientEvent::ReconnectionFailed { attempts });
            return;
        }

        let attempt = state.attempts + 1;
        let delay = inner.backoff.calculate_delay(state.attempts);
        let weak = Arc::downgrade(inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                ClientInner::attempt_reconnect(&inner, generation).await;
            }
        });

        state.phase = Phase::Reconnecting { timer };
        inner.emit(ClientEvent::Reconnecting { attempt, delay });
        drop(state);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
    }

    async fn attempt_reconnect(inner: &Arc<ClientInner>, generation: u64) {
        {
            let mut state = inner.state.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Reconnecting { .. }) {
                return;
            }
            // Leaving Reconnecting drops our own timer handle; it does not abort us
            state.phase = Phase::Connecting;
        }

        if let Err(e) = ClientInner::establish(inner, generation).await {
            let attempts = {
                let mut state = inner.state.lock();
                if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
                    return;
                }
                state.attempts += 1;
                state.phase = Phase::Disconnected;
                state.attempts
            };
            warn!(attempts, error = %e, "Reconnect attempt failed");
            ClientInner::schedule_reconnect(inner, generation);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state.get_mut().phase, Phase::Disconnected) {
            Phase::Connected(session) => {
                if let Some(heartbeat) = session.heartbeat {
                    heartbeat.abort();
                }
                session.handle.request_close();
            }
            Phase::Reconnecting { timer } => timer.abort(),
            Phase::Disconnected | Phase::Connecting => {}
        }
    }
}

/// Wait for the acknowledgement of the handshake with id `hello_id`
async fn await_acknowledge(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    hello_id: &str,
) -> IpcResult<Option<HandshakeAck>> {
    loop {
        match events.recv().await {
            Some(ConnectionEvent::Message(envelope)) => match envelope.message {
                Message::Acknowledge {
                    in_reply_to: Some(id),
                    payload,
                } if id == hello_id => return Ok(serde_json::from_value(payload).ok()),
                Message::Error { in_reply_to, error }
                    if in_reply_to.is_none() || in_reply_to.as_deref() == Some(hello_id) =>
                {
                    return Err(error.into());
                }
                _ => debug!(envelope_id = %envelope.id, "Ignoring message before handshake completed"),
            },
            Some(ConnectionEvent::Error(e)) => {
                debug!(error = %e, "Connection error during handshake");
            }
            Some(ConnectionEvent::Closed) | None => {
                return Err(IpcError::ConnectionFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// Forward connection events into the client until the connection closes
async fn pump(
    client: Weak<ClientInner>,
    handle: ConnectionHandle,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else { return };
        match event {
            ConnectionEvent::Message(envelope) => inner.route(envelope),
            ConnectionEvent::Error(error) => inner.emit(ClientEvent::Error(error)),
            ConnectionEvent::Closed => break,
        }
    }

    if let Some(inner) = client.upgrade() {
        ClientInner::handle_lost(&inner, handle.id());
    }
}

async fn heartbeat_loop(handle: ConnectionHandle, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if let Err(e) = handle.send(&Envelope::heartbeat()) {
            warn!(connection_id = %handle.id(), error = %e, "Heartbeat send failed");
            if !handle.is_connected() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::ErrorCode;
    use crate::transport::Incoming;
    use async_trait::async_trait;
    use hive_config::TransportKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport that always refuses, counting attempts
    struct RefusingTransport {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::platform_default()
        }

        async fn listen(&self) -> IpcResult<Incoming> {
            Err(IpcError::TransportError("client-only".to_string()))
        }

        async fn connect(&self) -> IpcResult<Connection> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(IpcError::ConnectionFailed("refused".to_string()))
        }

        async fn close(&self) -> IpcResult<()> {
            Ok(())
        }

        fn is_listening(&self) -> bool {
            false
        }

        fn endpoint(&self) -> String {
            "nowhere".to_string()
        }
    }

    fn refusing_client(config: ClientConfig) -> (IpcClient, Arc<RefusingTransport>) {
        let transport = Arc::new(RefusingTransport {
            attempts: AtomicU32::new(0),
        });
        (IpcClient::new(transport.clone(), config, None), transport)
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_disconnected() {
        let (client, transport) = refusing_client(ClientConfig::default());
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_and_request_require_connection() {
        let (client, _) = refusing_client(ClientConfig::default());
        assert_eq!(
            client.send(Envelope::heartbeat()).unwrap_err().code(),
            ErrorCode::ConnectionLost
        );
        let err = client.request("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionLost);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_configured_attempts() {
        let config = ClientConfig {
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (client, transport) = refusing_client(config);
        let mut events = client.take_events().unwrap();

        // Drive the state machine as if a live connection had just dropped
        let generation = client.inner.state.lock().generation;
        ClientInner::schedule_reconnect(&client.inner, generation);

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Reconnecting { delay, .. } => delays.push(delay),
                ClientEvent::ReconnectionFailed { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_reconnect_delays_stay_in_band() {
        let config = ClientConfig {
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(300),
            reconnect_jitter: true,
            ..Default::default()
        };
        let (client, _) = refusing_client(config);
        let mut events = client.take_events().unwrap();

        let generation = client.inner.state.lock().generation;
        ClientInner::schedule_reconnect(&client.inner, generation);

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Reconnecting { delay, .. } => delays.push(delay),
                ClientEvent::ReconnectionFailed { .. } => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(delays.len(), 3);
        let bases = [100u64, 200, 300];
        for (delay, base) in delays.iter().zip(bases) {
            assert!(*delay >= Duration::from_millis(base * 8 / 10), "{:?} below band", delay);
            assert!(*delay <= Duration::from_millis(300), "{:?} above ceiling", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_scheduled_reconnect() {
        let config = ClientConfig {
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let (client, transport) = refusing_client(config);
        let mut events = client.take_events().unwrap();

        let generation = client.inner.state.lock().generation;
        ClientInner::schedule_reconnect(&client.inner, generation);
        assert_eq!(client.status(), ClientStatus::Reconnecting);
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Reconnecting { attempt: 1, .. })
        ));

        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(client.status(), ClientStatus::Disconnected);
        assert!(matches!(events.recv().await, Some(ClientEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_zero_attempts_never_reconnects() {
        let config = ClientConfig {
            reconnect_attempts: 0,
            ..Default::default()
        };
        let (client, _) = refusing_client(config);
        let generation = client.inner.state.lock().generation;
        ClientInner::schedule_reconnect(&client.inner, generation);
        assert_eq!(client.status(), ClientStatus::Disconnected);
    }
}
