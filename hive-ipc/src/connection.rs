//! Bidirectional, event-emitting channel over one transport

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use hive_config::TransportKind;

use crate::codec::{decode_frame, encode_frame, EnvelopeCodec};
use crate::error::{IpcError, IpcResult};
use crate::protocol::{Envelope, RemoteInfo};

/// Events emitted by a connection, in arrival order
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// One decoded envelope
    Message(Envelope),
    /// Non-fatal fault: malformed frame, failed write
    Error(IpcError),
    /// Terminal; emitted exactly once
    Closed,
}

/// Per-connection limits shared by all transports
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_frame_size: usize,
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            event_buffer: 1024,
        }
    }
}

impl From<&hive_config::HiveConfig> for ConnectionSettings {
    fn from(config: &hive_config::HiveConfig) -> Self {
        Self {
            max_frame_size: config.transport.max_frame_size,
            event_buffer: config.server.event_buffer,
        }
    }
}

struct Shared {
    id: String,
    kind: TransportKind,
    connected: AtomicBool,
    remote_info: RwLock<Option<RemoteInfo>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
    finished: AtomicBool,
    max_frame_size: usize,
}

/// Cloneable handle used to send on and close a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.inner.remote_info.read().clone()
    }

    pub fn set_remote_info(&self, info: RemoteInfo) {
        *self.inner.remote_info.write() = Some(info);
    }

    /// Queue an envelope for delivery. Fails fast once the connection is gone.
    pub fn send(&self, envelope: &Envelope) -> IpcResult<()> {
        if !self.is_connected() {
            return Err(IpcError::ConnectionLost(format!(
                "connection {} is closed",
                self.inner.id
            )));
        }

        let line = encode_frame(envelope, self.inner.max_frame_size)?;
        self.inner.outbound.send(line).map_err(|_| {
            self.inner.connected.store(false, Ordering::Release);
            IpcError::ConnectionLost(format!("connection {} is closed", self.inner.id))
        })
    }

    /// Start closing without waiting; queued envelopes are still flushed
    pub fn request_close(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.shutdown.cancel();
    }

    /// Close gracefully and wait until the channel is torn down. Idempotent.
    pub async fn close(&self) {
        self.request_close();
        self.inner.terminated.cancelled().await;
    }

    /// Resolves once the connection has terminated, for whatever reason
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await;
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

/// A connection together with its event stream
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::Receiver<ConnectionEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.handle.remote_info()
    }

    pub fn send(&self, envelope: &Envelope) -> IpcResult<()> {
        self.handle.send(envelope)
    }

    pub async fn close(&self) {
        self.handle.close().await
    }

    /// Next event; `None` after `Closed` has been taken
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        (self.handle, self.events)
    }
}

/// Transport-side half of a connection
pub(crate) struct ConnectionSink {
    handle: ConnectionHandle,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionSink {
    pub(crate) fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Decode a frame received as a whole and emit the result
    pub(crate) async fn deliver_frame(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match decode_frame(line, self.handle.inner.max_frame_size) {
            Ok(envelope) => self.emit(ConnectionEvent::Message(envelope)).await,
            Err(e) => {
                warn!(connection_id = %self.handle.id(), error = %e, "Discarding malformed frame");
                self.emit(ConnectionEvent::Error(e)).await
            }
        }
    }

    pub(crate) async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            _ = self.handle.inner.shutdown.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    debug!(connection_id = %self.handle.id(), "Connection event dropped, no consumer");
                }
            }
        }
    }

    /// Mark the connection terminated and emit `Closed`; later calls are no-ops
    pub(crate) async fn finish(&self) {
        let shared = &self.handle.inner;
        if shared.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.connected.store(false, Ordering::Release);
        shared.shutdown.cancel();
        shared.terminated.cancel();
        debug!(connection_id = %shared.id, "Connection closed");
        let _ = self.events.send(ConnectionEvent::Closed).await;
    }
}

/// Build the two halves of a connection
pub(crate) fn new_connection(
    kind: TransportKind,
    remote_info: Option<RemoteInfo>,
    settings: ConnectionSettings,
) -> (Connection, ConnectionSink, mpsc::UnboundedReceiver<String>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));

    let handle = ConnectionHandle {
        inner: Arc::new(Shared {
            id: Uuid::new_v4().to_string(),
            kind,
            connected: AtomicBool::new(true),
            remote_info: RwLock::new(remote_info),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
            finished: AtomicBool::new(false),
            max_frame_size: settings.max_frame_size,
        }),
    };

    let connection = Connection {
        handle: handle.clone(),
        events: events_rx,
    };
    let sink = ConnectionSink {
        handle,
        events: events_tx,
    };

    (connection, sink, outbound_rx)
}

/// Drive a connection over a pair of byte streams (domain socket, named pipe)
pub(crate) fn spawn_stream<R, W>(
    reader: R,
    writer: W,
    kind: TransportKind,
    remote_info: Option<RemoteInfo>,
    settings: ConnectionSettings,
) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (connection, sink, mut outbound) = new_connection(kind, remote_info, settings);

    tokio::spawn(async move {
        let shutdown = sink.handle().shutdown_token().clone();
        let mut frames = FramedRead::new(reader, EnvelopeCodec::new(settings.max_frame_size));
        let mut lines = FramedWrite::new(writer, EnvelopeCodec::new(settings.max_frame_size));

        let read_loop = async {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(Ok(Ok(envelope))) => sink.emit(ConnectionEvent::Message(envelope)).await,
                        Some(Ok(Err(e))) => {
                            warn!(connection_id = %sink.handle().id(), error = %e, "Discarding malformed frame");
                            sink.emit(ConnectionEvent::Error(e)).await;
                        }
                        Some(Err(e)) => {
                            sink.emit(ConnectionEvent::Error(e)).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
            // Peer hung up or read failed: stop the writer too
            shutdown.cancel();
        };

        let write_loop = async {
            loop {
                tokio::select! {
                    biased;
                    line = outbound.recv() => match line {
                        Some(line) => {
                            if let Err(e) = lines.send(line).await {
                                sink.emit(ConnectionEvent::Error(e)).await;
                                shutdown.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        // Flush whatever was queued before the close request
                        while let Ok(line) = outbound.try_recv() {
                            if lines.send(line).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = lines.close().await;
        };

        tokio::join!(read_loop, write_loop);
        sink.finish().await;
    });

    connection
}
