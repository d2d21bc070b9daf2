//! HTTP fallback transport.
//!
//! Full duplex over plain HTTP/1.1: the server pushes envelopes down a
//! Server-Sent Events stream (`GET /ipc/stream`) and the client posts its
//! envelopes to `POST /ipc/messages/{session}`. `DELETE /ipc/sessions/{session}`
//! closes the session from the client side.

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_config::TransportKind;

use super::{Incoming, Transport, ACCEPT_BACKLOG};
use crate::connection::{new_connection, Connection, ConnectionEvent, ConnectionSettings, ConnectionSink};
use crate::error::{ErrorCode, IpcError, IpcResult};

/// Response header carrying the session id of a new stream
pub const SESSION_HEADER: &str = "x-hive-session";

const STREAM_PATH: &str = "/ipc/stream";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Sessions = Arc<Mutex<HashMap<String, Arc<ConnectionSink>>>>;

#[derive(Clone)]
struct HttpState {
    sessions: Sessions,
    accept: mpsc::Sender<Connection>,
    settings: ConnectionSettings,
}

struct Running {
    shutdown: CancellationToken,
    server_task: JoinHandle<()>,
    sessions: Sessions,
    local_addr: SocketAddr,
}

/// SSE + POST duplex transport
pub struct HttpTransport {
    address: String,
    settings: ConnectionSettings,
    running: Mutex<Option<Running>>,
}

impl HttpTransport {
    pub fn new(address: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            address: address.into(),
            settings,
            running: Mutex::new(None),
        }
    }

    /// Address actually bound, once listening. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    fn router(state: HttpState) -> Router {
        let body_limit = state.settings.max_frame_size;
        Router::new()
            .route(STREAM_PATH, get(open_stream))
            .route("/ipc/messages/{session}", post(post_message))
            .route("/ipc/sessions/{session}", delete(close_session))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(state)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn listen(&self) -> IpcResult<Incoming> {
        if self.is_listening() {
            return Err(IpcError::TransportError(format!(
                "already listening on {}",
                self.address
            )));
        }

        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            IpcError::TransportError(format!("failed to bind {}: {}", self.address, e))
        })?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
        let router = Self::router(HttpState {
            sessions: sessions.clone(),
            accept: tx,
            settings: self.settings,
        });

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP transport server failed");
            }
        });

        info!(address = %local_addr, "Listening on HTTP transport");
        *self.running.lock() = Some(Running {
            shutdown,
            server_task,
            sessions,
            local_addr,
        });
        Ok(rx)
    }

    async fn connect(&self) -> IpcResult<Connection> {
        let base = format!("http://{}", self.address);
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

        let response = client
            .get(format!("{}{}", base, STREAM_PATH))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| IpcError::ConnectionFailed(format!("{}: {}", base, e)))?;

        if !response.status().is_success() {
            return Err(IpcError::ConnectionFailed(format!(
                "{} answered {}",
                base,
                response.status()
            )));
        }

        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                IpcError::ConnectionFailed(format!("{} did not assign a session", base))
            })?;

        let (connection, sink, outbound) = new_connection(TransportKind::Http, None, self.settings);
        debug!(connection_id = %connection.id(), session = %session, "Opened HTTP session");
        tokio::spawn(drive_client(client, base, session, response, sink, outbound));
        Ok(connection)
    }

    async fn close(&self) -> IpcResult<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        // Open event streams would hold the graceful shutdown forever
        let open: Vec<_> = running.sessions.lock().values().cloned().collect();
        for sink in open {
            sink.handle().request_close();
        }
        running.shutdown.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, running.server_task)
            .await
            .is_err()
        {
            warn!(address = %running.local_addr, "HTTP transport did not shut down in time");
        }
        info!(address = %running.local_addr, "Closed HTTP transport");
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    fn endpoint(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("http://{}", addr),
            None => format!("http://{}", self.address),
        }
    }
}

/// Removes the session and emits `Closed` when the event stream is dropped
struct SessionGuard {
    sessions: Sessions,
    session_id: String,
    sink: Arc<ConnectionSink>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.session_id);
        self.sink.handle().request_close();
        let sink = self.sink.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { sink.finish().await });
        }
    }
}

async fn open_stream(State(state): State<HttpState>) -> Response {
    let (connection, sink, mut outbound) = new_connection(TransportKind::Http, None, state.settings);
    let session_id = connection.id().to_string();
    let sink = Arc::new(sink);
    state
        .sessions
        .lock()
        .insert(session_id.clone(), sink.clone());

    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        session_id: session_id.clone(),
        sink: sink.clone(),
    };

    if state.accept.send(connection).await.is_err() {
        drop(guard);
        return (StatusCode::SERVICE_UNAVAILABLE, "IPC server is not accepting connections")
            .into_response();
    }
    debug!(session = %session_id, "Accepted HTTP session");

    let shutdown = sink.handle().shutdown_token().clone();
    let stream = async_stream::stream! {
        let _guard = guard;
        // Gets the response head out before the first envelope
        yield Ok::<Event, Infallible>(Event::default().comment("connected"));

        loop {
            let next = tokio::select! {
                biased;
                line = outbound.recv() => line,
                _ = shutdown.cancelled() => None,
            };
            match next {
                Some(line) => yield Ok(Event::default().data(line)),
                None => break,
            }
        }

        while let Ok(line) = outbound.try_recv() {
            yield Ok(Event::default().data(line));
        }
    };

    let keep_alive = KeepAlive::new()
        .interval(KEEP_ALIVE_INTERVAL)
        .text("keep-alive");

    (
        [(HeaderName::from_static(SESSION_HEADER), session_id)],
        Sse::new(stream).keep_alive(keep_alive),
    )
        .into_response()
}

async fn post_message(
    State(state): State<HttpState>,
    Path(session): Path<String>,
    body: String,
) -> StatusCode {
    let sink = state.sessions.lock().get(&session).cloned();
    match sink {
        Some(sink) => {
            sink.deliver_frame(&body).await;
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn close_session(State(state): State<HttpState>, Path(session): Path<String>) -> StatusCode {
    let sink = state.sessions.lock().get(&session).cloned();
    match sink {
        Some(sink) => {
            sink.handle().request_close();
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Client side: read the event stream, post queued frames in order
async fn drive_client(
    client: reqwest::Client,
    base: String,
    session: String,
    response: reqwest::Response,
    sink: ConnectionSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let shutdown = sink.handle().shutdown_token().clone();
    let message_url = format!("{}/ipc/messages/{}", base, session);

    let read_loop = async {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::default();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => break,
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.feed(&bytes) {
                        sink.deliver_frame(&frame).await;
                    }
                }
                Some(Err(e)) => {
                    sink.emit(ConnectionEvent::Error(IpcError::TransportError(e.to_string())))
                        .await;
                    break;
                }
                None => break,
            }
        }
        shutdown.cancel();
    };

    let write_loop = async {
        loop {
            let line = tokio::select! {
                biased;
                line = outbound.recv() => line,
                _ = shutdown.cancelled() => None,
            };
            let Some(line) = line else { break };

            if let Err(e) = post_frame(&client, &message_url, line).await {
                let lost = e.code() == ErrorCode::ConnectionLost;
                sink.emit(ConnectionEvent::Error(e)).await;
                if lost {
                    shutdown.cancel();
                    break;
                }
            }
        }

        while let Ok(line) = outbound.try_recv() {
            if post_frame(&client, &message_url, line).await.is_err() {
                break;
            }
        }

        let _ = client
            .delete(format!("{}/ipc/sessions/{}", base, session))
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await;
    };

    tokio::join!(read_loop, write_loop);
    sink.finish().await;
}

async fn post_frame(client: &reqwest::Client, url: &str, line: String) -> IpcResult<()> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(line)
        .send()
        .await
        .map_err(|e| IpcError::TransportError(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(IpcError::ConnectionLost("HTTP session no longer exists".to_string()))
    } else if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
        Err(IpcError::MessageTooLarge("frame rejected by HTTP server".to_string()))
    } else {
        Err(IpcError::TransportError(format!("server answered {}", status)))
    }
}

/// Incremental `text/event-stream` parser yielding the data of each event
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments, event names and ids are ignored
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;

    #[test]
    fn test_sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b": connected\n\nda").is_empty());
        assert!(parser.feed(b"ta: {\"a\":1}\n").is_empty());
        assert_eq!(parser.feed(b"\n: keep-alive\n\n"), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn test_sse_parser_joins_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"data: one\r\ndata: two\r\n\r\ndata:three\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string(), "three".to_string()]);
    }

    async fn expect_message(connection: &mut Connection) -> Envelope {
        match connection.next_event().await {
            Some(ConnectionEvent::Message(envelope)) => envelope,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplex_exchange() {
        let server = HttpTransport::new("127.0.0.1:0", ConnectionSettings::default());
        let mut incoming = server.listen().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = HttpTransport::new(addr.to_string(), ConnectionSettings::default());
        let mut client_side = client.connect().await.unwrap();
        let mut server_side = incoming.recv().await.unwrap();

        let up = Envelope::request("ping", json!({}));
        client_side.send(&up).unwrap();
        assert_eq!(expect_message(&mut server_side).await.id, up.id);

        // Unsolicited server push
        let down = Envelope::event(Some("tick".to_string()), json!(1));
        server_side.send(&down).unwrap();
        assert_eq!(expect_message(&mut client_side).await.id, down.id);

        client_side.close().await;
        assert!(matches!(server_side.next_event().await, Some(ConnectionEvent::Closed)));

        server.close().await.unwrap();
        server.close().await.unwrap();
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_server_close_ends_client_session() {
        let server = HttpTransport::new("127.0.0.1:0", ConnectionSettings::default());
        let mut incoming = server.listen().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = HttpTransport::new(addr.to_string(), ConnectionSettings::default());
        let mut client_side = client.connect().await.unwrap();
        let _server_side = incoming.recv().await.unwrap();

        server.close().await.unwrap();
        loop {
            match client_side.next_event().await {
                Some(ConnectionEvent::Closed) | None => break,
                Some(_) => continue,
            }
        }
        assert!(!client_side.is_connected());
    }

    #[tokio::test]
    async fn test_connect_without_server_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpTransport::new(addr.to_string(), ConnectionSettings::default());
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }
}
