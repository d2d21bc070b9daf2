//! Domain socket transport

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_config::TransportKind;

use super::{Incoming, Transport, ACCEPT_BACKLOG};
use crate::connection::{spawn_stream, Connection, ConnectionSettings};
use crate::error::{IpcError, IpcResult};
use crate::protocol::RemoteInfo;

struct Listening {
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Unix domain socket transport
pub struct UnixSocketTransport {
    path: PathBuf,
    settings: ConnectionSettings,
    listening: Mutex<Option<Listening>>,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>, settings: ConnectionSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            listening: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a socket file left behind by a dead server
    async fn clear_stale_socket(&self) -> IpcResult<()> {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return Ok(());
        }

        if UnixStream::connect(&self.path).await.is_ok() {
            return Err(IpcError::TransportError(format!(
                "socket {} is already in use",
                self.path.display()
            )));
        }

        debug!(path = %self.path.display(), "Removing stale socket file");
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }

    fn wrap(&self, stream: UnixStream) -> Connection {
        let remote = peer_info(&stream);
        let (reader, writer) = stream.into_split();
        spawn_stream(reader, writer, TransportKind::UnixSocket, remote, self.settings)
    }
}

fn peer_info(stream: &UnixStream) -> Option<RemoteInfo> {
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok())?;
    Some(RemoteInfo {
        pid: Some(pid),
        ..Default::default()
    })
}

#[async_trait]
impl Transport for UnixSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::UnixSocket
    }

    async fn listen(&self) -> IpcResult<Incoming> {
        if self.is_listening() {
            return Err(IpcError::TransportError(format!(
                "already listening on {}",
                self.path.display()
            )));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.clear_stale_socket().await?;

        let listener = UnixListener::bind(&self.path).map_err(|e| {
            IpcError::TransportError(format!("failed to bind {}: {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), "Listening on domain socket");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let settings = self.settings;

        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, _)) => {
                        let remote = peer_info(&stream);
                        let (reader, writer) = stream.into_split();
                        let connection =
                            spawn_stream(reader, writer, TransportKind::UnixSocket, remote, settings);
                        debug!(connection_id = %connection.id(), "Accepted domain socket peer");
                        if tx.send(connection).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to accept domain socket peer"),
                }
            }
        });

        *self.listening.lock() = Some(Listening {
            shutdown,
            accept_task,
        });
        Ok(rx)
    }

    async fn connect(&self) -> IpcResult<Connection> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            IpcError::ConnectionFailed(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(self.wrap(stream))
    }

    async fn close(&self) -> IpcResult<()> {
        let listening = self.listening.lock().take();
        let Some(listening) = listening else {
            return Ok(());
        };

        listening.shutdown.cancel();
        let _ = listening.accept_task.await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path.display(), "Closed domain socket");
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}
