//! Named pipe transport

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_config::TransportKind;

use super::{Incoming, Transport, ACCEPT_BACKLOG};
use crate::connection::{spawn_stream, Connection, ConnectionSettings};
use crate::error::{IpcError, IpcResult};

/// All pipe instances are busy
const ERROR_PIPE_BUSY: i32 = 231;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
const BUSY_RETRY_LIMIT: u32 = 100;

struct Listening {
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Windows named pipe transport
pub struct NamedPipeTransport {
    name: String,
    settings: ConnectionSettings,
    listening: Mutex<Option<Listening>>,
}

impl NamedPipeTransport {
    pub fn new(name: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            listening: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for NamedPipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NamedPipe
    }

    async fn listen(&self) -> IpcResult<Incoming> {
        if self.is_listening() {
            return Err(IpcError::TransportError(format!(
                "already listening on {}",
                self.name
            )));
        }

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.name)
            .map_err(|e| {
                IpcError::TransportError(format!("failed to create pipe {}: {}", self.name, e))
            })?;
        info!(pipe = %self.name, "Listening on named pipe");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let name = self.name.clone();
        let settings = self.settings;

        let accept_task = tokio::spawn(async move {
            loop {
                let connected = tokio::select! {
                    _ = token.cancelled() => break,
                    connected = server.connect() => connected,
                };

                if let Err(e) = connected {
                    warn!(pipe = %name, error = %e, "Failed to accept pipe client");
                    continue;
                }

                // Replace the instance before handing the connected one off
                let next = match ServerOptions::new().create(&name) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(pipe = %name, error = %e, "Failed to create next pipe instance");
                        break;
                    }
                };
                let pipe = std::mem::replace(&mut server, next);
                let (reader, writer) = tokio::io::split(pipe);
                let connection =
                    spawn_stream(reader, writer, TransportKind::NamedPipe, None, settings);
                debug!(connection_id = %connection.id(), "Accepted pipe client");
                if tx.send(connection).await.is_err() {
                    break;
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
        let mut attempts = 0;
        let client = loop {
            match ClientOptions::new().open(&self.name) {
                Ok(client) => break client,
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < BUSY_RETRY_LIMIT => {
                    attempts += 1;
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(IpcError::ConnectionFailed(format!("{}: {}", self.name, e)));
                }
            }
        };

        let (reader, writer) = tokio::io::split(client);
        Ok(spawn_stream(
            reader,
            writer,
            TransportKind::NamedPipe,
            None,
            self.settings,
        ))
    }

    async fn close(&self) -> IpcResult<()> {
        let listening = self.listening.lock().take();
        if let Some(listening) = listening {
            listening.shutdown.cancel();
            let _ = listening.accept_task.await;
            info!(pipe = %self.name, "Closed named pipe");
        }
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    fn endpoint(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use crate::protocol::Envelope;
    use serde_json::json;

    fn unique_name() -> String {
        format!(r"\\.\pipe\hive-test-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_listen_connect_exchange() {
        let transport = NamedPipeTransport::new(unique_name(), ConnectionSettings::default());
        let mut incoming = transport.listen().await.unwrap();

        let client = transport.connect().await.unwrap();
        let mut server_side = incoming.recv().await.unwrap();

        let envelope = Envelope::request("ping", json!({}));
        client.send(&envelope).unwrap();
        match server_side.next_event().await {
            Some(ConnectionEvent::Message(received)) => assert_eq!(received.id, envelope.id),
            other => panic!("unexpected event: {:?}", other),
        }

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_instance_is_exclusive() {
        let name = unique_name();
        let first = NamedPipeTransport::new(name.clone(), ConnectionSettings::default());
        let _incoming = first.listen().await.unwrap();

        let second = NamedPipeTransport::new(name, ConnectionSettings::default());
        assert!(second.listen().await.is_err());
        first.close().await.unwrap();
    }
}
