//! Process registry fed by server `process_*` traffic

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{IpcError, IpcResult};
use crate::handler::RequestContext;
use crate::protocol::{Envelope, Message, RemoteInfo};
use crate::server::{IpcServer, ServerEvent};

/// Liveness state a process reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Starting,
    Idle,
    Busy,
    Stopping,
    Failed,
}

/// One registered process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: ProcessStatus,
    /// Connection the registration arrived on
    pub connection_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Body of `process_register` / `process.register`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RegisterPayload {
    id: Option<String>,
    pid: Option<u32>,
    name: Option<String>,
    capabilities: Option<Vec<String>>,
    status: Option<ProcessStatus>,
}

/// Body of the other process messages
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProcessRef {
    id: Option<String>,
    status: Option<ProcessStatus>,
}

fn parse<T: serde::de::DeserializeOwned + Default>(payload: &Value) -> IpcResult<T> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload.clone())
        .map_err(|e| IpcError::ProtocolError(format!("invalid process payload: {}", e)))
}

/// Tracks processes connected to a server.
///
/// Records are keyed by the id the process supplies, falling back to its
/// connection id. Every record of a connection goes when the connection does.
#[derive(Clone)]
pub struct ProcessRegistry {
    records: Arc<RwLock<HashMap<String, ProcessRecord>>>,
    stale_after: Duration,
}

impl ProcessRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            stale_after,
        }
    }

    /// Register the `process.*` command handlers on `server`.
    ///
    /// `IpcServer::stop` drops user handlers; attach again after a restart.
    pub fn attach(&self, server: &IpcServer) {
        let registry = self.clone();
        server.register_fn("process.register", move |payload, ctx: RequestContext| {
            let registry = registry.clone();
            async move {
                let record = registry.register(&ctx, &payload)?;
                Ok(serde_json::to_value(record)?)
            }
        });

        let registry = self.clone();
        server.register_fn("process.unregister", move |payload, ctx: RequestContext| {
            let registry = registry.clone();
            async move {
                let id = registry.resolve_id(&payload, ctx.connection_id())?;
                Ok(json!({ "removed": registry.unregister(&id).is_some() }))
            }
        });

        let registry = self.clone();
        server.register_fn("process.query", move |payload, _ctx: RequestContext| {
            let registry = registry.clone();
            async move {
                let query: ProcessRef = parse(&payload)?;
                match query.id {
                    Some(id) => Ok(serde_json::to_value(registry.get(&id))?),
                    None => Ok(serde_json::to_value(registry.list())?),
                }
            }
        });

        let registry = self.clone();
        server.register_fn("process.heartbeat", move |payload, ctx: RequestContext| {
            let registry = registry.clone();
            async move {
                let body: ProcessRef = parse(&payload)?;
                let id = registry.resolve_id(&payload, ctx.connection_id())?;
                if !registry.heartbeat(&id, body.status) {
                    return Err(IpcError::ProtocolError(format!(
                        "process '{}' is not registered",
                        id
                    )));
                }
                Ok(json!({ "id": id, "acknowledged": true }))
            }
        });
    }

    /// Consume server events until the channel closes
    pub async fn run(&self, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(&event);
        }
        debug!("Process registry event stream ended");
    }

    /// Apply one server event; events unrelated to processes are ignored
    pub fn handle_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::ProcessMessage {
                connection_id,
                envelope,
            } => {
                if let Err(e) = self.apply_message(connection_id, envelope) {
                    warn!(connection_id = %connection_id, error = %e, "Rejected process message");
                }
            }
            ServerEvent::Disconnection { connection_id } => {
                let removed = self.remove_connection(connection_id);
                if removed > 0 {
                    info!(connection_id = %connection_id, removed, "Unregistered processes of closed connection");
                }
            }
            _ => {}
        }
    }

    fn apply_message(&self, connection_id: &str, envelope: &Envelope) -> IpcResult<()> {
        match &envelope.message {
            Message::ProcessRegister(payload) => {
                let body: RegisterPayload = parse(payload)?;
                self.insert(connection_id, body, None);
            }
            Message::ProcessUnregister(payload) => {
                let id = self.resolve_id(payload, connection_id)?;
                self.unregister(&id);
            }
            Message::ProcessStatus(payload) | Message::ProcessHeartbeat(payload) => {
                let body: ProcessRef = parse(payload)?;
                let id = body.id.unwrap_or_else(|| connection_id.to_string());
                if !self.heartbeat(&id, body.status) {
                    debug!(process_id = %id, "Status for unknown process");
                }
            }
            other => {
                return Err(IpcError::ProtocolError(format!(
                    "not a process message: {}",
                    other.message_type()
                )))
            }
        }
        Ok(())
    }

    fn resolve_id(&self, payload: &Value, connection_id: &str) -> IpcResult<String> {
        let body: ProcessRef = parse(payload)?;
        Ok(body.id.unwrap_or_else(|| connection_id.to_string()))
    }

    fn register(&self, ctx: &RequestContext, payload: &Value) -> IpcResult<ProcessRecord> {
        let body: RegisterPayload = parse(payload)?;
        Ok(self.insert(ctx.connection_id(), body, ctx.connection.remote_info()))
    }

    fn insert(
        &self,
        connection_id: &str,
        body: RegisterPayload,
        remote: Option<RemoteInfo>,
    ) -> ProcessRecord {
        let now = Utc::now();
        let remote = remote.unwrap_or_default();
        let record = ProcessRecord {
            id: body.id.unwrap_or_else(|| connection_id.to_string()),
            pid: body.pid.or(remote.pid),
            name: body.name.or(remote.process_name),
            capabilities: body.capabilities.unwrap_or(remote.capabilities),
            status: body.status.unwrap_or_default(),
            connection_id: connection_id.to_string(),
            registered_at: now,
            last_heartbeat: now,
        };
        info!(process_id = %record.id, name = ?record.name, "Process registered");
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        record
    }

    pub fn unregister(&self, id: &str) -> Option<ProcessRecord> {
        let removed = self.records.write().remove(id);
        if removed.is_some() {
            info!(process_id = %id, "Process unregistered");
        }
        removed
    }

    /// Refresh the heartbeat and optionally the status; false if unknown
    pub fn heartbeat(&self, id: &str, status: Option<ProcessStatus>) -> bool {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                if let Some(status) = status {
                    record.status = status;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.records.read().get(id).cloned()
    }

    /// All records, ordered by id
    pub fn list(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn remove_connection(&self, connection_id: &str) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.connection_id != connection_id);
        before - records.len()
    }

    /// Drop records whose last heartbeat is older than the staleness window
    pub fn prune_stale(&self) -> Vec<String> {
        self.prune_stale_at(Utc::now())
    }

    pub fn prune_stale_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let window = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        let mut records = self.records.write();
        let stale: Vec<String> = records
            .values()
            .filter(|record| now.signed_duration_since(record.last_heartbeat) > window)
            .map(|record| record.id.clone())
            .collect();
        for id in &stale {
            records.remove(id);
            warn!(process_id = %id, "Pruned stale process");
        }
        stale
    }
}
