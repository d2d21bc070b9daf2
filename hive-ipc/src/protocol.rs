//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{ErrorCode, IpcError, IpcResult};

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Reserved header correlating a reply with its originating request id
pub const IN_REPLY_TO: &str = "in-reply-to";

/// Closed set of envelope types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    Acknowledge,
    Error,
    CommandRequest,
    CommandResponse,
    CommandEvent,
    ProcessRegister,
    ProcessUnregister,
    ProcessStatus,
    ProcessHeartbeat,
    DataChunk,
    DataComplete,
    DataError,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Acknowledge => "acknowledge",
            MessageType::Error => "error",
            MessageType::CommandRequest => "command_request",
            MessageType::CommandResponse => "command_response",
            MessageType::CommandEvent => "command_event",
            MessageType::ProcessRegister => "process_register",
            MessageType::ProcessUnregister => "process_unregister",
            MessageType::ProcessStatus => "process_status",
            MessageType::ProcessHeartbeat => "process_heartbeat",
            MessageType::DataChunk => "data_chunk",
            MessageType::DataComplete => "data_complete",
            MessageType::DataError => "data_error",
        }
    }

    /// Types the server hands to a process registry
    pub fn is_process(&self) -> bool {
        matches!(
            self,
            MessageType::ProcessRegister
                | MessageType::ProcessUnregister
                | MessageType::ProcessStatus
                | MessageType::ProcessHeartbeat
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body carried by `error` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&IpcError> for ErrorPayload {
    fn from(err: &IpcError) -> Self {
        Self {
            code: err.code(),
            message: err.detail(),
        }
    }
}

impl From<ErrorPayload> for IpcError {
    fn from(payload: ErrorPayload) -> Self {
        IpcError::from_wire(payload.code, payload.message)
    }
}

/// Typed message body. Each variant carries only what its type requires.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeRequest),
    Heartbeat(Value),
    Acknowledge {
        in_reply_to: Option<String>,
        payload: Value,
    },
    Error {
        in_reply_to: Option<String>,
        error: ErrorPayload,
    },
    CommandRequest {
        command: String,
        payload: Value,
    },
    CommandResponse {
        in_reply_to: String,
        payload: Value,
    },
    CommandEvent {
        command: Option<String>,
        payload: Value,
    },
    ProcessRegister(Value),
    ProcessUnregister(Value),
    ProcessStatus(Value),
    ProcessHeartbeat(Value),
    DataChunk(Value),
    DataComplete(Value),
    DataError(Value),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::Acknowledge { .. } => MessageType::Acknowledge,
            Message::Error { .. } => MessageType::Error,
            Message::CommandRequest { .. } => MessageType::CommandRequest,
            Message::CommandResponse { .. } => MessageType::CommandResponse,
            Message::CommandEvent { .. } => MessageType::CommandEvent,
            Message::ProcessRegister(_) => MessageType::ProcessRegister,
            Message::ProcessUnregister(_) => MessageType::ProcessUnregister,
            Message::ProcessStatus(_) => MessageType::ProcessStatus,
            Message::ProcessHeartbeat(_) => MessageType::ProcessHeartbeat,
            Message::DataChunk(_) => MessageType::DataChunk,
            Message::DataComplete(_) => MessageType::DataComplete,
            Message::DataError(_) => MessageType::DataError,
        }
    }
}

/// First message a client sends on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_protocol_version() -> u32 {
    IPC_PROTOCOL_VERSION
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            pid: None,
            process_name: None,
            capabilities: Vec::new(),
            auth_token: None,
        }
    }
}

impl HandshakeRequest {
    /// Handshake describing the current process; the name falls back to the executable's
    pub fn for_current_process(process_name: Option<String>, capabilities: Vec<String>) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            pid: Some(std::process::id()),
            process_name: process_name.or_else(current_exe_name),
            capabilities,
            auth_token: None,
        }
    }
}

/// File stem of the running executable
pub fn current_exe_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

/// Payload of the acknowledgement answering a handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub connection_id: String,
    pub server_version: String,
}

/// What is known about the process on the other end of a connection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl RemoteInfo {
    /// Merge a handshake over transport-level facts; the OS pid wins
    pub fn merge_handshake(existing: Option<&RemoteInfo>, handshake: &HandshakeRequest) -> Self {
        Self {
            pid: existing.and_then(|info| info.pid).or(handshake.pid),
            process_name: handshake.process_name.clone(),
            capabilities: handshake.capabilities.clone(),
        }
    }
}

/// The unit exchanged over a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub target: Option<String>,
    /// Free-form headers; `in-reply-to` lives in the typed message instead
    pub headers: BTreeMap<String, String>,
    pub message: Message,
}

impl Envelope {
    /// Create a new envelope with a fresh id
    pub fn new(message: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: None,
            target: None,
            headers: BTreeMap::new(),
            message,
        }
    }

    pub fn request(command: impl Into<String>, payload: Value) -> Self {
        Self::new(Message::CommandRequest {
            command: command.into(),
            payload,
        })
    }

    pub fn response(in_reply_to: impl Into<String>, payload: Value) -> Self {
        Self::new(Message::CommandResponse {
            in_reply_to: in_reply_to.into(),
            payload,
        })
    }

    pub fn event(command: Option<String>, payload: Value) -> Self {
        Self::new(Message::CommandEvent { command, payload })
    }

    pub fn error(in_reply_to: Option<String>, err: &IpcError) -> Self {
        Self::new(Message::Error {
            in_reply_to,
            error: ErrorPayload::from(err),
        })
    }

    pub fn heartbeat() -> Self {
        Self::new(Message::Heartbeat(Value::Null))
    }

    pub fn handshake(request: HandshakeRequest) -> Self {
        Self::new(Message::Handshake(request))
    }

    pub fn acknowledge(in_reply_to: impl Into<String>, payload: Value) -> Self {
        Self::new(Message::Acknowledge {
            in_reply_to: Some(in_reply_to.into()),
            payload,
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    pub fn command(&self) -> Option<&str> {
        match &self.message {
            Message::CommandRequest { command, .. } => Some(command),
            Message::CommandEvent { command, .. } => command.as_deref(),
            _ => None,
        }
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        match &self.message {
            Message::CommandResponse { in_reply_to, .. } => Some(in_reply_to),
            Message::Acknowledge { in_reply_to, .. } | Message::Error { in_reply_to, .. } => {
                in_reply_to.as_deref()
            }
            _ => None,
        }
    }

    /// Untyped payload view, as it appears on the wire
    pub fn payload(&self) -> Value {
        WireEnvelope::from(self.clone()).payload
    }

    /// Serialize to a single-line JSON frame
    pub fn to_json(&self) -> IpcResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a single JSON frame
    pub fn from_json(text: &str) -> IpcResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialized size in bytes
    pub fn encoded_len(&self) -> IpcResult<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// Flat wire representation
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.message.message_type();
        let mut headers = envelope.headers;
        let mut command = None;

        let payload = match envelope.message {
            Message::Handshake(request) => serde_json::to_value(request).unwrap_or(Value::Null),
            Message::Acknowledge {
                in_reply_to,
                payload,
            } => {
                if let Some(id) = in_reply_to {
                    headers.insert(IN_REPLY_TO.to_string(), id);
                }
                payload
            }
            Message::Error { in_reply_to, error } => {
                if let Some(id) = in_reply_to {
                    headers.insert(IN_REPLY_TO.to_string(), id);
                }
                serde_json::to_value(error).unwrap_or(Value::Null)
            }
            Message::CommandRequest {
                command: name,
                payload,
            } => {
                command = Some(name);
                payload
            }
            Message::CommandResponse {
                in_reply_to,
                payload,
            } => {
                headers.insert(IN_REPLY_TO.to_string(), in_reply_to);
                payload
            }
            Message::CommandEvent {
                command: name,
                payload,
            } => {
                command = name;
                payload
            }
            Message::Heartbeat(payload)
            | Message::ProcessRegister(payload)
            | Message::ProcessUnregister(payload)
            | Message::ProcessStatus(payload)
            | Message::ProcessHeartbeat(payload)
            | Message::DataChunk(payload)
            | Message::DataComplete(payload)
            | Message::DataError(payload) => payload,
        };

        Self {
            id: envelope.id,
            kind,
            command,
            payload,
            timestamp: envelope.timestamp,
            source: envelope.source,
            target: envelope.target,
            headers,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = IpcError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let mut headers = wire.headers;
        let in_reply_to = headers.remove(IN_REPLY_TO);
        let payload = wire.payload;

        let message = match wire.kind {
            MessageType::Handshake => Message::Handshake(if payload.is_null() {
                HandshakeRequest::default()
            } else {
                serde_json::from_value(payload)?
            }),
            MessageType::Heartbeat => Message::Heartbeat(payload),
            MessageType::Acknowledge => Message::Acknowledge {
                in_reply_to,
                payload,
            },
            MessageType::Error => Message::Error {
                in_reply_to,
                error: serde_json::from_value(payload).map_err(|e| {
                    IpcError::ProtocolError(format!("invalid error payload: {}", e))
                })?,
            },
            MessageType::CommandRequest => Message::CommandRequest {
                command: wire.command.ok_or_else(|| {
                    IpcError::ProtocolError(format!(
                        "command_request '{}' is missing a command",
                        wire.id
                    ))
                })?,
                payload,
            },
            MessageType::CommandResponse => Message::CommandResponse {
                in_reply_to: in_reply_to.ok_or_else(|| {
                    IpcError::ProtocolError(format!(
                        "command_response '{}' is missing the {} header",
                        wire.id, IN_REPLY_TO
                    ))
                })?,
                payload,
            },
            MessageType::CommandEvent => Message::CommandEvent {
                command: wire.command,
                payload,
            },
            MessageType::ProcessRegister => Message::ProcessRegister(payload),
            MessageType::ProcessUnregister => Message::ProcessUnregister(payload),
            MessageType::ProcessStatus => Message::ProcessStatus(payload),
            MessageType::ProcessHeartbeat => Message::ProcessHeartbeat(payload),
            MessageType::DataChunk => Message::DataChunk(payload),
            MessageType::DataComplete => Message::DataComplete(payload),
            MessageType::DataError => Message::DataError(payload),
        };

        Ok(Envelope {
            id: wire.id,
            timestamp: wire.timestamp,
            source: wire.source,
            target: wire.target,
            headers,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let envelope = Envelope::request("greet", json!({"name": "World"})).with_source("agent-1");
        let wire: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["type"], "command_request");
        assert_eq!(wire["command"], "greet");
        assert_eq!(wire["payload"]["name"], "World");
        assert_eq!(wire["source"], "agent-1");
        assert!(wire.get("target").is_none());
        assert!(wire.get("headers").is_none());
    }

    #[test]
    fn test_response_carries_in_reply_to_header() {
        let request = Envelope::request("echo", json!(1));
        let response = Envelope::response(&request.id, json!(1));
        let wire: Value = serde_json::to_value(&response).unwrap();

        assert_eq!(wire["type"], "command_response");
        assert_eq!(wire["headers"][IN_REPLY_TO], request.id.as_str());

        let parsed = Envelope::from_json(&response.to_json().unwrap()).unwrap();
        assert_eq!(parsed.in_reply_to(), Some(request.id.as_str()));
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_request_without_command_is_protocol_error() {
        let text = r#"{"id":"1","type":"command_request","timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = Envelope::from_json(text).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_response_without_header_is_protocol_error() {
        let text = r#"{"id":"1","type":"command_response","payload":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let err = Envelope::from_json(text).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let text = r#"{"id":"1","type":"teleport","timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(Envelope::from_json(text).is_err());
    }

    #[test]
    fn test_error_envelope() {
        let err = IpcError::too_large(20, 10);
        let envelope = Envelope::error(Some("req-1".to_string()), &err);
        let wire: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["type"], "error");
        assert_eq!(wire["payload"]["code"], "MESSAGE_TOO_LARGE");
        assert_eq!(wire["headers"][IN_REPLY_TO], "req-1");

        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        match parsed.message {
            Message::Error { in_reply_to, error } => {
                assert_eq!(in_reply_to.as_deref(), Some("req-1"));
                assert_eq!(IpcError::from(error).code(), ErrorCode::MessageTooLarge);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_custom_headers_survive() {
        let envelope = Envelope::event(Some("progress".to_string()), json!({"pct": 50}))
            .with_header("trace-id", "abc")
            .with_target("orchestrator");
        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(parsed.headers.get("trace-id").map(String::as_str), Some("abc"));
        assert_eq!(parsed.target.as_deref(), Some("orchestrator"));
        assert_eq!(parsed.command(), Some("progress"));
    }

    #[test]
    fn test_handshake_payload() {
        let envelope = Envelope::handshake(HandshakeRequest::for_current_process(
            Some("hive-agent".to_string()),
            vec!["execute".to_string()],
        ));
        let wire: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "handshake");
        assert_eq!(wire["payload"]["process_name"], "hive-agent");
        assert_eq!(wire["payload"]["protocol_version"], IPC_PROTOCOL_VERSION);
        assert!(wire["payload"].get("auth_token").is_none());
    }

    #[test]
    fn test_handshake_name_defaults_to_executable() {
        let implicit = HandshakeRequest::for_current_process(None, Vec::new());
        assert!(implicit.process_name.is_some());
        assert_eq!(implicit.process_name, current_exe_name());

        let explicit = HandshakeRequest::for_current_process(Some("agent".to_string()), Vec::new());
        assert_eq!(explicit.process_name.as_deref(), Some("agent"));
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::ProcessHeartbeat).unwrap(),
            "\"process_heartbeat\""
        );
        assert!(MessageType::ProcessStatus.is_process());
        assert!(!MessageType::DataChunk.is_process());
    }

    #[test]
    fn test_remote_info_keeps_os_pid() {
        let transport = RemoteInfo {
            pid: Some(42),
            ..Default::default()
        };
        let handshake = HandshakeRequest {
            pid: Some(7),
            process_name: Some("hive-agent".to_string()),
            ..Default::default()
        };
        let merged = RemoteInfo::merge_handshake(Some(&transport), &handshake);
        assert_eq!(merged.pid, Some(42));
        assert_eq!(merged.process_name.as_deref(), Some("hive-agent"));
    }
}
