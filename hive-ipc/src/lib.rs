//! Inter-process communication for Hive
//!
//! Envelope protocol, pluggable transports (Unix domain socket, Windows
//! named pipe, HTTP with server-sent events), a command-dispatching server
//! and a reconnecting client with request/reply correlation.

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod factory;
pub mod handler;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientEvent, ClientStatus, IpcClient};
pub use connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionSettings};
pub use error::{ErrorCode, IpcError, IpcResult};
pub use factory::{ClientOptions, EndpointRole, IpcFactory, ServerOptions};
pub use handler::{handler_fn, CommandHandler, RequestContext};
pub use protocol::{
    Envelope, HandshakeAck, HandshakeRequest, Message, MessageType, RemoteInfo,
    IPC_PROTOCOL_VERSION,
};
pub use rate_limiter::RateLimiter;
pub use registry::{ProcessRecord, ProcessRegistry, ProcessStatus};
pub use server::{ConnectionSummary, IpcServer, ServerEvent, ServerInfo, SERVER_VERSION};
pub use transport::{create_transport, HttpTransport, Transport};
