//! Command handler abstraction

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::error::IpcResult;
use crate::protocol::Envelope;

/// What a handler gets to know about the request it serves
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Connection the request arrived on
    pub connection: ConnectionHandle,
    /// The full `command_request` envelope
    pub envelope: Envelope,
}

impl RequestContext {
    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    pub fn request_id(&self) -> &str {
        &self.envelope.id
    }
}

/// Serves one named command.
///
/// An `Err` is sent back to the caller as an `error` envelope carrying the
/// error's code; it never closes the connection.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: RequestContext) -> IpcResult<Value>;
}

/// Adapter turning an async closure into a [`CommandHandler`]
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = IpcResult<Value>> + Send,
{
    async fn handle(&self, payload: Value, ctx: RequestContext) -> IpcResult<Value> {
        (self.func)(payload, ctx).await
    }
}

/// Box a closure as a shareable handler
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IpcResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler::new(func))
}
