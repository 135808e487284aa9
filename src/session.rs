use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// A reliable, ordered, bidirectional message channel to one client.
///
/// The engine never touches a socket: the gateway adapts whatever
/// transport it speaks to this trait, and everything above it deals in
/// named messages with object params.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Pushes a server-originated message, ignoring any reply.
    fn send(&self, name: &str, params: Value);

    /// Invokes a method on the client and awaits its single reply.
    async fn call(&self, name: &str, params: Value) -> Result<Value, SessionError>;

    /// Tears the underlying connection down.
    fn close(&self);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
}

/// An inbound RPC from a client, carrying the callback its single
/// reply goes to.
pub struct IncomingRpc {
    pub name: String,
    pub params: Value,
    pub responder: oneshot::Sender<Value>,
}
