//! Realtime transport abstraction.
//!
//! The connection manager is written against these traits so tests can
//! drive it with scripted sessions instead of a live socket.

use async_trait::async_trait;

use crate::domain::RealtimeEvent;
use crate::error::Result;
use crate::session::Credential;

/// A single inbound frame from the realtime feed.
#[derive(Debug, Clone)]
pub enum Inbound {
    Event(RealtimeEvent),
    Pong,
}

/// One established realtime session. Dropped on disconnect; the
/// connection manager asks the transport for a fresh one on reconnect.
#[async_trait]
pub trait RealtimeSession: Send {
    /// Send a subscribe frame and wait for the server acknowledgement.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Next inbound frame. `Ok(None)` means the server closed the stream.
    async fn next_event(&mut self) -> Result<Option<Inbound>>;

    /// Send an application-level heartbeat probe.
    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn RealtimeSession>>;
}
