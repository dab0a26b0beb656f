//! Connection seam of the notification transport.
//!
//! The supervisor only talks to a [`NotifySession`], so the reconnect and
//! resubscribe logic can be driven by an in-memory session in tests.

use async_trait::async_trait;

use super::error::Result;

/// A notification exactly as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

/// One live pub/sub session.
///
/// `recv` must be cancel-safe: it is polled inside `tokio::select!` and a
/// dropped call must not lose a notification.
#[async_trait]
pub trait NotifySession: Send {
    async fn listen(&mut self, channel: &str) -> Result<()>;

    async fn unlisten(&mut self, channel: &str) -> Result<()>;

    /// Waits for the next notification. An error ends the session.
    async fn recv(&mut self) -> Result<RawNotification>;

    /// Cheap round trip used as health check.
    async fn ping(&mut self) -> Result<()>;

    async fn notify(&mut self, channel: &str, payload: &str) -> Result<()>;
}

/// Opens sessions. Called once per (re)connect attempt.
#[async_trait]
pub trait NotifyConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn NotifySession>>;
}
