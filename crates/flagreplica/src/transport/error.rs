//! Notification transport error types.

use thiserror::Error;

/// Errors that can occur on the notification connection.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Establishing the session failed.
    #[error("Failed to connect notification session: {0}")]
    ConnectFailed(String),

    /// The session ended or broke while in use.
    #[error("Notification connection lost: {0}")]
    ConnectionLost(String),

    /// A LISTEN/UNLISTEN/NOTIFY statement failed.
    #[error("Notification command failed: {0}")]
    CommandFailed(String),

    /// The health check did not answer in time.
    #[error("Health check timed out after {0}ms")]
    HealthCheckTimeout(u64),

    /// A call did not complete within its timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No session is currently connected.
    #[error("Notification transport is not connected")]
    NotConnected,

    /// The transport has been stopped.
    #[error("Notification transport is stopped")]
    Stopped,

    /// Channel names must be plain identifiers.
    #[error("Invalid channel name '{0}'")]
    InvalidChannel(String),

    /// A notification handler failed.
    #[error("Notification handler failed on channel '{channel}': {message}")]
    HandlerFailed { channel: String, message: String },
}

impl TransportError {
    /// Returns true if reconnecting may fix the error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed(_)
                | TransportError::ConnectionLost(_)
                | TransportError::CommandFailed(_)
                | TransportError::HealthCheckTimeout(_)
                | TransportError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for TransportError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => TransportError::ConnectionLost(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                TransportError::ConnectFailed(err.to_string())
            }
            other => TransportError::CommandFailed(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
