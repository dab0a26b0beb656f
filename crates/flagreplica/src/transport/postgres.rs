//! LISTEN/NOTIFY session over sqlx.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgListener;

use super::error::{Result, TransportError};
use super::session::{NotifyConnector, NotifySession, RawNotification};
use crate::source::LazyPool;

/// Connects [`PgNotifySession`]s from the shared lazy pool.
pub struct PgNotifyConnector {
    pool: Arc<LazyPool>,
}

impl PgNotifyConnector {
    pub fn new(pool: Arc<LazyPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyConnector for PgNotifyConnector {
    async fn connect(&self) -> Result<Box<dyn NotifySession>> {
        let pool = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Ok(Box::new(PgNotifySession { listener }))
    }
}

/// A dedicated Postgres connection in LISTEN mode.
pub struct PgNotifySession {
    listener: PgListener,
}

#[async_trait]
impl NotifySession for PgNotifySession {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.listener.listen(channel).await?;
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.listener.unlisten(channel).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RawNotification> {
        // `try_recv` yields None when the connection dropped. The listener
        // would silently reconnect on the next call, but the supervisor owns
        // reconnects so it can resubscribe and report the gap.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(RawNotification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            None => Err(TransportError::ConnectionLost(
                "server closed the listener connection".to_string(),
            )),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut self.listener).await?;
        Ok(())
    }

    async fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&mut self.listener)
            .await?;
        Ok(())
    }
}
