//! Lazily created shared Postgres pool.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;

use super::{Result, SourceError};

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// A Postgres pool created on first use.
///
/// The first caller connects; concurrent callers wait for that attempt.
/// A failed attempt leaves the cell empty so the next caller retries.
pub struct LazyPool {
    settings: PoolSettings,
    cell: OnceCell<PgPool>,
}

impl LazyPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            cell: OnceCell::new(),
        }
    }

    /// Wraps an already connected pool.
    pub fn from_pool(settings: PoolSettings, pool: PgPool) -> Self {
        Self {
            settings,
            cell: OnceCell::new_with(Some(pool)),
        }
    }

    pub async fn get(&self) -> Result<&PgPool> {
        self.cell
            .get_or_try_init(|| async {
                log::info!(
                    "Connecting to source database (max {} connections)",
                    self.settings.max_connections
                );
                PgPoolOptions::new()
                    .max_connections(self.settings.max_connections)
                    .acquire_timeout(self.settings.acquire_timeout)
                    .connect(&self.settings.url)
                    .await
                    .map_err(|e| SourceError::Pool(e.to_string()))
            })
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    /// Closes the pool if it was ever opened.
    pub async fn close(&self) {
        if let Some(pool) = self.cell.get() {
            pool.close().await;
        }
    }
}
