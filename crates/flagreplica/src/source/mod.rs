//! Read access to the source of truth.

pub mod pool;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ReplicatedVariant;

pub use pool::{LazyPool, PoolSettings};
pub use postgres::PgReplicaSource;
pub use retry::{with_retry, RetryPolicy, Retryable};

/// Errors reading from the source of truth.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid row for variant {id}: {message}")]
    InvalidRow { id: String, message: String },

    #[error("Connection pool unavailable: {0}")]
    Pool(String),
}

impl SourceError {
    /// Whether repeating the transaction may succeed.
    ///
    /// Serialization failures and deadlocks are expected under concurrent
    /// writers; pool timeouts and I/O errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            SourceError::Database(sqlx::Error::PoolTimedOut) => true,
            SourceError::Database(sqlx::Error::Io(_)) => true,
            SourceError::Pool(_) => true,
            _ => false,
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        SourceError::is_retryable(self)
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Restricts a bulk dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpFilter {
    /// Only variants of this project.
    pub project_id: Option<String>,
}

impl DumpFilter {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
        }
    }

    pub fn matches(&self, variant: &ReplicatedVariant) -> bool {
        self.project_id
            .as_deref()
            .map_or(true, |p| p == variant.project_id)
    }
}

/// Source of replicated variants. Overrides are returned rendered.
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Every variant matching `filter`, read as one consistent snapshot.
    async fn get_replica_dump(&self, filter: &DumpFilter) -> Result<Vec<ReplicatedVariant>>;

    /// One variant by id; `None` when deleted or never existed.
    async fn get_replica_config(&self, variant_id: &str) -> Result<Option<ReplicatedVariant>>;

    /// Up to `limit` variant ids greater than `after`, ascending.
    async fn get_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// The variants among `ids` that still exist. Order is unspecified.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ReplicatedVariant>>;
}
