//! Classified replica changes, as published to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::variant::ReplicatedVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A change applied to the replica.
///
/// For deletions `entity` is the variant as it was before removal.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity: Arc<ReplicatedVariant>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, entity: Arc<ReplicatedVariant>) -> Self {
        Self {
            kind,
            entity,
            timestamp: Utc::now(),
        }
    }

    pub fn created(entity: Arc<ReplicatedVariant>) -> Self {
        Self::new(ChangeKind::Created, entity)
    }

    pub fn updated(entity: Arc<ReplicatedVariant>) -> Self {
        Self::new(ChangeKind::Updated, entity)
    }

    pub fn deleted(entity: Arc<ReplicatedVariant>) -> Self {
        Self::new(ChangeKind::Deleted, entity)
    }

    /// Project the event is routed to.
    pub fn project_id(&self) -> &str {
        &self.entity.project_id
    }
}
