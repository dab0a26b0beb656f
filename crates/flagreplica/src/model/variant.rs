//! Replicated config variants and the keys they are indexed by.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::condition::RenderedOverride;

/// Logical key of a variant: one config materialized in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantKey {
    pub project_id: String,
    pub config_name: String,
    pub environment_id: String,
}

impl VariantKey {
    pub fn new(
        project_id: impl Into<String>,
        config_name: impl Into<String>,
        environment_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            config_name: config_name.into(),
            environment_id: environment_id.into(),
        }
    }

    /// The partition this key lives in.
    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.project_id, self.config_name, self.environment_id
        )
    }
}

/// A project/environment pair; the unit of partition scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub project_id: String,
    pub environment_id: String,
}

impl PartitionKey {
    pub fn new(project_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            environment_id: environment_id.into(),
        }
    }
}

/// A config variant as held by the replica.
///
/// Overrides are stored rendered, so evaluating a variant never needs I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedVariant {
    /// Stable surrogate id, used by log entries and point lookups.
    pub variant_id: String,
    pub config_name: String,
    pub project_id: String,
    pub environment_id: String,
    /// Base value returned when no override matches.
    pub value: JsonValue,
    #[serde(default)]
    pub overrides: Vec<RenderedOverride>,
    pub version: i64,
    /// Names of the configs in the same project whose values `overrides`
    /// were rendered from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl ReplicatedVariant {
    pub fn key(&self) -> VariantKey {
        VariantKey {
            project_id: self.project_id.clone(),
            config_name: self.config_name.clone(),
            environment_id: self.environment_id.clone(),
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
        }
    }

    /// Whether this variant's rendered overrides depend on `key`.
    pub fn depends_on(&self, key: &VariantKey) -> bool {
        self.project_id == key.project_id
            && self.environment_id == key.environment_id
            && self.config_name != key.config_name
            && self.references.iter().any(|name| *name == key.config_name)
    }

    /// Same rendered content as `other`, ignoring ids and versions.
    pub fn same_content(&self, other: &ReplicatedVariant) -> bool {
        self.value == other.value && self.overrides == other.overrides
    }
}
