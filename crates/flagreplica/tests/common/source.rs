//! In-memory source of truth.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use flagreplica::evaluator::{collect_references, render_overrides};
use flagreplica::model::{Override, ReplicatedVariant};
use flagreplica::source::{DumpFilter, ReplicaSource, SourceError};

/// A `ReplicaSource` over a map of variants, with a switch to fail reads.
///
/// Variants stored with authored overrides are rendered on every read
/// against the current values of their project and environment.
#[derive(Default)]
pub struct FakeSource {
    variants: Mutex<BTreeMap<String, ReplicatedVariant>>,
    authored: Mutex<BTreeMap<String, Vec<Override>>>,
    dumps: AtomicUsize,
    failing: AtomicBool,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(variants: impl IntoIterator<Item = ReplicatedVariant>) -> Arc<Self> {
        let source = Self::new();
        for variant in variants {
            source.put(variant);
        }
        source
    }

    pub fn put(&self, variant: ReplicatedVariant) {
        self.variants
            .lock()
            .unwrap()
            .insert(variant.variant_id.clone(), variant);
    }

    pub fn put_authored(&self, variant: ReplicatedVariant, overrides: Vec<Override>) {
        self.authored
            .lock()
            .unwrap()
            .insert(variant.variant_id.clone(), overrides);
        self.put(variant);
    }

    /// Replaces the value of `variant_id` and bumps its version.
    pub fn update(&self, variant_id: &str, value: JsonValue) -> ReplicatedVariant {
        let mut variants = self.variants.lock().unwrap();
        let variant = variants
            .get_mut(variant_id)
            .unwrap_or_else(|| panic!("unknown variant {}", variant_id));
        variant.value = value;
        variant.version += 1;
        variant.clone()
    }

    pub fn remove(&self, variant_id: &str) -> Option<ReplicatedVariant> {
        self.variants.lock().unwrap().remove(variant_id)
    }

    pub fn get(&self, variant_id: &str) -> Option<ReplicatedVariant> {
        let variants = self.variants.lock().unwrap();
        variants
            .get(variant_id)
            .map(|variant| self.rendered(&variants, variant))
    }

    fn rendered(
        &self,
        variants: &BTreeMap<String, ReplicatedVariant>,
        variant: &ReplicatedVariant,
    ) -> ReplicatedVariant {
        let authored = self.authored.lock().unwrap();
        let Some(overrides) = authored.get(&variant.variant_id) else {
            return variant.clone();
        };
        let mut rendered = variant.clone();
        rendered.overrides = render_overrides(overrides, |reference| {
            variants
                .values()
                .find(|held| {
                    reference.project_id == variant.project_id
                        && held.project_id == variant.project_id
                        && held.environment_id == variant.environment_id
                        && held.config_name == reference.config_name
                })
                .map(|held| held.value.clone())
        });
        rendered.references = collect_references(overrides)
            .into_iter()
            .filter(|reference| reference.project_id == variant.project_id)
            .map(|reference| reference.config_name)
            .collect();
        rendered
    }

    /// Number of full dumps served.
    pub fn dump_count(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SourceError::Pool("source unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReplicaSource for FakeSource {
    async fn get_replica_dump(
        &self,
        filter: &DumpFilter,
    ) -> Result<Vec<ReplicatedVariant>, SourceError> {
        self.check()?;
        self.dumps.fetch_add(1, Ordering::SeqCst);
        let variants = self.variants.lock().unwrap();
        Ok(variants
            .values()
            .filter(|v| filter.matches(v))
            .map(|v| self.rendered(&variants, v))
            .collect())
    }

    async fn get_replica_config(
        &self,
        variant_id: &str,
    ) -> Result<Option<ReplicatedVariant>, SourceError> {
        self.check()?;
        Ok(self.get(variant_id))
    }

    async fn get_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>, SourceError> {
        self.check()?;
        Ok(self
            .variants
            .lock()
            .unwrap()
            .keys()
            .filter(|id| after.map_or(true, |after| id.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ReplicatedVariant>, SourceError> {
        self.check()?;
        let variants = self.variants.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| variants.get(id))
            .map(|v| self.rendered(&variants, v))
            .collect())
    }
}
