//! In-memory, multiply-indexed snapshot of replicated variants.
//!
//! Only the replica's single worker task mutates the store. The lock exists
//! so that concurrent readers observe each update as one atomic step: every
//! mutation replaces the entries of all three indices inside one write
//! critical section.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::{ChangeEvent, PartitionKey, ReplicatedVariant, VariantKey};

/// How an incoming variant relates to the one already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No variant with this key was held.
    Created,
    /// The version or the rendered content changed, or the config was
    /// recreated under a new id.
    Updated,
    /// Same id, version and content as the held variant.
    Spurious,
    /// Same id, older version than the held variant.
    Stale,
}

impl UpsertOutcome {
    pub fn is_change(self) -> bool {
        matches!(self, UpsertOutcome::Created | UpsertOutcome::Updated)
    }
}

/// Result of [`ReplicaStore::upsert`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub outcome: UpsertOutcome,
    /// The variant held after the call.
    pub entity: Arc<ReplicatedVariant>,
    /// A variant removed because its id now lives under a different key.
    pub displaced: Option<Arc<ReplicatedVariant>>,
}

impl Upserted {
    /// Change events this upsert produces, in publication order.
    pub fn events(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        if let Some(displaced) = &self.displaced {
            events.push(ChangeEvent::deleted(Arc::clone(displaced)));
        }
        match self.outcome {
            UpsertOutcome::Created => events.push(ChangeEvent::created(Arc::clone(&self.entity))),
            UpsertOutcome::Updated => events.push(ChangeEvent::updated(Arc::clone(&self.entity))),
            UpsertOutcome::Spurious | UpsertOutcome::Stale => {}
        }
        events
    }
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<ReplicatedVariant>>,
    by_key: HashMap<VariantKey, Arc<ReplicatedVariant>>,
    by_partition: HashMap<PartitionKey, BTreeMap<String, Arc<ReplicatedVariant>>>,
}

impl Indices {
    fn classify(&self, incoming: &ReplicatedVariant) -> UpsertOutcome {
        match self.by_key.get(&incoming.key()) {
            Some(held) if held.variant_id == incoming.variant_id => {
                match incoming.version.cmp(&held.version) {
                    // Equal versions still differ when a referenced config
                    // changed and the overrides were rendered again.
                    Ordering::Equal if held.same_content(incoming) => UpsertOutcome::Spurious,
                    Ordering::Equal | Ordering::Greater => UpsertOutcome::Updated,
                    Ordering::Less => UpsertOutcome::Stale,
                }
            }
            Some(_) => UpsertOutcome::Updated,
            None => match self.by_id.get(&incoming.variant_id) {
                Some(held) if held.version > incoming.version => UpsertOutcome::Stale,
                _ => UpsertOutcome::Created,
            },
        }
    }

    fn insert(&mut self, entity: Arc<ReplicatedVariant>) {
        self.by_id
            .insert(entity.variant_id.clone(), Arc::clone(&entity));
        self.by_key.insert(entity.key(), Arc::clone(&entity));
        self.by_partition
            .entry(entity.partition())
            .or_default()
            .insert(entity.config_name.clone(), entity);
    }

    fn remove_key(&mut self, key: &VariantKey) -> Option<Arc<ReplicatedVariant>> {
        let removed = self.by_key.remove(key)?;
        if self
            .by_id
            .get(&removed.variant_id)
            .is_some_and(|held| Arc::ptr_eq(held, &removed))
        {
            self.by_id.remove(&removed.variant_id);
        }
        let partition = key.partition();
        if let Some(names) = self.by_partition.get_mut(&partition) {
            names.remove(&key.config_name);
            if names.is_empty() {
                self.by_partition.remove(&partition);
            }
        }
        Some(removed)
    }
}

/// The replica's read model.
#[derive(Default)]
pub struct ReplicaStore {
    indices: RwLock<Indices>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Predicts what [`upsert`](Self::upsert) would do, without mutating.
    pub fn classify(&self, incoming: &ReplicatedVariant) -> UpsertOutcome {
        self.read().classify(incoming)
    }

    /// Inserts or replaces a variant.
    ///
    /// Spurious and stale variants leave the store untouched.
    pub fn upsert(&self, incoming: ReplicatedVariant) -> Upserted {
        let mut indices = self.write();
        let key = incoming.key();
        let outcome = indices.classify(&incoming);

        if !outcome.is_change() {
            let held = indices
                .by_key
                .get(&key)
                .or_else(|| indices.by_id.get(&incoming.variant_id))
                .cloned()
                .unwrap_or_else(|| Arc::new(incoming));
            return Upserted {
                outcome,
                entity: held,
                displaced: None,
            };
        }

        let moved_from = indices
            .by_id
            .get(&incoming.variant_id)
            .map(|held| held.key())
            .filter(|held_key| *held_key != key);
        let displaced = moved_from.and_then(|old_key| indices.remove_key(&old_key));
        indices.remove_key(&key);

        let entity = Arc::new(incoming);
        indices.insert(Arc::clone(&entity));

        Upserted {
            outcome,
            entity,
            displaced,
        }
    }

    /// Removes the variant with `key`, if held.
    pub fn delete(&self, key: &VariantKey) -> Option<Arc<ReplicatedVariant>> {
        self.write().remove_key(key)
    }

    /// Removes the variant with surrogate id `variant_id`, if held.
    pub fn delete_by_id(&self, variant_id: &str) -> Option<Arc<ReplicatedVariant>> {
        let mut indices = self.write();
        let key = indices.by_id.get(variant_id)?.key();
        indices.remove_key(&key)
    }

    /// Replaces the whole snapshot and returns what changed, compared by key.
    ///
    /// Surrogate ids from a bulk dump need not match earlier ones, so a key
    /// whose id changed counts as updated rather than deleted and created.
    pub fn replace_all(&self, entities: Vec<ReplicatedVariant>) -> Vec<ChangeEvent> {
        let mut indices = self.write();
        let mut next = Indices::default();
        let mut events = Vec::new();

        for incoming in entities {
            let key = incoming.key();
            if let Some(held) = indices.by_key.get(&key) {
                match indices.classify(&incoming) {
                    UpsertOutcome::Spurious | UpsertOutcome::Stale => {
                        next.insert(Arc::clone(held));
                        continue;
                    }
                    _ => {}
                }
            }

            let entity = Arc::new(incoming);
            if next.by_key.contains_key(&key) {
                log::warn!("Bulk dump contains {} more than once; keeping the last", key);
                next.remove_key(&key);
                events.retain(|e: &ChangeEvent| e.entity.key() != key);
            }
            if indices.by_key.contains_key(&key) {
                events.push(ChangeEvent::updated(Arc::clone(&entity)));
            } else {
                events.push(ChangeEvent::created(Arc::clone(&entity)));
            }
            next.insert(entity);
        }

        let mut gone: Vec<&Arc<ReplicatedVariant>> = indices
            .by_key
            .iter()
            .filter(|(key, _)| !next.by_key.contains_key(*key))
            .map(|(_, held)| held)
            .collect();
        gone.sort_by_key(|held| held.key());
        events.extend(gone.into_iter().map(|held| ChangeEvent::deleted(Arc::clone(held))));

        *indices = next;
        events
    }

    /// Removes everything and returns what was held.
    pub fn clear(&self) -> Vec<Arc<ReplicatedVariant>> {
        let mut indices = self.write();
        let removed = indices.by_key.values().cloned().collect();
        *indices = Indices::default();
        removed
    }

    pub fn get(&self, key: &VariantKey) -> Option<Arc<ReplicatedVariant>> {
        self.read().by_key.get(key).cloned()
    }

    pub fn get_by_id(&self, variant_id: &str) -> Option<Arc<ReplicatedVariant>> {
        self.read().by_id.get(variant_id).cloned()
    }

    /// Variants of one project/environment, ordered by config name.
    pub fn list_partition(&self, partition: &PartitionKey) -> Vec<Arc<ReplicatedVariant>> {
        self.read()
            .by_partition
            .get(partition)
            .map(|names| names.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Variants whose rendered overrides read the value of `key`.
    pub fn dependents(&self, key: &VariantKey) -> Vec<Arc<ReplicatedVariant>> {
        self.read()
            .by_partition
            .get(&key.partition())
            .map(|names| {
                names
                    .values()
                    .filter(|held| held.depends_on(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<Arc<ReplicatedVariant>> {
        self.read().by_key.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
