//! Generic source → target replicator driven by an event-log consumer.
//!
//! The consumer is created and checkpointed in the target *before* the
//! initial dump, so writes landing during the dump are replayed by the first
//! [`Replicator::sync`] instead of being lost.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Consumer, EventLogError, Topic};
use crate::bus::ChangeEventBus;
use crate::db::DatabaseError;
use crate::model::{ChangeEvent, ReplicatedVariant, VariantKey};
use crate::source::{ReplicaSource, SourceError};

/// Per-entity result of [`ReplicatorTarget::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Created,
    Updated,
    /// Identical or older data; nothing changed.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct UpsertReport {
    pub result: UpsertResult,
    pub entity: Arc<ReplicatedVariant>,
    /// A variant removed because the upserted id moved to a new key.
    pub displaced: Option<Arc<ReplicatedVariant>>,
}

impl UpsertReport {
    /// Keys whose value may have changed.
    fn changed_keys(&self) -> Vec<VariantKey> {
        let mut keys: Vec<VariantKey> = self.displaced.iter().map(|d| d.key()).collect();
        if self.result != UpsertResult::Ignored {
            keys.push(self.entity.key());
        }
        keys
    }

    fn events(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        if let Some(displaced) = &self.displaced {
            events.push(ChangeEvent::deleted(Arc::clone(displaced)));
        }
        match self.result {
            UpsertResult::Created => events.push(ChangeEvent::created(Arc::clone(&self.entity))),
            UpsertResult::Updated => events.push(ChangeEvent::updated(Arc::clone(&self.entity))),
            UpsertResult::Ignored => {}
        }
        events
    }
}

#[derive(Debug, Clone)]
pub enum DeleteResult {
    Ignored,
    Deleted(Arc<ReplicatedVariant>),
}

/// Where replicated variants are written, together with the checkpoint.
pub trait ReplicatorTarget: Send + Sync {
    fn replicator_consumer_id(&self) -> Result<Option<String>, DatabaseError>;

    /// Stores the consumer id, replacing any previous one.
    fn insert_replicator_consumer_id(&self, consumer_id: &str) -> Result<(), DatabaseError>;

    fn upsert(&self, entities: Vec<ReplicatedVariant>) -> Result<Vec<UpsertReport>, DatabaseError>;

    fn delete(&self, variant_id: &str) -> Result<DeleteResult, DatabaseError>;

    /// Ids of every held variant.
    fn variant_ids(&self) -> Result<Vec<String>, DatabaseError>;

    /// Removes every variant and the checkpoint.
    fn clear(&self) -> Result<(), DatabaseError>;

    /// Ids of held variants whose rendered overrides read the value of `key`.
    fn dependent_ids(&self, _key: &VariantKey) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Event log error: {0}")]
    Log(#[from] EventLogError),

    #[error("Replica target error: {0}")]
    Target(#[from] DatabaseError),

    #[error("Replicator has not been bootstrapped")]
    NotBootstrapped,
}

impl ReplicatorError {
    /// Fatal errors stop the loop; the rest are retried after the idle interval.
    ///
    /// Local storage failures and a vanished consumer are fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReplicatorError::Source(_))
    }
}

/// Called once when the loop stops on a fatal error.
pub type FatalHook = Arc<dyn Fn(&ReplicatorError) + Send + Sync>;

/// Outcome of one [`Replicator::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A full batch was pulled; more is probably waiting.
    Lagging,
    /// A partial or empty batch; the consumer caught up.
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// An existing consumer was restored; no reseed.
    Restored,
    /// A fresh consumer was created and the target seeded.
    Seeded { variants: usize },
}

#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub batch_size: usize,
    pub idle_interval: Duration,
    /// Interval of the reconciling sweep; `None` disables it.
    pub resync_interval: Option<Duration>,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_interval: Duration::from_secs(1),
            resync_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Wakes the replicator loop from outside.
#[derive(Default)]
pub struct ReplicatorSignal {
    wake: Notify,
    resync: AtomicBool,
}

impl ReplicatorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// New events are in the log.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Something changed that the log cannot name; sweep the whole source.
    pub fn request_resync(&self) {
        self.resync.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn take_resync(&self) -> bool {
        self.resync.swap(false, Ordering::AcqRel)
    }
}

/// Replicates the source into a target by following a topic.
pub struct Replicator {
    source: Arc<dyn ReplicaSource>,
    target: Arc<dyn ReplicatorTarget>,
    topic: Topic,
    bus: ChangeEventBus,
    settings: ReplicatorSettings,
    consumer: Option<Consumer>,
}

impl Replicator {
    pub fn new(
        source: Arc<dyn ReplicaSource>,
        target: Arc<dyn ReplicatorTarget>,
        topic: Topic,
        bus: ChangeEventBus,
        settings: ReplicatorSettings,
    ) -> Self {
        Self {
            source,
            target,
            topic,
            bus,
            settings: ReplicatorSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            consumer: None,
        }
    }

    pub fn consumer_id(&self) -> Option<&str> {
        self.consumer.as_ref().map(Consumer::id)
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            log::debug!("Replica {} {}", event.kind, event.entity.key());
            self.bus.next(event);
        }
    }

    /// Restores the checkpointed consumer, or creates one and seeds the target.
    pub async fn bootstrap(&mut self) -> Result<BootstrapOutcome, ReplicatorError> {
        if let Some(consumer_id) = self.target.replicator_consumer_id()? {
            match self.topic.restore_consumer(&consumer_id)? {
                Some(consumer) => {
                    log::info!("Restored replicator consumer {}", consumer_id);
                    self.consumer = Some(consumer);
                    return Ok(BootstrapOutcome::Restored);
                }
                None => {
                    log::warn!(
                        "Replicator consumer {} is gone from the event log; \
                         clearing and reseeding the replica",
                        consumer_id
                    );
                    self.target.clear()?;
                }
            }
        }

        let consumer = self.topic.create_consumer()?;
        self.target.insert_replicator_consumer_id(consumer.id())?;
        self.consumer = Some(consumer);

        let mut seeded = 0;
        let mut after: Option<String> = None;
        loop {
            let ids = self
                .source
                .get_ids(after.as_deref(), self.settings.batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }
            let entities = self.source.get_by_ids(&ids).await?;
            seeded += entities.len();
            for report in self.target.upsert(entities)? {
                self.publish(report.events());
            }
            if ids.len() < self.settings.batch_size {
                break;
            }
            after = ids.last().cloned();
        }

        log::info!("Seeded replica with {} variants", seeded);
        Ok(BootstrapOutcome::Seeded { variants: seeded })
    }

    /// Pulls one batch of events and applies it.
    pub async fn step(&mut self) -> Result<StepOutcome, ReplicatorError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or(ReplicatorError::NotBootstrapped)?;
        let events = consumer.pull(self.settings.batch_size)?;
        let Some(last_seq) = events.last().map(|e| e.seq) else {
            return Ok(StepOutcome::UpToDate);
        };

        let mut seen = HashSet::new();
        let ids: Vec<String> = events
            .iter()
            .filter(|e| seen.insert(e.entity_id.as_str()))
            .map(|e| e.entity_id.clone())
            .collect();

        let fetched = self.source.get_by_ids(&ids).await?;
        let present: HashSet<String> = fetched.iter().map(|v| v.variant_id.clone()).collect();

        let mut changed = Vec::new();
        for report in self.target.upsert(fetched)? {
            changed.extend(report.changed_keys());
            self.publish(report.events());
        }
        for id in ids.iter().filter(|id| !present.contains(*id)) {
            if let DeleteResult::Deleted(entity) = self.target.delete(id)? {
                changed.push(entity.key());
                self.publish(vec![ChangeEvent::deleted(entity)]);
            }
        }

        // Variants rendered from a changed value go back through the log so
        // their refetch is checkpointed like any other change.
        let mut dependents: Vec<String> = changed
            .iter()
            .flat_map(|key| self.target.dependent_ids(key))
            .filter(|id| !ids.contains(id))
            .collect();
        dependents.sort();
        dependents.dedup();
        if !dependents.is_empty() {
            log::debug!("Re-rendering {} dependent variants", dependents.len());
            self.topic.publish(dependents.iter().cloned())?;
        }

        consumer.ack(last_seq)?;
        log::debug!("Applied {} log events up to seq {}", events.len(), last_seq);

        if events.len() >= self.settings.batch_size || !dependents.is_empty() {
            Ok(StepOutcome::Lagging)
        } else {
            Ok(StepOutcome::UpToDate)
        }
    }

    /// Steps until caught up.
    pub async fn sync(&mut self) -> Result<(), ReplicatorError> {
        while self.step().await? == StepOutcome::Lagging {}
        Ok(())
    }

    /// Sweeps the whole source: upserts every variant and deletes the ones
    /// the source no longer has. Heals changes the log never recorded.
    pub async fn resync(&mut self) -> Result<(), ReplicatorError> {
        let mut stale: HashSet<String> = self.target.variant_ids()?.into_iter().collect();
        let mut after: Option<String> = None;
        loop {
            let ids = self
                .source
                .get_ids(after.as_deref(), self.settings.batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                stale.remove(id);
            }
            let entities = self.source.get_by_ids(&ids).await?;
            for report in self.target.upsert(entities)? {
                self.publish(report.events());
            }
            if ids.len() < self.settings.batch_size {
                break;
            }
            after = ids.last().cloned();
        }

        let mut stale: Vec<String> = stale.into_iter().collect();
        stale.sort();
        for id in stale {
            if let DeleteResult::Deleted(entity) = self.target.delete(&id)? {
                self.publish(vec![ChangeEvent::deleted(entity)]);
            }
        }
        Ok(())
    }

    /// Follows the log until `cancel` fires or a fatal error occurs.
    ///
    /// In-flight steps always complete; only idle waits are interrupted.
    pub async fn run(
        mut self,
        signal: Arc<ReplicatorSignal>,
        cancel: CancellationToken,
        on_fatal: FatalHook,
    ) {
        let mut resync_timer = self.settings.resync_interval.map(|interval| {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.reset();
            timer
        });

        log::info!("Replicator loop started");
        while !cancel.is_cancelled() {
            let result = if signal.take_resync() {
                log::info!("Resyncing replica from source");
                self.resync().await.map(|_| StepOutcome::UpToDate)
            } else {
                self.step().await
            };

            match result {
                Ok(StepOutcome::Lagging) => continue,
                Ok(StepOutcome::UpToDate) => {}
                Err(e) if e.is_fatal() => {
                    log::error!("Replicator stopped: {}", e);
                    on_fatal(&e);
                    return;
                }
                Err(e) => log::warn!("Replication step failed, will retry: {}", e),
            }

            let idle = tokio::time::sleep(self.settings.idle_interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = signal.wake.notified() => {}
                _ = idle => {}
                _ = async {
                    match resync_timer.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => signal.resync.store(true, Ordering::Release),
            }
        }
        log::info!("Replicator loop stopped");
    }
}
