//! Notify-driven polling replica worker.
//!
//! A single task owns all store mutations. Notifications only queue hints
//! and wake it; a fixed-interval timer requests full refreshes, which heal
//! any notification that was lost while the transport was down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::job::{Job, PendingWork};
use crate::bus::ChangeEventBus;
use crate::model::{ChangeEvent, ChangeHint, VariantKey};
use crate::replica::store::ReplicaStore;
use crate::source::{DumpFilter, ReplicaSource, SourceError};
use crate::transport::Notification;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub full_refresh_interval: Duration,
    pub filter: DumpFilter,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            full_refresh_interval: Duration::from_secs(60),
            filter: DumpFilter::default(),
        }
    }
}

#[derive(Default)]
struct Signals {
    pending: Mutex<PendingWork>,
    wake: Notify,
}

impl Signals {
    fn pending(&self) -> MutexGuard<'_, PendingWork> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap handle for feeding hints to a worker, e.g. from a notification handler.
#[derive(Clone)]
pub struct WorkerHandle {
    signals: Arc<Signals>,
}

impl WorkerHandle {
    /// Queues a refetch of one variant.
    pub fn enqueue(&self, variant_id: impl Into<String>) {
        self.signals.pending().push(variant_id.into());
        self.signals.wake.notify_one();
    }

    pub fn request_full_refresh(&self) {
        self.signals.pending().request_full_refresh();
        self.signals.wake.notify_one();
    }

    /// Turns a notification into work. Malformed payloads are dropped.
    pub fn handle_notification(&self, notification: &Notification) {
        match notification.payload.as_ref().and_then(ChangeHint::from_payload) {
            Some(ChangeHint::Variant(id)) => self.enqueue(id),
            Some(ChangeHint::Config(config_id)) => {
                log::debug!("Config {} changed, requesting full refresh", config_id);
                self.request_full_refresh();
            }
            None => log::warn!(
                "Dropping notification on '{}' without a usable id: {}",
                notification.channel,
                notification.raw_payload
            ),
        }
    }
}

struct Core {
    source: Arc<dyn ReplicaSource>,
    store: Arc<ReplicaStore>,
    bus: ChangeEventBus,
    settings: WorkerSettings,
    signals: Arc<Signals>,
}

impl Core {
    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            log::debug!("Replica {} {}", event.kind, event.entity.key());
            self.bus.next(event);
        }
    }

    async fn full_refresh(&self) -> Result<usize, SourceError> {
        let variants = self
            .source
            .get_replica_dump(&self.settings.filter)
            .instrument(tracing::info_span!("full_refresh"))
            .await?;
        let count = variants.len();
        let events = self.store.replace_all(variants);
        if !events.is_empty() {
            log::info!("Full refresh applied {} changes ({} variants)", events.len(), count);
        }
        self.publish(events);
        Ok(count)
    }

    async fn refetch(&self, variant_id: &str) -> Result<(), SourceError> {
        let fetched = self
            .source
            .get_replica_config(variant_id)
            .await?
            .filter(|variant| self.settings.filter.matches(variant));

        match fetched {
            Some(variant) => {
                let applied = self.store.upsert(variant);
                if !applied.outcome.is_change() {
                    log::trace!(
                        "Ignoring {:?} notification for {}",
                        applied.outcome,
                        variant_id
                    );
                    return Ok(());
                }
                if let Some(displaced) = &applied.displaced {
                    self.queue_dependents(&displaced.key());
                }
                self.queue_dependents(&applied.entity.key());
                self.publish(applied.events());
            }
            None => {
                if let Some(removed) = self.store.delete_by_id(variant_id) {
                    self.queue_dependents(&removed.key());
                    self.publish(vec![ChangeEvent::deleted(removed)]);
                }
            }
        }
        Ok(())
    }

    /// Queues a refetch of every variant whose overrides read `key`'s value.
    fn queue_dependents(&self, key: &VariantKey) {
        let dependents = self.store.dependents(key);
        if dependents.is_empty() {
            return;
        }
        log::debug!("Re-rendering {} variants that reference {}", dependents.len(), key);
        let mut pending = self.signals.pending();
        for dependent in dependents {
            pending.push(dependent.variant_id.clone());
        }
    }

    async fn process(&self, job: Job) {
        let result = match &job {
            Job::FullRefresh => self.full_refresh().await.map(|_| ()),
            Job::Variant(id) => self.refetch(id).await,
        };
        if let Err(e) = result {
            // The next full refresh repairs whatever this job missed.
            log::warn!("Replica job {:?} failed: {}", job, e);
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.full_refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            loop {
                let next = self.signals.pending().next_job();
                let Some(job) = next else { break };
                self.process(job).await;
                if cancel.is_cancelled() {
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.signals.wake.notified() => {}
                _ = ticker.tick() => self.signals.pending().request_full_refresh(),
            }
        }
    }
}

/// Keeps a [`ReplicaStore`] in sync by refetching notified ids.
pub struct CoalescingReplicaWorker {
    core: Arc<Core>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CoalescingReplicaWorker {
    pub fn new(
        source: Arc<dyn ReplicaSource>,
        store: Arc<ReplicaStore>,
        bus: ChangeEventBus,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                source,
                store,
                bus,
                settings,
                signals: Arc::new(Signals::default()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            signals: Arc::clone(&self.core.signals),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the full dump, then spawns the worker task.
    ///
    /// Returns once the store holds a complete snapshot. Calling it while
    /// running does nothing.
    pub async fn start(&self) -> Result<(), SourceError> {
        if self.running().is_some() {
            return Ok(());
        }

        let count = self.core.full_refresh().await?;
        log::info!("Replica loaded {} variants", count);

        let mut running = self.running();
        if running.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(Arc::clone(&self.core).run(cancel.clone()));
            *running = Some((cancel, handle));
        }
        Ok(())
    }

    /// Stops the task after its current job. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                log::error!("Replica worker task failed: {}", e);
            }
            log::info!("Replica worker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Number of queued variant hints.
    pub fn queued(&self) -> usize {
        self.core.signals.pending().len()
    }
}
