//! The replica: a read model kept in sync with the source of truth.
//!
//! Two bindings keep the store fresh:
//! - *polling*: a [`CoalescingReplicaWorker`] refetches notified ids and
//!   periodically reloads the full dump;
//! - *durable*: notifications are appended to a local event log that a
//!   [`Replicator`] follows, with the replica persisted next to it so a
//!   restart resumes from its checkpoint.
//!
//! Reads go straight to the in-memory [`ReplicaStore`] and never wait on
//! replication.

pub mod local;
pub mod store;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, ChangeEventBus};
use crate::db::Database;
use crate::error::{ReplicaError, Result};
use crate::evaluator::{evaluate, Context};
use crate::eventlog::{
    BootstrapOutcome, EventLog, FatalHook, Replicator, ReplicatorError, ReplicatorSettings,
    ReplicatorSignal, Topic,
};
use crate::model::{ChangeEvent, ChangeHint, PartitionKey, ReplicatedVariant, VariantKey};
use crate::source::{DumpFilter, ReplicaSource};
use crate::transport::ChangeNotificationTransport;
use crate::worker::{CoalescingReplicaWorker, WorkerSettings};

pub use local::LocalReplica;
pub use store::{ReplicaStore, UpsertOutcome, Upserted};

/// Topic the durable binding records variant changes on.
pub const VARIANT_TOPIC: &str = "config_variants";

/// A value lookup: which variant, evaluated for which caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueQuery {
    pub key: VariantKey,
    pub context: Option<Context>,
}

impl ValueQuery {
    pub fn new(key: VariantKey) -> Self {
        Self { key, context: None }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

/// Replication timing shared by both bindings.
#[derive(Debug, Clone)]
pub struct ReplicaSettings {
    /// Notification channel carrying change hints.
    pub channel: String,
    pub full_refresh_interval: Duration,
    pub batch_size: usize,
    pub idle_interval: Duration,
    pub filter: DumpFilter,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            channel: "config_changes".to_string(),
            full_refresh_interval: Duration::from_secs(60),
            batch_size: 100,
            idle_interval: Duration::from_secs(1),
            filter: DumpFilter::default(),
        }
    }
}

enum Binding {
    Polling(CoalescingReplicaWorker),
    Durable {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
        bridge: Option<JoinHandle<()>>,
    },
}

impl Binding {
    async fn shutdown(self) {
        match self {
            Binding::Polling(worker) => worker.stop().await,
            Binding::Durable {
                cancel,
                handle,
                bridge,
            } => {
                cancel.cancel();
                if let Err(e) = handle.await {
                    log::error!("Replicator task failed: {}", e);
                }
                if let Some(bridge) = bridge {
                    if let Err(e) = bridge.await {
                        log::error!("Event log bridge task failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Appends notified variant ids to the event log, off the transport task.
///
/// SQLite writes run on the blocking pool. Ids whose append fails are
/// recovered by a full resync.
async fn run_log_bridge(
    topic: Topic,
    signal: Arc<ReplicatorSignal>,
    mut pending: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            next = pending.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        let mut ids = vec![first];
        while let Ok(id) = pending.try_recv() {
            ids.push(id);
        }

        let count = ids.len();
        let topic = topic.clone();
        match tokio::task::spawn_blocking(move || topic.publish(ids)).await {
            Ok(Ok(_)) => signal.wake(),
            Ok(Err(e)) => {
                log::error!("Failed to append {} variant ids to the event log: {}", count, e);
                signal.request_resync();
            }
            Err(e) => {
                log::error!("Event log append task failed: {}", e);
                signal.request_resync();
            }
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    binding: Option<Binding>,
    stopped: bool,
}

/// Locally readable copy of the configs, plus its change stream.
pub struct Replica {
    store: Arc<ReplicaStore>,
    bus: ChangeEventBus,
    lifecycle: Mutex<Lifecycle>,
}

impl Replica {
    /// Creates an empty replica whose change channels buffer `bus_capacity` events.
    pub fn new(bus_capacity: usize) -> Self {
        Self {
            store: Arc::new(ReplicaStore::new()),
            bus: ChangeEventBus::new(bus_capacity),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_startable(&self) -> Result<()> {
        let lifecycle = self.lifecycle();
        if lifecycle.stopped {
            return Err(ReplicaError::Stopped);
        }
        if lifecycle.binding.is_some() {
            return Err(ReplicaError::AlreadyStarted);
        }
        Ok(())
    }

    /// Hands the binding back when the replica was started or stopped meanwhile.
    fn install(&self, binding: Binding) -> std::result::Result<(), Binding> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.stopped || lifecycle.binding.is_some() {
            return Err(binding);
        }
        lifecycle.binding = Some(binding);
        Ok(())
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn bus(&self) -> &ChangeEventBus {
        &self.bus
    }

    /// Starts the polling binding and returns once the first full dump is loaded.
    ///
    /// With a transport, change hints on `settings.channel` wake the worker.
    pub async fn start_polling(
        &self,
        source: Arc<dyn ReplicaSource>,
        transport: Option<&ChangeNotificationTransport>,
        settings: ReplicaSettings,
    ) -> Result<()> {
        self.check_startable()?;

        let worker = CoalescingReplicaWorker::new(
            source,
            Arc::clone(&self.store),
            self.bus.clone(),
            WorkerSettings {
                full_refresh_interval: settings.full_refresh_interval,
                filter: settings.filter.clone(),
            },
        );

        // Attached before the initial dump, so hints arriving meanwhile are queued.
        if let Some(transport) = transport {
            let handle = worker.handle();
            let channel = settings.channel.clone();
            transport.on_notification(move |notification| {
                if notification.channel == channel {
                    handle.handle_notification(notification);
                }
                Ok(())
            });
            transport.add_channel(&settings.channel)?;
        }

        worker.start().await?;
        log::info!("Replica started in polling mode ({} variants)", self.store.len());
        if let Err(binding) = self.install(Binding::Polling(worker)) {
            binding.shutdown().await;
            return Err(ReplicaError::AlreadyStarted);
        }
        Ok(())
    }

    /// Starts the durable binding over the local database `db`.
    ///
    /// Restores or seeds the local replica, catches up with the event log,
    /// then follows it in a background task. If that task stops on an
    /// unrecoverable error, `on_fatal` is called and every change stream
    /// ends with the error.
    pub async fn start_durable(
        &self,
        source: Arc<dyn ReplicaSource>,
        db: Database,
        transport: Option<&ChangeNotificationTransport>,
        settings: ReplicaSettings,
        on_fatal: Option<FatalHook>,
    ) -> Result<()> {
        self.check_startable()?;

        let target = Arc::new(LocalReplica::open(db.clone(), Arc::clone(&self.store))?);
        let topic = EventLog::new(db).topic(VARIANT_TOPIC);
        let signal = Arc::new(ReplicatorSignal::new());

        // Cancels the bridge if startup fails before the binding is installed.
        let cancel = CancellationToken::new();
        let startup = cancel.clone().drop_guard();

        let mut bridge = None;
        if let Some(transport) = transport {
            let (hints, pending) = mpsc::unbounded_channel();
            bridge = Some(tokio::spawn(run_log_bridge(
                topic.clone(),
                Arc::clone(&signal),
                pending,
                cancel.clone(),
            )));

            let signal = Arc::clone(&signal);
            let channel = settings.channel.clone();
            transport.on_notification(move |notification| {
                if notification.channel != channel {
                    return Ok(());
                }
                match notification.payload.as_ref().and_then(ChangeHint::from_payload) {
                    Some(ChangeHint::Variant(id)) => hints
                        .send(id)
                        .map_err(|_| "event log bridge has stopped".to_string())?,
                    Some(ChangeHint::Config(_)) => signal.request_resync(),
                    None => log::warn!(
                        "Dropping notification on '{}' without a usable id: {}",
                        notification.channel,
                        notification.raw_payload
                    ),
                }
                Ok(())
            });
            transport.add_channel(&settings.channel)?;
        }

        let mut replicator = Replicator::new(
            source,
            target,
            topic,
            self.bus.clone(),
            ReplicatorSettings {
                batch_size: settings.batch_size,
                idle_interval: settings.idle_interval,
                resync_interval: Some(settings.full_refresh_interval),
            },
        );

        if replicator.bootstrap().await? == BootstrapOutcome::Restored {
            // Changes made while no process was listening never reached the log.
            signal.request_resync();
        }
        replicator.sync().await?;
        log::info!("Replica started in durable mode ({} variants)", self.store.len());

        let bus = self.bus.clone();
        let on_fatal: FatalHook = Arc::new(move |error: &ReplicatorError| {
            if let Some(hook) = &on_fatal {
                hook(error);
            }
            if !bus.is_completed() {
                bus.error(error.to_string());
            }
        });

        startup.disarm();
        let handle = tokio::spawn(replicator.run(signal, cancel.clone(), on_fatal));
        let binding = Binding::Durable {
            cancel,
            handle,
            bridge,
        };
        if let Err(binding) = self.install(binding) {
            binding.shutdown().await;
            return Err(ReplicaError::AlreadyStarted);
        }
        Ok(())
    }

    /// Stops replication and ends every change stream. Safe to call
    /// repeatedly; a stopped replica cannot be started again.
    pub async fn stop(&self) {
        let binding = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            lifecycle.binding.take()
        };

        if let Some(binding) = binding {
            binding.shutdown().await;
        }
        if !self.bus.is_completed() {
            self.bus.complete();
        }
        log::info!("Replica stopped");
    }

    /// Evaluates the variant at `query.key` for `query.context`.
    ///
    /// `None` when the variant is not replicated. A missing context is the
    /// empty context.
    pub fn get_config_value(&self, query: &ValueQuery) -> Option<JsonValue> {
        let variant = self.store.get(&query.key)?;
        let empty = Context::new();
        let context = query.context.as_ref().unwrap_or(&empty);
        Some(evaluate(&variant.value, &variant.overrides, context).clone())
    }

    pub fn get_config(&self, key: &VariantKey) -> Option<Arc<ReplicatedVariant>> {
        self.store.get(key)
    }

    pub fn get_config_by_id(&self, variant_id: &str) -> Option<Arc<ReplicatedVariant>> {
        self.store.get_by_id(variant_id)
    }

    /// Variants of one project/environment, ordered by config name.
    pub fn list_configs(&self, partition: &PartitionKey) -> Vec<Arc<ReplicatedVariant>> {
        self.store.list_partition(partition)
    }

    /// Change events of `project_id` until `cancel` fires or the replica stops.
    ///
    /// Cancelling ends the stream and drops its subscription.
    ///
    /// # Panics
    /// Panics if the replica has been stopped or its replication failed.
    pub fn watch(
        &self,
        project_id: &str,
        cancel: CancellationToken,
    ) -> impl Stream<Item = std::result::Result<ChangeEvent, BusError>> + Send + 'static {
        let subscription = self.bus.subscribe(project_id);
        futures_util::stream::unfold(
            (subscription, cancel),
            |(mut subscription, cancel)| async move {
                let item = tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = subscription.recv() => item,
                };
                item.map(|item| (item, (subscription, cancel)))
            },
        )
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new(256)
    }
}
