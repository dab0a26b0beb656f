mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flagreplica::eventlog::FatalHook;
use flagreplica::source::ReplicaSource;
use flagreplica::{
    load_config, ChangeNotificationTransport, Config, ConfigError, Database, EventLog, LazyPool,
    PgNotifyConnector, PgReplicaSource, Replica, ReplicaError, ReplicaMode,
};

/// How long startup waits for the notification session before going on without it.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "flagreplica-agent", version)]
#[command(about = "Keeps a local replica of Postgres feature flags in sync", long_about = None)]
struct Args {
    /// Settings file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log the change stream of this project
    #[arg(short, long)]
    watch: Option<String>,

    /// Overrides `logging.level` from the settings file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init(&config.logging, args.log_level.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting flagreplica-agent v{}", env!("CARGO_PKG_VERSION"));

    match run(args, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Runs until Ctrl-C or a fatal replication error. Returns false on the latter.
async fn run(args: Args, config: Config) -> Result<bool, ReplicaError> {
    let pool = Arc::new(LazyPool::new(config.database.pool_settings()));

    let mut source = PgReplicaSource::new(Arc::clone(&pool));
    if let Some(project_id) = &config.replica.project_id {
        source = source.scoped_to(project_id.clone());
    }
    let source: Arc<dyn ReplicaSource> = Arc::new(source);

    let transport = ChangeNotificationTransport::new(
        Arc::new(PgNotifyConnector::new(Arc::clone(&pool))),
        config.notifications.transport_settings(),
    );
    transport.on_error(|e| tracing::warn!(error = %e, "Notification transport error"));

    // Subscribe before the initial snapshot, so no write falls between them.
    transport.add_channel(&config.notifications.channel)?;
    transport.start();
    if let Err(e) = transport.ensure_connected(CONNECT_TIMEOUT).await {
        log::warn!(
            "Notification session not ready ({}), relying on periodic refresh until it is",
            e
        );
    }

    let shutdown = CancellationToken::new();
    let failed = Arc::new(AtomicBool::new(false));
    let replica = Replica::new(config.replica.bus_capacity);
    let settings = config.replica_settings();

    let mut prune_task = None;
    let started = match config.replica.mode {
        ReplicaMode::Polling => {
            replica
                .start_polling(source, Some(&transport), settings)
                .await
        }
        ReplicaMode::Durable => {
            let path = config
                .replica
                .resolved_cache_path()
                .ok_or_else(|| ConfigError::Validation {
                    message: "replica.cachePath is required without a home directory".to_string(),
                })?;
            let db = Database::open_or_recreate(&path)?;

            let on_fatal: FatalHook = {
                let shutdown = shutdown.clone();
                let failed = Arc::clone(&failed);
                Arc::new(move |e: &flagreplica::ReplicatorError| {
                    log::error!("Replication stopped: {}", e);
                    failed.store(true, Ordering::SeqCst);
                    shutdown.cancel();
                })
            };

            prune_task = Some(spawn_pruner(
                EventLog::new(db.clone()),
                config.replica.log_retention(),
                shutdown.clone(),
            ));
            replica
                .start_durable(source, db, Some(&transport), settings, Some(on_fatal))
                .await
        }
    };
    if let Err(e) = started {
        shutdown.cancel();
        transport.stop().await;
        pool.close().await;
        return Err(e);
    }

    if let Some(project_id) = args.watch {
        spawn_watcher(&replica, project_id, shutdown.child_token());
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                log::error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    replica.stop().await;
    transport.stop().await;
    if let Some(task) = prune_task {
        if let Err(e) = task.await {
            log::error!("Event log pruner failed: {}", e);
        }
    }
    pool.close().await;
    info!("Shutdown complete");

    Ok(!failed.load(Ordering::SeqCst))
}

fn spawn_watcher(replica: &Replica, project_id: String, cancel: CancellationToken) {
    let mut events = Box::pin(replica.watch(&project_id, cancel));
    tokio::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => tracing::info!(
                    project = %project_id,
                    kind = %event.kind,
                    config = %event.entity.config_name,
                    environment = %event.entity.environment_id,
                    version = event.entity.version,
                    "Config changed"
                ),
                Err(e) => tracing::warn!(project = %project_id, error = %e, "Change stream error"),
            }
        }
        tracing::debug!(project = %project_id, "Change stream ended");
    });
}

/// Prunes the event log every half retention window, at most hourly.
fn spawn_pruner(log: EventLog, retention: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let period = (retention / 2).clamp(Duration::from_secs(60), Duration::from_secs(3600));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match log.prune(retention) {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => info!(
                        "Pruned {} log events, destroyed {} consumers",
                        report.events_deleted,
                        report.consumers_destroyed
                    ),
                    Err(e) => log::warn!("Event log prune failed: {}", e),
                },
            }
        }
    })
}
