//! Resilient LISTEN/NOTIFY client.
//!
//! A single supervisor task owns the one live [`NotifySession`]. It
//! subscribes to every tracked channel before reporting itself connected,
//! health-checks the session on a timer, and on any failure tears the session
//! down and reconnects with [`BackoffPolicy`] delays. Callers interact with it
//! through a command queue and shared handler lists.

pub mod backoff;
pub mod error;
pub mod postgres;
pub mod session;

use std::collections::{BTreeSet, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use backoff::BackoffPolicy;
pub use error::{Result, TransportError};
pub use postgres::{PgNotifyConnector, PgNotifySession};
pub use session::{NotifyConnector, NotifySession, RawNotification};

/// A delivered notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    /// Parsed JSON payload; `None` when empty or not JSON.
    pub payload: Option<JsonValue>,
    pub raw_payload: String,
}

impl Notification {
    fn from_raw(raw: RawNotification) -> Self {
        let payload = if raw.payload.trim().is_empty() {
            None
        } else {
            match serde_json::from_str(&raw.payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::debug!(
                        "Notification on '{}' is not JSON ({}), passing raw payload",
                        raw.channel,
                        e
                    );
                    None
                }
            }
        };
        Self {
            channel: raw.channel,
            payload,
            raw_payload: raw.payload,
        }
    }
}

/// Callback for delivered notifications. An `Err` is reported, not fatal.
pub type NotificationHandler =
    Arc<dyn Fn(&Notification) -> std::result::Result<(), String> + Send + Sync>;

/// Callback for transport and handler errors.
pub type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Timing of the transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub backoff: BackoffPolicy,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub call_timeout: Duration,
    /// Buffer of the [`ChangeNotificationTransport::subscribe`] channel.
    pub broadcast_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            health_check_interval: Duration::from_secs(15),
            health_check_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(5),
            broadcast_capacity: 256,
        }
    }
}

enum Command {
    Listen(String),
    Unlisten(String),
    Notify {
        channel: String,
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct Shared {
    channels: Mutex<BTreeSet<String>>,
    handlers: RwLock<Vec<NotificationHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    notifications: broadcast::Sender<Notification>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn channels(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, raw: RawNotification) {
        let notification = Notification::from_raw(raw);
        log::trace!("Notification on '{}'", notification.channel);

        // No receivers is fine.
        let _ = self.notifications.send(notification.clone());

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&notification)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => message,
                Err(panic) => panic_message(&*panic),
            };
            self.report(TransportError::HandlerFailed {
                channel: notification.channel.clone(),
                message,
            });
        }
    }

    fn report(&self, err: TransportError) {
        log::error!("{}", err);
        let handlers = self
            .error_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&err))).is_err() {
                log::error!("Transport error handler panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pub/sub client over the store's native notification channel.
pub struct ChangeNotificationTransport {
    connector: Arc<dyn NotifyConnector>,
    settings: TransportSettings,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ChangeNotificationTransport {
    pub fn new(connector: Arc<dyn NotifyConnector>, settings: TransportSettings) -> Self {
        let (notifications, _) = broadcast::channel(settings.broadcast_capacity.max(1));
        let (connected, _) = watch::channel(false);
        Self {
            connector,
            settings,
            shared: Arc::new(Shared {
                channels: Mutex::new(BTreeSet::new()),
                handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                notifications,
                connected,
            }),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the supervisor. Calling it while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            return;
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        log::info!("Notification transport started");
        *running = Some(Running {
            commands,
            cancel,
            handle,
        });
    }

    /// Stops the supervisor and waits for it to release the session.
    /// Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        drop(running.commands);
        if let Err(e) = running.handle.await {
            log::error!("Notification supervisor task failed: {}", e);
        }
        self.shared.connected.send_replace(false);
        log::info!("Notification transport stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Tracks `name` and listens on it now if connected, else on connect.
    pub fn add_channel(&self, name: &str) -> Result<()> {
        validate_channel(name)?;
        if self.shared.channels().insert(name.to_string()) {
            log::debug!("Tracking notification channel '{}'", name);
            self.send(Command::Listen(name.to_string()));
        }
        Ok(())
    }

    /// Stops tracking `name`.
    pub fn remove_channel(&self, name: &str) -> Result<()> {
        validate_channel(name)?;
        if self.shared.channels().remove(name) {
            log::debug!("Untracking notification channel '{}'", name);
            self.send(Command::Unlisten(name.to_string()));
        }
        Ok(())
    }

    pub fn channels(&self) -> Vec<String> {
        self.shared.channels().iter().cloned().collect()
    }

    fn send(&self, command: Command) {
        if let Some(running) = self.running().as_ref() {
            // Closed only while the supervisor is exiting; the channel set is
            // re-applied on the next start.
            let _ = running.commands.send(command);
        }
    }

    /// Publishes `payload` on `channel` through the live session.
    pub async fn notify(&self, channel: &str, payload: Option<&JsonValue>) -> Result<()> {
        validate_channel(channel)?;
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let payload = payload.map(|p| p.to_string()).unwrap_or_default();
        let (reply, response) = oneshot::channel();
        {
            let running = self.running();
            let running = running.as_ref().ok_or(TransportError::Stopped)?;
            running
                .commands
                .send(Command::Notify {
                    channel: channel.to_string(),
                    payload,
                    reply,
                })
                .map_err(|_| TransportError::Stopped)?;
        }

        match tokio::time::timeout(self.settings.call_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout(format!("notify on '{}'", channel))),
        }
    }

    /// Registers a callback invoked for every notification.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&Notification) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Registers a callback for connection and handler errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.shared
            .error_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Stream of every notification received after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Waits until the supervisor reports a live, subscribed session.
    ///
    /// Concurrent callers all wait on the same connect attempt.
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Err(TransportError::Stopped);
        }
        let mut connected = self.shared.connected.subscribe();
        let waited = tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Stopped),
            Err(_) => Err(TransportError::Timeout("waiting for connection".to_string())),
        }
    }
}

fn validate_channel(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidChannel(name.to_string()))
    }
}

enum SessionEnd {
    Stopped,
    Failed(TransportError),
}

struct Supervisor {
    connector: Arc<dyn NotifyConnector>,
    settings: TransportSettings,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok((session, listening)) => {
                    attempt = 0;
                    self.shared.connected.send_replace(true);
                    log::info!("Notification session connected ({} channels)", listening.len());

                    let end = self.serve(session, listening).await;
                    self.shared.connected.send_replace(false);
                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Failed(err) => self.shared.report(err),
                    }
                }
                Err(err) => self.shared.report(err),
            }

            attempt = attempt.saturating_add(1);
            let delay = self.settings.backoff.delay(attempt);
            log::warn!(
                "Reconnecting notification session in {}ms (attempt {})",
                delay.as_millis(),
                attempt
            );
            if !self.wait_disconnected(delay).await {
                break;
            }
        }

        self.shared.connected.send_replace(false);
        log::debug!("Notification supervisor exited");
    }

    /// Connects and listens on every tracked channel.
    async fn connect(&self) -> Result<(Box<dyn NotifySession>, HashSet<String>)> {
        let call_timeout = self.settings.call_timeout;
        let mut session = tokio::time::timeout(call_timeout, self.connector.connect())
            .await
            .map_err(|_| TransportError::Timeout("connect".to_string()))??;

        let channels: Vec<String> = self.shared.channels().iter().cloned().collect();
        let mut listening = HashSet::with_capacity(channels.len());
        for channel in channels {
            tokio::time::timeout(call_timeout, session.listen(&channel))
                .await
                .map_err(|_| TransportError::Timeout(format!("LISTEN {}", channel)))??;
            listening.insert(channel);
        }
        Ok((session, listening))
    }

    async fn serve(
        &mut self,
        mut session: Box<dyn NotifySession>,
        mut listening: HashSet<String>,
    ) -> SessionEnd {
        let mut health = tokio::time::interval(self.settings.health_check_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health.tick().await;

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Stopped,
                received = session.recv() => match received {
                    Ok(raw) => self.shared.dispatch(raw),
                    Err(err) => break SessionEnd::Failed(err),
                },
                Some(command) = self.commands.recv() => {
                    let executed = self.execute(session.as_mut(), &mut listening, command).await;
                    if let Err(err) = executed {
                        break SessionEnd::Failed(err);
                    }
                }
                _ = health.tick() => {
                    let timeout = self.settings.health_check_timeout;
                    match tokio::time::timeout(timeout, session.ping()).await {
                        Ok(Ok(())) => log::trace!("Notification session healthy"),
                        Ok(Err(err)) => break SessionEnd::Failed(err),
                        Err(_) => break SessionEnd::Failed(
                            TransportError::HealthCheckTimeout(timeout.as_millis() as u64),
                        ),
                    }
                }
            }
        };

        self.teardown(session, listening).await;
        end
    }

    async fn execute(
        &self,
        session: &mut dyn NotifySession,
        listening: &mut HashSet<String>,
        command: Command,
    ) -> Result<()> {
        let call_timeout = self.settings.call_timeout;
        match command {
            Command::Listen(channel) => {
                if !listening.contains(&channel) {
                    tokio::time::timeout(call_timeout, session.listen(&channel))
                        .await
                        .map_err(|_| TransportError::Timeout(format!("LISTEN {}", channel)))??;
                    listening.insert(channel);
                }
                Ok(())
            }
            Command::Unlisten(channel) => {
                if listening.remove(&channel) {
                    tokio::time::timeout(call_timeout, session.unlisten(&channel))
                        .await
                        .map_err(|_| TransportError::Timeout(format!("UNLISTEN {}", channel)))??;
                }
                Ok(())
            }
            Command::Notify {
                channel,
                payload,
                reply,
            } => {
                let result = tokio::time::timeout(call_timeout, session.notify(&channel, &payload))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::Timeout(format!("NOTIFY {}", channel)))
                    });
                let _ = reply.send(result.clone());
                match result {
                    Err(err @ (TransportError::ConnectionLost(_) | TransportError::Timeout(_))) => {
                        Err(err)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Best-effort UNLISTEN of every channel before dropping the session.
    async fn teardown(&self, mut session: Box<dyn NotifySession>, listening: HashSet<String>) {
        let call_timeout = self.settings.call_timeout;
        for channel in listening {
            match tokio::time::timeout(call_timeout, session.unlisten(&channel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("UNLISTEN {} during teardown failed: {}", channel, e),
                Err(_) => {
                    log::debug!("UNLISTEN {} during teardown timed out", channel);
                    break;
                }
            }
        }
        drop(session);
    }

    /// Sleeps out a backoff delay, rejecting notify calls meanwhile.
    /// Returns false when cancelled.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    if let Command::Notify { reply, .. } = command {
                        let _ = reply.send(Err(TransportError::NotConnected));
                    }
                    // Listen/Unlisten are applied from the channel set on connect.
                }
            }
        }
    }
}
