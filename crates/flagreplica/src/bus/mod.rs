//! Per-project fan-out of replica change events.
//!
//! Each project with at least one live subscriber owns a tokio broadcast
//! channel. Events are routed by project only, so a subscriber never sees
//! another project's changes. Lifecycle misuse (publishing or subscribing
//! after completion) is a caller bug and panics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::ChangeEvent;

/// Errors observed by a single subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The subscriber fell behind and missed events.
    #[error("Subscriber lagged behind and missed {0} events")]
    Lagged(u64),

    /// The bus was terminated with an error.
    #[error("Change stream failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
enum BusMessage {
    Event(ChangeEvent),
    Error(String),
}

struct Channel {
    sender: broadcast::Sender<BusMessage>,
    subscribers: usize,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, Channel>,
    completed: bool,
}

struct BusInner {
    state: Mutex<BusState>,
    capacity: usize,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, project_id: &str) {
        let mut state = self.lock();
        let remove = match state.channels.get_mut(project_id) {
            Some(channel) => {
                channel.subscribers = channel.subscribers.saturating_sub(1);
                channel.subscribers == 0
            }
            None => false,
        };
        if remove {
            state.channels.remove(project_id);
            log::debug!("Closed change channel for project {}", project_id);
        }
    }
}

/// Fans change events out to per-project subscribers.
#[derive(Clone)]
pub struct ChangeEventBus {
    inner: Arc<BusInner>,
}

impl ChangeEventBus {
    /// Creates a bus whose per-project channels buffer `capacity` events.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bus capacity must be > 0");
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                capacity,
            }),
        }
    }

    /// Subscribes to the events of one project.
    ///
    /// # Panics
    /// Panics if the bus has completed.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        let mut state = self.inner.lock();
        assert!(!state.completed, "subscribe() on a completed change bus");

        let capacity = self.inner.capacity;
        let channel = state
            .channels
            .entry(project_id.to_string())
            .or_insert_with(|| {
                log::debug!("Opened change channel for project {}", project_id);
                let (sender, _) = broadcast::channel(capacity);
                Channel {
                    sender,
                    subscribers: 0,
                }
            });
        channel.subscribers += 1;

        Subscription {
            project_id: project_id.to_string(),
            receiver: channel.sender.subscribe(),
            bus: Arc::clone(&self.inner),
        }
    }

    /// Publishes an event to the subscribers of its project.
    ///
    /// # Panics
    /// Panics if the bus has completed.
    pub fn next(&self, event: ChangeEvent) {
        let state = self.inner.lock();
        assert!(!state.completed, "next() on a completed change bus");

        if let Some(channel) = state.channels.get(event.project_id()) {
            // A send error only means every receiver is gone already.
            let _ = channel.sender.send(BusMessage::Event(event));
        }
    }

    /// Terminates every subscription with an error.
    ///
    /// # Panics
    /// Panics if the bus has completed.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.inner.lock();
        assert!(!state.completed, "error() on a completed change bus");

        log::error!("Change bus failed: {}", message);
        for channel in state.channels.values() {
            let _ = channel.sender.send(BusMessage::Error(message.clone()));
        }
        state.channels.clear();
        state.completed = true;
    }

    /// Ends every subscription normally.
    ///
    /// # Panics
    /// Panics if the bus has completed.
    pub fn complete(&self) {
        let mut state = self.inner.lock();
        assert!(!state.completed, "complete() on a completed change bus");

        state.channels.clear();
        state.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Number of projects with live subscribers.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Number of live subscribers for `project_id`.
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(project_id)
            .map(|c| c.subscribers)
            .unwrap_or(0)
    }
}

impl Default for ChangeEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live subscription to one project's changes. Dropping it unsubscribes.
pub struct Subscription {
    project_id: String,
    receiver: broadcast::Receiver<BusMessage>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the bus completes or after a terminal error has
    /// been delivered.
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, BusError>> {
        match self.receiver.recv().await {
            Ok(BusMessage::Event(event)) => Some(Ok(event)),
            Ok(BusMessage::Error(message)) => Some(Err(BusError::Failed(message))),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!(
                    "Subscriber for project {} lagged, {} events dropped",
                    self.project_id,
                    missed
                );
                Some(Err(BusError::Lagged(missed)))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Result<ChangeEvent, BusError>> {
        match self.receiver.try_recv() {
            Ok(BusMessage::Event(event)) => Some(Ok(event)),
            Ok(BusMessage::Error(message)) => Some(Err(BusError::Failed(message))),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(Err(BusError::Lagged(missed)))
            }
            Err(_) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReplicatedVariant;
    use serde_json::json;

    fn event(project: &str, name: &str) -> ChangeEvent {
        ChangeEvent::created(Arc::new(ReplicatedVariant {
            variant_id: format!("{}-{}", project, name),
            config_name: name.to_string(),
            project_id: project.to_string(),
            environment_id: "prod".to_string(),
            value: json!(true),
            overrides: vec![],
            version: 1,
            references: vec![],
        }))
    }

    #[test]
    fn test_events_routed_by_project() {
        let bus = ChangeEventBus::new(8);
        let mut a = bus.subscribe("A");
        let mut b = bus.subscribe("B");

        bus.next(event("A", "flag"));

        let received = a.try_recv().unwrap().unwrap();
        assert_eq!(received.entity.config_name, "flag");
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_every_subscriber_receives() {
        let bus = ChangeEventBus::new(8);
        let mut first = bus.subscribe("A");
        let mut second = bus.subscribe("A");

        bus.next(event("A", "flag"));

        assert!(first.try_recv().unwrap().is_ok());
        assert!(second.try_recv().unwrap().is_ok());
        assert_eq!(bus.subscriber_count("A"), 2);
    }

    #[test]
    fn test_channel_torn_down_with_last_subscriber() {
        let bus = ChangeEventBus::new(8);
        let first = bus.subscribe("A");
        let second = bus.subscribe("A");
        assert_eq!(bus.channel_count(), 1);

        drop(first);
        assert_eq!(bus.channel_count(), 1);
        drop(second);
        assert_eq!(bus.channel_count(), 0);

        // Publishing without subscribers is fine.
        bus.next(event("A", "flag"));
    }

    #[test]
    fn test_lagging_subscriber_isolated() {
        let bus = ChangeEventBus::new(2);
        let mut slow = bus.subscribe("A");
        let mut fast = bus.subscribe("A");

        bus.next(event("A", "one"));
        assert!(fast.try_recv().unwrap().is_ok());
        bus.next(event("A", "two"));
        assert!(fast.try_recv().unwrap().is_ok());
        bus.next(event("A", "three"));
        assert!(fast.try_recv().unwrap().is_ok());

        assert!(matches!(slow.try_recv(), Some(Err(BusError::Lagged(1)))));
        let caught_up = slow.try_recv().unwrap().unwrap();
        assert_eq!(caught_up.entity.config_name, "two");
    }

    #[tokio::test]
    async fn test_complete_ends_subscriptions() {
        let bus = ChangeEventBus::new(8);
        let mut sub = bus.subscribe("A");
        bus.next(event("A", "flag"));
        bus.complete();

        assert!(sub.recv().await.unwrap().is_ok());
        assert!(sub.recv().await.is_none());
        assert!(bus.is_completed());

        // Dropping after completion must not panic.
        drop(sub);
    }

    #[tokio::test]
    async fn test_error_reaches_every_channel() {
        let bus = ChangeEventBus::new(8);
        let mut a = bus.subscribe("A");
        let mut b = bus.subscribe("B");

        bus.error("source unreachable");

        assert_eq!(
            a.recv().await.unwrap().unwrap_err(),
            BusError::Failed("source unreachable".to_string())
        );
        assert!(b.recv().await.unwrap().is_err());
        assert!(a.recv().await.is_none());
    }

    #[test]
    #[should_panic(expected = "completed change bus")]
    fn test_next_after_complete_panics() {
        let bus = ChangeEventBus::new(8);
        bus.complete();
        bus.next(event("A", "flag"));
    }

    #[test]
    #[should_panic(expected = "completed change bus")]
    fn test_subscribe_after_complete_panics() {
        let bus = ChangeEventBus::new(8);
        bus.complete();
        let _sub = bus.subscribe("A");
    }

    #[test]
    #[should_panic(expected = "completed change bus")]
    fn test_double_complete_panics() {
        let bus = ChangeEventBus::new(8);
        bus.complete();
        bus.complete();
    }
}
