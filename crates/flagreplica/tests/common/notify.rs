//! In-memory LISTEN/NOTIFY server.
//!
//! `FakeBroker::connector()` hands out sessions to a
//! `ChangeNotificationTransport`; tests publish through the broker and can
//! drop every live session to force a reconnect.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use flagreplica::transport::{
    NotifyConnector, NotifySession, RawNotification, Result, TransportError,
};

enum Delivery {
    Notification(RawNotification),
    Disconnect,
}

struct SessionSlot {
    channels: HashSet<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<usize, SessionSlot>,
    next_id: usize,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    connects: Arc<AtomicUsize>,
    failing_connects: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn NotifyConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    /// Delivers to every session listening on `channel`; returns how many.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let state = self.state.lock().unwrap();
        let mut delivered = 0;
        for slot in state.sessions.values() {
            if slot.channels.contains(channel) {
                let raw = RawNotification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                };
                if slot.sender.send(Delivery::Notification(raw)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Breaks every live session, as a server restart would.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, slot) in state.sessions.drain() {
            let _ = slot.sender.send(Delivery::Disconnect);
        }
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Sessions currently listening on `channel`.
    pub fn listeners(&self, channel: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|slot| slot.channels.contains(channel))
            .count()
    }
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl NotifyConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn NotifySession>> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .broker
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.sessions.insert(
            id,
            SessionSlot {
                channels: HashSet::new(),
                sender,
            },
        );
        Ok(Box::new(FakeSession {
            id,
            broker: self.broker.clone(),
            receiver,
        }))
    }
}

struct FakeSession {
    id: usize,
    broker: FakeBroker,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl FakeSession {
    fn with_slot<T>(&self, f: impl FnOnce(&mut SessionSlot) -> T) -> Result<T> {
        let mut state = self.broker.state.lock().unwrap();
        state
            .sessions
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| TransportError::ConnectionLost("session closed".to_string()))
    }
}

#[async_trait]
impl NotifySession for FakeSession {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.with_slot(|slot| {
            slot.channels.insert(channel.to_string());
        })
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.with_slot(|slot| {
            slot.channels.remove(channel);
        })
    }

    async fn recv(&mut self) -> Result<RawNotification> {
        match self.receiver.recv().await {
            Some(Delivery::Notification(raw)) => Ok(raw),
            Some(Delivery::Disconnect) | None => Err(TransportError::ConnectionLost(
                "server closed the connection".to_string(),
            )),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.with_slot(|_| ())
    }

    async fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.with_slot(|_| ())?;
        self.broker.publish(channel, payload);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.broker.state.lock() {
            state.sessions.remove(&self.id);
        }
    }
}
