//! Transport wiring over a `FakeBroker`.

#![allow(dead_code)]

use std::time::Duration;

use flagreplica::transport::{BackoffPolicy, ChangeNotificationTransport, TransportSettings};

use super::notify::FakeBroker;

pub const CHANNEL: &str = "config_changes";

/// Fast, jitter-free reconnects.
pub fn fast_settings() -> TransportSettings {
    TransportSettings {
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_millis(50),
            jitter: 0.0,
        },
        ..TransportSettings::default()
    }
}

pub fn transport(broker: &FakeBroker) -> ChangeNotificationTransport {
    ChangeNotificationTransport::new(broker.connector(), fast_settings())
}

/// Starts `transport` and waits until its channels are subscribed.
pub async fn connect(transport: &ChangeNotificationTransport) {
    transport.start();
    transport
        .ensure_connected(super::wait::TIMEOUT)
        .await
        .expect("transport did not connect");
}
