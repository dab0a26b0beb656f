//! Shared test utilities for flagreplica integration tests.
//!
//! This module provides:
//! - `FakeSource`, an in-memory source of truth
//! - `FakeBroker`, an in-memory LISTEN/NOTIFY server for the transport
//! - transport wiring, builders and async wait helpers

pub mod builders;
pub mod notify;
pub mod source;
pub mod transport;

pub use builders::*;
pub use notify::FakeBroker;
pub use source::FakeSource;

#[allow(dead_code)]
pub mod wait {
    use std::time::Duration;

    use futures_util::{Stream, StreamExt};

    use flagreplica::{BusError, ChangeEvent};

    pub const TIMEOUT: Duration = Duration::from_secs(5);

    /// Polls `condition` until it holds. Panics after [`TIMEOUT`].
    pub async fn until<F>(what: &str, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                what
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Next change event of a watch stream. Panics on error, end or timeout.
    pub async fn next_event<S>(events: &mut S) -> ChangeEvent
    where
        S: Stream<Item = Result<ChangeEvent, BusError>> + Unpin,
    {
        tokio::time::timeout(TIMEOUT, events.next())
            .await
            .expect("timed out waiting for a change event")
            .expect("change stream ended")
            .expect("change stream failed")
    }

    /// Next raw item of a watch stream, `None` when it ended.
    pub async fn next_item<S>(events: &mut S) -> Option<Result<ChangeEvent, BusError>>
    where
        S: Stream<Item = Result<ChangeEvent, BusError>> + Unpin,
    {
        tokio::time::timeout(TIMEOUT, events.next())
            .await
            .expect("timed out waiting for the change stream")
    }
}
