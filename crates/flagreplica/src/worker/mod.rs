pub mod coalescing;
pub mod job;

pub use coalescing::{CoalescingReplicaWorker, WorkerHandle, WorkerSettings};
pub use job::{Job, PendingWork};
