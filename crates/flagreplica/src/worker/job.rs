//! Work items of the coalescing worker.

use std::collections::VecDeque;

/// One unit of replica work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Rebuild the whole store from a bulk dump.
    FullRefresh,
    /// Refetch one variant by id.
    Variant(String),
}

/// Queued hints plus the full-refresh flag.
///
/// Hints are not deduplicated: refetching an id twice is harmless.
#[derive(Debug, Default)]
pub struct PendingWork {
    queue: VecDeque<String>,
    full_refresh: bool,
}

impl PendingWork {
    pub fn push(&mut self, variant_id: String) {
        self.queue.push_back(variant_id);
    }

    pub fn request_full_refresh(&mut self) {
        self.full_refresh = true;
    }

    /// Next job to run. A pending full refresh drains the queue, since the
    /// dump covers every queued id.
    pub fn next_job(&mut self) -> Option<Job> {
        if self.full_refresh {
            self.full_refresh = false;
            self.queue.clear();
            return Some(Job::FullRefresh);
        }
        self.queue.pop_front().map(Job::Variant)
    }

    pub fn is_empty(&self) -> bool {
        !self.full_refresh && self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
