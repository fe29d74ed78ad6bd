//! Send-to-response latency correlation.
//!
//! Responses are matched to sends by the echoed `request_id`. Entries whose
//! response never arrives are evicted once older than the TTL.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct LatencyTracker {
    pending: DashMap<String, Instant>,
    ttl: Duration,
}

impl LatencyTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn record_sent(&self, request_id: &str) {
        self.pending.insert(request_id.to_string(), Instant::now());
    }

    /// Elapsed time since the matching send, if one is pending.
    pub fn complete(&self, request_id: &str) -> Option<Duration> {
        self.pending
            .remove(request_id)
            .map(|(_, sent_at)| sent_at.elapsed())
    }

    /// Drop entries older than the TTL. Returns how many were evicted.
    pub fn purge_stale(&self) -> usize {
        let before = self.pending.len();
        let now = Instant::now();
        self.pending
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < self.ttl);
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
