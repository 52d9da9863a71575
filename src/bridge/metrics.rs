// ABOUTME: Counters for connection pool activity
//
// Tracks:
// - Connections: created, destroyed, recycled
// - Health: probe failures
// - Callers: leaked handles, acquire timeouts

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pool-level metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub recycled: AtomicU64,
    pub probe_failures: AtomicU64,
    pub leaked_handles: AtomicU64,
    pub acquire_timeouts: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub destroyed: u64,
    pub recycled: u64,
    pub probe_failures: u64,
    pub leaked_handles: u64,
    pub acquire_timeouts: u64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_failed(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_leaked(&self) {
        self.leaked_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquire_timed_out(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            leaked_handles: self.leaked_handles.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }
}
