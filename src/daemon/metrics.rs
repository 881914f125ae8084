//! Lock-free daemon counters, snapshotted into the wire `Metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::Metrics;

/// Monotonic counter storage. All counters use relaxed atomics; callers
/// bump them with `fetch_add(1, Ordering::Relaxed)` and the status path
/// reads a point-in-time snapshot.
#[derive(Debug, Default)]
pub struct MetricsStorage {
    pub requests: AtomicU64,
    pub forks: AtomicU64,
    pub migrations: AtomicU64,
    pub hibernations: AtomicU64,
    pub cold_starts: AtomicU64,
    freezes: AtomicU64,
    freeze_total_ms: AtomicU64,
    thaws: AtomicU64,
    thaw_total_ms: AtomicU64,
}

impl MetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_freeze(&self, duration_ms: i64) {
        self.freezes.fetch_add(1, Ordering::Relaxed);
        self.freeze_total_ms
            .fetch_add(duration_ms.max(0) as u64, Ordering::Relaxed);
    }

    pub fn record_thaw(&self, duration_ms: i64) {
        self.thaws.fetch_add(1, Ordering::Relaxed);
        self.thaw_total_ms
            .fetch_add(duration_ms.max(0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Metrics {
        let freezes = self.freezes.load(Ordering::Relaxed);
        let thaws = self.thaws.load(Ordering::Relaxed);
        Metrics {
            requests: self.requests.load(Ordering::Relaxed),
            freezes,
            thaws,
            forks: self.forks.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            hibernations: self.hibernations.load(Ordering::Relaxed),
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            avg_freeze_ms: average(self.freeze_total_ms.load(Ordering::Relaxed), freezes),
            avg_thaw_ms: average(self.thaw_total_ms.load(Ordering::Relaxed), thaws),
        }
    }
}

fn average(total_ms: u64, count: u64) -> i64 {
    if count == 0 {
        0
    } else {
        (total_ms / count) as i64
    }
}
