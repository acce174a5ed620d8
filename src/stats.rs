//! Request statistics
//!
//! Monotonic counters plus a running mean of processing latency. Counters
//! are atomic; the mean is read-modify-write without a lock, so concurrent
//! updates may lose precision. That is tolerated: the mean is informational.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Shared request counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    total: AtomicI64,
    success: AtomicI64,
    failure: AtomicI64,
    avg_processing_ns: AtomicU64,
}

/// Point-in-time view of the counters, served on `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub avg_processing_ns: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request with its wall-clock latency.
    pub fn record(&self, elapsed: Duration, success: bool) {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }

        // avg <- avg + (sample - avg) / total
        let sample = elapsed.as_nanos() as i64;
        let avg = self.avg_processing_ns.load(Ordering::Relaxed) as i64;
        let updated = avg + (sample - avg) / total;
        self.avg_processing_ns
            .store(updated.max(0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            avg_processing_ns: self.avg_processing_ns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_add_up() {
        let stats = ServerStats::new();
        stats.record(Duration::from_millis(10), true);
        stats.record(Duration::from_millis(20), false);
        stats.record(Duration::from_millis(30), true);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.total, snap.success + snap.failure);
    }

    #[test]
    fn running_mean_tracks_samples() {
        let stats = ServerStats::new();
        stats.record(Duration::from_nanos(100), true);
        assert_eq!(stats.snapshot().avg_processing_ns, 100);

        stats.record(Duration::from_nanos(300), true);
        // 100 + (300 - 100) / 2
        assert_eq!(stats.snapshot().avg_processing_ns, 200);
    }

    #[test]
    fn snapshot_serializes_expected_fields() {
        let stats = ServerStats::new();
        stats.record(Duration::from_millis(5), true);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["success"], 1);
        assert_eq!(json["failure"], 0);
        assert!(json["avg_processing_ns"].as_u64().unwrap() > 0);
    }
}
