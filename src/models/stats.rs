use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide request counters published to the metrics display
///
/// All fields are lock-free; `total_requests >= success_requests +
/// failed_requests` holds at all times modulo in-flight requests.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_requests: AtomicU64,
    active_conns: AtomicI64,
    success_requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub active_conns: i64,
    pub success_requests: u64,
    pub failed_requests: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            success_requests: self.success_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = ServerStats::new();

        stats.record_request();
        stats.record_request();
        stats.record_success();
        stats.record_failure();
        stats.conn_opened();
        stats.conn_opened();
        stats.conn_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.success_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.active_conns, 1);
    }

    #[test]
    fn test_stats_totals_cover_outcomes() {
        let stats = ServerStats::new();

        for i in 0..10 {
            stats.record_request();
            if i % 3 == 0 {
                stats.record_failure();
            } else {
                stats.record_success();
            }
        }

        let snap = stats.snapshot();
        assert!(snap.total_requests >= snap.success_requests + snap.failed_requests);
        assert_eq!(snap.success_requests + snap.failed_requests, 10);
    }
}
