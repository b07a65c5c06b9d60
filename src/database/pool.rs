//! Connection pool metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};

/// Pool metrics for monitoring.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub pools_created: AtomicU32,
    pub pool_resets: AtomicU32,
    pub connection_errors: AtomicU32,
    pub queries_executed: AtomicU32,
    pub query_errors: AtomicU32,
    pub cancellations: AtomicU32,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pool_created(&self) {
        self.pools_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_reset(&self) {
        self.pool_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_executed(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            pools_created: self.pools_created.load(Ordering::Relaxed),
            pool_resets: self.pool_resets.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub pools_created: u32,
    pub pool_resets: u32,
    pub connection_errors: u32,
    pub queries_executed: u32,
    pub query_errors: u32,
    pub cancellations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::new();
        metrics.record_query_executed();
        metrics.record_query_executed();
        metrics.record_query_error();
        metrics.record_pool_reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_executed, 2);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.pool_resets, 1);
        assert_eq!(snapshot.pools_created, 0);
    }
}
