//! Wall-clock and memory budgets for a unit of work.
//!
//! The tracker can only stop waiting: it drops the wrapped future when a
//! budget is exceeded. Whatever that future already sent to the database
//! keeps running unless the transport reacts to being dropped (the direct
//! driver does, by issuing a cancel request; the RPC path cannot).

use crate::config::ResourceConfig;
use crate::error::ResourceError;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of process memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the current process, in bytes.
    fn process_memory_bytes(&self) -> u64;

    fn process_memory_mb(&self) -> u64 {
        self.process_memory_bytes() / BYTES_PER_MB
    }
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn process_memory_bytes(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return 0;
        }
        system.process(pid).map_or(0, |process| process.memory())
    }
}

/// Observability snapshot for one tracked unit of work.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceStats {
    pub execution_time_ms: u64,
    pub current_memory_mb: u64,
    pub peak_memory_mb: u64,
}

/// Enforces [`ResourceConfig`] budgets around a single future.
pub struct ResourceTracker {
    limits: ResourceConfig,
    probe: Arc<dyn MemoryProbe>,
    started: Mutex<Option<Instant>>,
    finished: Mutex<Option<Duration>>,
    current_mb: AtomicU64,
    peak_mb: AtomicU64,
}

impl ResourceTracker {
    pub fn new(limits: ResourceConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            limits,
            probe,
            started: Mutex::new(None),
            finished: Mutex::new(None),
            current_mb: AtomicU64::new(0),
            peak_mb: AtomicU64::new(0),
        }
    }

    /// Run `work`, failing once elapsed time or process memory exceeds the limits.
    ///
    /// Both limits are checked every `check_interval`; the deadline is also
    /// enforced exactly, so a short budget is not rounded up to the interval.
    pub async fn track<F, T>(&self, work: F) -> Result<T, ResourceError>
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();
        *self.started.lock() = Some(start);
        *self.finished.lock() = None;
        self.sample_memory();

        let max_ms = duration_ms(self.limits.max_execution_time);
        let deadline = tokio::time::sleep(self.limits.max_execution_time);
        tokio::pin!(deadline);
        tokio::pin!(work);

        // `interval` panics on a zero period.
        let period = self.limits.check_interval.max(MIN_CHECK_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                output = &mut work => break Ok(output),
                _ = &mut deadline => {
                    break Err(ResourceError::ExecutionTimeExceeded {
                        elapsed_ms: duration_ms(start.elapsed()),
                        max_ms,
                    });
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check(start) {
                        break Err(e);
                    }
                }
            }
        };

        *self.finished.lock() = Some(start.elapsed());
        match &outcome {
            Ok(_) => debug!("Tracked work finished: {:?}", self.stats()),
            Err(e) => warn!("Tracked work aborted: {}", e),
        }
        outcome
    }

    fn check(&self, start: Instant) -> Result<(), ResourceError> {
        let elapsed = start.elapsed();
        if elapsed > self.limits.max_execution_time {
            return Err(ResourceError::ExecutionTimeExceeded {
                elapsed_ms: duration_ms(elapsed),
                max_ms: duration_ms(self.limits.max_execution_time),
            });
        }

        let current_mb = self.sample_memory();
        if current_mb > self.limits.max_memory_mb {
            return Err(ResourceError::MemoryLimitExceeded {
                current_mb,
                max_mb: self.limits.max_memory_mb,
            });
        }
        Ok(())
    }

    fn sample_memory(&self) -> u64 {
        let current = self.probe.process_memory_mb();
        self.current_mb.store(current, Ordering::Relaxed);
        self.peak_mb.fetch_max(current, Ordering::Relaxed);
        current
    }

    pub fn stats(&self) -> ResourceStats {
        let execution_time = match (*self.finished.lock(), *self.started.lock()) {
            (Some(total), _) => total,
            (None, Some(start)) => start.elapsed(),
            (None, None) => Duration::ZERO,
        };
        ResourceStats {
            execution_time_ms: duration_ms(execution_time),
            current_memory_mb: self.current_mb.load(Ordering::Relaxed),
            peak_memory_mb: self.peak_mb.load(Ordering::Relaxed),
        }
    }
}

/// Floor applied to the sampling period.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(AtomicU64);

    impl FixedProbe {
        fn mb(mb: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(mb * BYTES_PER_MB)))
        }
    }

    impl MemoryProbe for FixedProbe {
        fn process_memory_bytes(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn limits(max_ms: u64, max_mb: u64) -> ResourceConfig {
        ResourceConfig {
            max_execution_time: Duration::from_millis(max_ms),
            max_memory_mb: max_mb,
            check_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_completes_within_budget() {
        let tracker = ResourceTracker::new(limits(1000, 256), FixedProbe::mb(64));
        let value = tracker.track(async { 42 }).await.unwrap();
        assert_eq!(value, 42);

        let stats = tracker.stats();
        assert_eq!(stats.current_memory_mb, 64);
        assert_eq!(stats.peak_memory_mb, 64);
    }

    #[tokio::test]
    async fn test_execution_time_exceeded() {
        let tracker = ResourceTracker::new(limits(30, 256), FixedProbe::mb(64));
        let result = tracker
            .track(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(
            result,
            Err(ResourceError::ExecutionTimeExceeded { max_ms: 30, .. })
        ));
        assert!(tracker.stats().execution_time_ms >= 30);
    }

    #[tokio::test]
    async fn test_memory_limit_exceeded() {
        let probe = FixedProbe::mb(64);
        let tracker = ResourceTracker::new(limits(5000, 128), probe.clone());
        let raise = async {
            tokio::time::sleep(Duration::from_millis(15)).await;
            probe.0.store(512 * BYTES_PER_MB, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_secs(5)).await;
        };
        let result = tracker.track(raise).await;
        assert!(matches!(
            result,
            Err(ResourceError::MemoryLimitExceeded {
                current_mb: 512,
                max_mb: 128
            })
        ));
        assert_eq!(tracker.stats().peak_memory_mb, 512);
    }

    #[tokio::test]
    async fn test_dropped_work_is_not_polled_again() {
        let polled_to_end = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&polled_to_end);
        let tracker = ResourceTracker::new(limits(20, 256), FixedProbe::mb(1));
        let _ = tracker
            .track(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!polled_to_end.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_check_interval_does_not_panic() {
        let mut zero = limits(1000, 256);
        zero.check_interval = Duration::ZERO;
        let tracker = ResourceTracker::new(zero, FixedProbe::mb(8));
        let value = tracker
            .track(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                7
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_system_probe_reports_memory() {
        let probe = SystemMemoryProbe::new();
        assert!(probe.process_memory_bytes() > 0);
    }
}
