//! Per-caller fixed-window rate limiter.
//!
//! Windows are independent per caller identifier. A burst straddling a
//! window boundary can admit up to twice `max_requests`; that is accepted
//! in exchange for O(1) state per caller.

use crate::resource::MemoryProbe;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the adaptive limiter samples memory.
pub const PRESSURE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Utilization above which the adaptive limiter starts scaling down.
const PRESSURE_THRESHOLD: f64 = 0.7;

/// Largest fraction of `max_requests` the adaptive limiter removes.
const MAX_REDUCTION: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    window_end: Instant,
}

impl RateWindow {
    fn start(now: Instant, length: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            window_end: now + length,
        }
    }
}

/// Outcome of [`RateLimiter::check_limit`].
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Seconds until the window resets; set only when rejected.
    pub retry_after: Option<u64>,
}

/// Snapshot of one caller's window.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub count: u32,
    pub limit: u32,
    pub elapsed: Duration,
    pub resets_in: Duration,
}

struct PressureSampler {
    probe: Arc<dyn MemoryProbe>,
    budget_bytes: u64,
    last_sample: Mutex<Option<Instant>>,
}

/// Fixed-window rate limiter keyed by caller identifier.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    /// `max_requests` after adaptive scaling.
    effective_max: AtomicU32,
    windows: DashMap<String, RateWindow>,
    pressure: Option<PressureSampler>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            effective_max: AtomicU32::new(max_requests),
            windows: DashMap::new(),
            pressure: None,
        }
    }

    /// Rate limiter that scales `max_requests` down by up to 50% when
    /// process memory approaches `budget_bytes`.
    pub fn adaptive(
        max_requests: u32,
        window: Duration,
        probe: Arc<dyn MemoryProbe>,
        budget_bytes: u64,
    ) -> Self {
        Self {
            pressure: Some(PressureSampler {
                probe,
                budget_bytes: budget_bytes.max(1),
                last_sample: Mutex::new(None),
            }),
            ..Self::new(max_requests, window)
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn effective_max(&self) -> u32 {
        self.effective_max.load(Ordering::Relaxed)
    }

    /// Count a request from `identifier` and decide whether it is admitted.
    pub fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        self.sample_if_due();

        let limit = self.effective_max();
        let now = Instant::now();

        let (allowed, window) = match self.windows.entry(identifier.to_string()) {
            Entry::Vacant(vacant) => {
                let window = RateWindow::start(now, self.window);
                vacant.insert(window);
                (true, window)
            }
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if now >= window.window_end {
                    *window = RateWindow::start(now, self.window);
                    (true, *window)
                } else if window.count < limit {
                    window.count += 1;
                    (true, *window)
                } else {
                    (false, *window)
                }
            }
        };

        let resets_in = window.window_end.saturating_duration_since(now);
        let reset_at = Utc::now()
            + chrono::Duration::from_std(resets_in).unwrap_or_else(|_| chrono::Duration::zero());

        if allowed {
            RateLimitDecision {
                allowed,
                limit,
                remaining: limit.saturating_sub(window.count),
                reset_at,
                retry_after: None,
            }
        } else {
            let retry_after = u64::try_from(resets_in.as_millis().div_ceil(1000)).unwrap_or(u64::MAX);
            warn!(
                "Rate limit exceeded for {}: {}/{} requests, retry after {}s",
                identifier, window.count, limit, retry_after
            );
            RateLimitDecision {
                allowed,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
            }
        }
    }

    /// Clear a caller's window immediately.
    pub fn reset(&self, identifier: &str) {
        if self.windows.remove(identifier).is_some() {
            info!("Rate limit window reset for {}", identifier);
        }
    }

    pub fn status(&self, identifier: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        self.windows.get(identifier).and_then(|window| {
            (now < window.window_end).then(|| RateLimitStatus {
                count: window.count,
                limit: self.effective_max(),
                elapsed: now.saturating_duration_since(window.window_start),
                resets_in: window.window_end.saturating_duration_since(now),
            })
        })
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows whose reset time has passed. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.window_end);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("Rate limiter cleanup removed {} expired windows", removed);
        }
        removed
    }

    /// Re-read memory pressure and recompute the effective limit.
    pub fn sample_pressure(&self) {
        let Some(sampler) = &self.pressure else {
            return;
        };
        *sampler.last_sample.lock() = Some(Instant::now());

        let used = sampler.probe.process_memory_bytes();
        let utilization = used as f64 / sampler.budget_bytes as f64;
        let scaled = (self.max_requests as f64 * pressure_scale(utilization)).floor() as u32;
        let effective = scaled.clamp(1, self.max_requests.max(1));

        let previous = self.effective_max.swap(effective, Ordering::Relaxed);
        if previous != effective {
            info!(
                "Adaptive rate limit changed {} -> {} (memory utilization {:.0}%)",
                previous,
                effective,
                utilization * 100.0
            );
        }
    }

    fn sample_if_due(&self) {
        let Some(sampler) = &self.pressure else {
            return;
        };
        let due = sampler
            .last_sample
            .lock()
            .is_none_or(|at| at.elapsed() >= PRESSURE_SAMPLE_INTERVAL);
        if due {
            self.sample_pressure();
        }
    }

    /// Spawn a background task that sweeps expired windows every `interval`
    /// and refreshes memory pressure. It stops once the limiter is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.cleanup();
                limiter.sample_pressure();
            }
        })
    }
}

/// Multiplier applied to `max_requests` at a given memory utilization.
fn pressure_scale(utilization: f64) -> f64 {
    if utilization <= PRESSURE_THRESHOLD {
        return 1.0;
    }
    let over = ((utilization - PRESSURE_THRESHOLD) / (1.0 - PRESSURE_THRESHOLD)).min(1.0);
    1.0 - MAX_REDUCTION * over
}

/// Rate limiter builder.
pub struct RateLimiterBuilder {
    max_requests: u32,
    window: Duration,
    adaptive: Option<(Arc<dyn MemoryProbe>, u64)>,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_millis(60_000),
            adaptive: None,
        }
    }
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn adaptive(mut self, probe: Arc<dyn MemoryProbe>, budget_bytes: u64) -> Self {
        self.adaptive = Some((probe, budget_bytes));
        self
    }

    pub fn build(self) -> RateLimiter {
        match self.adaptive {
            Some((probe, budget)) => {
                RateLimiter::adaptive(self.max_requests, self.window, probe, budget)
            }
            None => RateLimiter::new(self.max_requests, self.window),
        }
    }
}
