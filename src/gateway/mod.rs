//! The execution gateway: every statement from every caller passes through
//! [`Gateway::execute`].
//!
//! Admission order is rate limit, concurrency slot, text validation,
//! complexity, then tracked execution on whichever transport is viable.
//! Failures never escape as errors; they come back as
//! [`ExecutionResult::Error`].

use crate::config::{GatewayConfig, LimitConfig, ResourceConfig};
use crate::database::{ConnectionManager, ExecutionResult, QueryMode, Row};
use crate::error::{LimitError, Result};
use crate::resource::{MemoryProbe, ResourceTracker, SystemMemoryProbe};
use crate::security::{ComplexityAnalyzer, ConcurrencyLimiter, RateLimiter, SqlSanitizer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Caller intent for one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub read_only: bool,
    pub allow_multiple_statements: bool,
    pub caller_id: String,
    /// Skip the REST gateway and use the direct connection.
    pub prefer_direct: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            allow_multiple_statements: false,
            caller_id: "default".into(),
            prefer_direct: false,
        }
    }
}

impl ExecuteOptions {
    pub fn read_only(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            ..Self::default()
        }
    }

    pub fn mutating(caller_id: impl Into<String>) -> Self {
        Self {
            read_only: false,
            ..Self::read_only(caller_id)
        }
    }

    pub fn with_multiple_statements(mut self, allow: bool) -> Self {
        self.allow_multiple_statements = allow;
        self
    }

    pub fn with_prefer_direct(mut self, prefer: bool) -> Self {
        self.prefer_direct = prefer;
        self
    }

    fn mode(&self) -> QueryMode {
        QueryMode {
            read_only: self.read_only,
            multi_statement: self.allow_multiple_statements,
        }
    }
}

/// Interface consumed by tool handlers.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str, options: ExecuteOptions) -> ExecutionResult;
}

pub struct Gateway {
    sanitizer: SqlSanitizer,
    complexity: ComplexityAnalyzer,
    rate_limiter: Arc<RateLimiter>,
    concurrency: ConcurrencyLimiter,
    connection: Arc<ConnectionManager>,
    resources: ResourceConfig,
    probe: Arc<dyn MemoryProbe>,
    request_count: AtomicU64,
    maintenance: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn concurrency(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    pub fn sanitizer(&self) -> &SqlSanitizer {
        &self.sanitizer
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Whether the background rate-window sweep is running.
    pub fn maintenance_running(&self) -> bool {
        self.maintenance.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Validate and run `sql`, returning rows or a structured error.
    pub async fn execute(&self, sql: &str, options: ExecuteOptions) -> ExecutionResult {
        let result = self.try_execute(sql, &options).await;
        if let Err(e) = &result {
            warn!(caller = %options.caller_id, code = %e.code(), "Execution rejected: {}", e);
        }
        ExecutionResult::from(result)
    }

    #[instrument(
        skip(self, sql, options),
        fields(
            caller = %options.caller_id,
            read_only = options.read_only,
            request_id = tracing::field::Empty
        )
    )]
    async fn try_execute(&self, sql: &str, options: &ExecuteOptions) -> Result<Vec<Row>> {
        let request_id = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("request_id", request_id);

        let decision = self.rate_limiter.check_limit(&options.caller_id);
        if !decision.allowed {
            return Err(LimitError::RateLimited {
                limit: decision.limit,
                remaining: decision.remaining,
                retry_after_secs: decision.retry_after.unwrap_or(1),
            }
            .into());
        }

        let token = format!("req-{request_id}");
        let _permit = self.concurrency.try_permit(&options.caller_id, &token)?;

        self.sanitizer
            .validate(sql, options.allow_multiple_statements)?;
        let score = self.complexity.enforce(sql)?;
        debug!(
            "Admitted {} (complexity {}, {} requests left in window)",
            SqlSanitizer::normalize(sql),
            score,
            decision.remaining
        );

        let statement = SqlSanitizer::strip_trailing_semicolon(sql);
        let tracker = ResourceTracker::new(self.resources.clone(), Arc::clone(&self.probe));
        let rows = tracker
            .track(
                self.connection
                    .execute(statement, options.mode(), options.prefer_direct),
            )
            .await??;

        let stats = tracker.stats();
        info!(
            rows = rows.len(),
            elapsed_ms = stats.execution_time_ms,
            peak_memory_mb = stats.peak_memory_mb,
            "Statement executed"
        );
        Ok(rows)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SqlExecutor for Gateway {
    async fn execute(&self, sql: &str, options: ExecuteOptions) -> ExecutionResult {
        Gateway::execute(self, sql, options).await
    }
}

/// Builder wiring the gateway's collaborators from a [`GatewayConfig`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    connection: Option<Arc<ConnectionManager>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    maintenance: Maintenance,
}

/// How the expired-window sweep is scheduled.
enum Maintenance {
    /// Once per rate window.
    PerWindow,
    Every(Duration),
    Disabled,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            connection: None,
            rate_limiter: None,
            probe: None,
            maintenance: Maintenance::PerWindow,
        }
    }

    pub fn connection_manager(mut self, connection: Arc<ConnectionManager>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sweep expired rate windows every `interval` instead of once per window.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance = if interval.is_zero() {
            Maintenance::Disabled
        } else {
            Maintenance::Every(interval)
        };
        self
    }

    /// Do not start the background sweep.
    pub fn without_maintenance(mut self) -> Self {
        self.maintenance = Maintenance::Disabled;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;
        let GatewayConfig {
            security,
            limits,
            resources,
            ..
        } = &self.config;

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemMemoryProbe::new()));
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(build_rate_limiter(limits, resources, &probe)));
        let connection = match self.connection {
            Some(connection) => connection,
            None => Arc::new(ConnectionManager::new(&self.config)?),
        };

        let interval = match self.maintenance {
            Maintenance::PerWindow => Some(limits.window),
            Maintenance::Every(interval) => Some(interval),
            Maintenance::Disabled => None,
        };
        let maintenance = match interval {
            Some(interval) if tokio::runtime::Handle::try_current().is_ok() => {
                debug!("Sweeping expired rate windows every {:?}", interval);
                Some(rate_limiter.spawn_maintenance(interval))
            }
            Some(_) => {
                warn!("No async runtime at build time; expired rate windows will not be swept");
                None
            }
            None => None,
        };

        Ok(Gateway {
            sanitizer: SqlSanitizer::new()
                .max_query_length(security.max_query_length)
                .max_limit(security.max_limit),
            complexity: ComplexityAnalyzer::new(security.max_complexity),
            rate_limiter,
            concurrency: ConcurrencyLimiter::new(limits.max_concurrent),
            connection,
            resources: resources.clone(),
            probe,
            request_count: AtomicU64::new(0),
            maintenance,
        })
    }
}

fn build_rate_limiter(
    limits: &LimitConfig,
    resources: &ResourceConfig,
    probe: &Arc<dyn MemoryProbe>,
) -> RateLimiter {
    if limits.adaptive {
        RateLimiter::adaptive(
            limits.max_requests,
            limits.window,
            Arc::clone(probe),
            resources.max_memory_mb.saturating_mul(BYTES_PER_MB),
        )
    } else {
        RateLimiter::new(limits.max_requests, limits.window)
    }
}
