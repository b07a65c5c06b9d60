//! Dual-path connection management.
//!
//! Statements run either through the REST gateway's `exec_sql` helper or
//! over a pooled direct connection. Which path is viable is tracked by
//! [`RpcState`], resolved lazily on first use:
//!
//! ```text
//! Uninitialized --probe ok------------------------------> RpcReady
//!               --function missing, install ok----------> RpcReady
//!               --function missing, cannot install------> RpcUnavailable
//! RpcReady      --function missing at call time---------> Uninitialized (re-probe)
//! ```

use crate::config::{ClientConfig, GatewayConfig};
use crate::database::pool::PoolMetricsSnapshot;
use crate::database::postgres::PostgresDriver;
use crate::database::result::{QueryMode, Row, rows_from_json};
use crate::database::retry::RetryPolicy;
use crate::database::rpc::RestRpcClient;
use crate::database::traits::{DirectExecutor, RpcTransport};
use crate::error::{DatabaseError, Result, RpcError};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Installs the helper function. Queries that start like a SELECT are
/// wrapped so their rows come back as one JSON array; anything else is
/// executed for its side effects and yields `[]`. Read-only calls run with
/// `transaction_read_only` set, so the server rejects any write with 25006.
pub const HELPER_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION public.exec_sql(query text, read_only boolean DEFAULT false)
RETURNS jsonb
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = public
AS $fn$
DECLARE
    result jsonb;
    stmt text := regexp_replace(query, ';\s*$', '');
BEGIN
    -- Volatile functions called from a SELECT must not write either.
    IF read_only THEN
        SET LOCAL transaction_read_only = on;
    END IF;
    IF stmt ~* '^\s*(select|with|values|table)\M' THEN
        EXECUTE format('SELECT coalesce(jsonb_agg(t), ''[]''::jsonb) FROM (%s) t', stmt)
            INTO result;
        RETURN result;
    END IF;
    IF read_only THEN
        RAISE EXCEPTION 'statement not allowed in read-only execution'
            USING ERRCODE = '25006';
    END IF;
    EXECUTE stmt;
    RETURN '[]'::jsonb;
END;
$fn$
"#;

/// Restricts the helper to the service role where the Supabase roles exist.
pub const HELPER_GRANTS_SQL: &str = r#"
DO $grants$
BEGIN
    REVOKE ALL ON FUNCTION public.exec_sql(text, boolean) FROM PUBLIC;
    IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'anon') THEN
        REVOKE ALL ON FUNCTION public.exec_sql(text, boolean) FROM anon;
    END IF;
    IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'authenticated') THEN
        REVOKE ALL ON FUNCTION public.exec_sql(text, boolean) FROM authenticated;
    END IF;
    IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'service_role') THEN
        GRANT EXECUTE ON FUNCTION public.exec_sql(text, boolean) TO service_role;
    END IF;
END
$grants$
"#;

/// Asks the REST gateway to reload its schema cache.
pub const SCHEMA_RELOAD_SQL: &str = "NOTIFY pgrst, 'reload schema'";

/// Whether the RPC path can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcState {
    Uninitialized,
    RpcReady,
    RpcUnavailable,
}

impl fmt::Display for RpcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::RpcReady => write!(f, "rpc_ready"),
            Self::RpcUnavailable => write!(f, "rpc_unavailable"),
        }
    }
}

/// Execution path chosen for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Rpc,
    Direct,
}

/// Point-in-time view of the manager for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub rpc_state: RpcState,
    pub direct_configured: bool,
    pub admin_key_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolMetricsSnapshot>,
}

pub struct ConnectionManager {
    config: ClientConfig,
    rpc: Arc<dyn RpcTransport>,
    direct: Option<Arc<dyn DirectExecutor>>,
    retry: RetryPolicy,
    state: RwLock<RpcState>,
    init_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Build the production transports from configuration.
    ///
    /// No network traffic happens here; the RPC probe and the pool are both
    /// deferred to first use.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let rpc = RestRpcClient::new(&config.client, config.rpc_timeout)?;
        let retry = RetryPolicy::from(&config.retry);
        let direct = config
            .client
            .direct_db_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| {
                Arc::new(PostgresDriver::new(url, config.pool.clone(), retry.clone()))
                    as Arc<dyn DirectExecutor>
            });

        Ok(Self::with_transports(
            config.client.clone(),
            Arc::new(rpc),
            direct,
            retry,
        ))
    }

    pub fn with_transports(
        config: ClientConfig,
        rpc: Arc<dyn RpcTransport>,
        direct: Option<Arc<dyn DirectExecutor>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            rpc,
            direct,
            retry,
            state: RwLock::new(RpcState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> RpcState {
        *self.state.read()
    }

    pub fn has_direct(&self) -> bool {
        self.direct.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            rpc_state: self.state(),
            direct_configured: self.has_direct(),
            admin_key_configured: self.config.has_admin_key(),
            pool: self.direct.as_ref().map(|d| d.metrics()),
        }
    }

    /// Resolve the RPC state. Concurrent callers share one probe.
    ///
    /// # Errors
    ///
    /// Returns `RPC_UNAVAILABLE` when the probe fails for a reason other than
    /// a missing helper function; the state stays `Uninitialized` so a later
    /// call probes again.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<RpcState> {
        let current = self.state();
        if current != RpcState::Uninitialized {
            return Ok(current);
        }

        let _guard = self.init_lock.lock().await;
        let current = self.state();
        if current != RpcState::Uninitialized {
            return Ok(current);
        }

        let next = self.probe().await?;
        *self.state.write() = next;
        info!("RPC state resolved to {}", next);
        Ok(next)
    }

    async fn probe(&self) -> Result<RpcState> {
        match self.rpc.exec_sql("SELECT 1", true).await {
            Ok(_) => Ok(RpcState::RpcReady),
            Err(RpcError::FunctionNotFound(message)) => {
                debug!("Helper function missing: {}", message);
                if !self.config.has_admin_key() || self.direct.is_none() {
                    warn!("Cannot install helper function without admin key and direct URL");
                    return Ok(RpcState::RpcUnavailable);
                }
                match self.install_helper().await {
                    Ok(()) => Ok(RpcState::RpcReady),
                    Err(e) => {
                        warn!("Helper function installation failed: {}", e);
                        Ok(RpcState::RpcUnavailable)
                    }
                }
            }
            Err(e) => Err(RpcError::Unavailable(format!("RPC probe failed: {e}")).into()),
        }
    }

    /// Create the helper function and its grants in one transaction, then
    /// ask the REST gateway to reload its schema cache on commit.
    #[instrument(skip(self))]
    pub async fn install_helper(&self) -> Result<()> {
        let direct = self.direct.as_ref().ok_or(DatabaseError::NotConfigured)?;
        self.retry
            .run(
                "helper install",
                |_| {
                    direct.execute_transaction(&[
                        HELPER_FUNCTION_SQL,
                        HELPER_GRANTS_SQL,
                        SCHEMA_RELOAD_SQL,
                    ])
                },
                || direct.reset(),
            )
            .await?;
        info!("Installed helper function public.exec_sql");
        Ok(())
    }

    /// Run `statements` in order inside one transaction on the direct path.
    pub async fn transaction(&self, statements: &[&str]) -> Result<()> {
        let direct = self.direct.as_ref().ok_or(DatabaseError::NotConfigured)?;
        direct.execute_transaction(statements).await?;
        Ok(())
    }

    /// Execute through the helper function.
    ///
    /// A missing helper while `RpcReady` means the gateway's schema cache
    /// was reset; re-initialize and try exactly once more.
    #[instrument(skip(self, sql))]
    pub async fn execute_via_rpc(&self, sql: &str, read_only: bool) -> Result<Vec<Row>> {
        let value = match self.rpc.exec_sql(sql, read_only).await {
            Err(RpcError::FunctionNotFound(message)) if self.state() == RpcState::RpcReady => {
                warn!("Helper function disappeared ({}), re-initializing", message);
                self.invalidate();
                match self.initialize().await? {
                    RpcState::RpcReady => self.rpc.exec_sql(sql, read_only).await?,
                    state => {
                        return Err(RpcError::Unavailable(format!(
                            "helper function unavailable after re-initialization ({state})"
                        ))
                        .into());
                    }
                }
            }
            other => other?,
        };
        Ok(rows_from_json(value)?)
    }

    /// Execute over the pooled direct connection with retry.
    #[instrument(skip(self, sql))]
    pub async fn execute_via_direct(&self, sql: &str, mode: QueryMode) -> Result<Vec<Row>> {
        let direct = self.direct.as_ref().ok_or(DatabaseError::NotConfigured)?;
        let rows = self
            .retry
            .run("direct query", |_| direct.query(sql, mode), || direct.reset())
            .await?;
        Ok(rows)
    }

    /// Pick the path for a statement, resolving the RPC state if needed.
    pub async fn route(&self, mode: QueryMode, prefer_direct: bool) -> Result<Route> {
        if prefer_direct || (mode.multi_statement && self.has_direct()) {
            return Ok(Route::Direct);
        }
        match self.initialize().await? {
            RpcState::RpcUnavailable => Ok(Route::Direct),
            _ => Ok(Route::Rpc),
        }
    }

    pub async fn execute(&self, sql: &str, mode: QueryMode, prefer_direct: bool) -> Result<Vec<Row>> {
        match self.route(mode, prefer_direct).await? {
            Route::Direct => self.execute_via_direct(sql, mode).await,
            Route::Rpc => self.execute_via_rpc(sql, mode.read_only).await,
        }
    }

    fn invalidate(&self) {
        let mut state = self.state.write();
        if *state == RpcState::RpcReady {
            *state = RpcState::Uninitialized;
        }
    }
}
