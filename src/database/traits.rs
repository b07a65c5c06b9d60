//! Transport traits for the two execution paths.

use crate::database::pool::PoolMetricsSnapshot;
use crate::database::result::{QueryMode, Row};
use crate::error::{DbResult, RpcResult};
use async_trait::async_trait;
use serde_json::Value;

/// Direct wire-level connection to the database.
///
/// Implementations: [`PostgresDriver`](crate::database::PostgresDriver).
/// Methods make a single attempt; retries are layered on top by
/// [`RetryPolicy`](crate::database::RetryPolicy).
#[async_trait]
pub trait DirectExecutor: Send + Sync {
    /// Returns the driver name (e.g., "postgres").
    fn name(&self) -> &'static str;

    /// Executes a statement and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`](crate::error::DatabaseError::Query) with the
    /// server's SQLSTATE for statement failures and
    /// [`DatabaseError::Connection`](crate::error::DatabaseError::Connection) for
    /// network faults.
    async fn query(&self, sql: &str, mode: QueryMode) -> DbResult<Vec<Row>>;

    /// Executes statements in order inside one transaction on one connection.
    ///
    /// Rolls back on the first failure.
    async fn execute_transaction(&self, statements: &[&str]) -> DbResult<()>;

    /// Tears down the pool; the next call builds a fresh one.
    async fn reset(&self);

    fn metrics(&self) -> PoolMetricsSnapshot;
}

/// Client for the REST gateway's helper execution function.
///
/// Implementations: [`RestRpcClient`](crate::database::RestRpcClient).
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Calls the helper function and returns its raw JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::FunctionNotFound`](crate::error::RpcError::FunctionNotFound)
    /// when the gateway does not know the helper function.
    async fn exec_sql(&self, sql: &str, read_only: bool) -> RpcResult<Value>;
}
