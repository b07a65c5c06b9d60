//! Database access layer.
//!
//! Two transports reach the same PostgreSQL instance: the REST gateway's
//! `exec_sql` helper ([`RestRpcClient`]) and a pooled direct connection
//! ([`PostgresDriver`]). [`ConnectionManager`] decides which one a statement
//! takes and bootstraps the helper when it is missing.

pub mod connection;
pub mod pool;
pub mod postgres;
pub mod result;
pub mod retry;
pub mod rpc;
pub mod traits;

pub use connection::{ConnectionManager, ConnectionStatus, Route, RpcState};
pub use pool::{PoolMetrics, PoolMetricsSnapshot};
pub use postgres::PostgresDriver;
pub use result::{ExecutionResult, QueryMode, Row, rows_from_json};
pub use retry::RetryPolicy;
pub use rpc::{RestRpcClient, parse_rpc_response};
pub use traits::{DirectExecutor, RpcTransport};
