//! Resilient SQL execution gateway for Supabase projects.
//!
//! Accepts a SQL statement plus execution intent, validates it against
//! injection and complexity policies, applies per-caller rate and
//! concurrency limits, and runs it through the REST gateway's `exec_sql`
//! helper or a pooled direct PostgreSQL connection.
//!
//! # Example
//!
//! ```no_run
//! use supabase_sql_gateway::{ExecuteOptions, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let gateway = Gateway::builder(config).build()?;
//!
//!     let result = gateway
//!         .execute("SELECT id, name FROM projects", ExecuteOptions::read_only("cli"))
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod resource;
pub mod security;

pub use config::{ClientConfig, ClientConfigBuilder, GatewayConfig};
pub use database::{ConnectionManager, ExecutionResult, RpcState};
pub use error::{ErrorBody, GatewayError, Result};
pub use gateway::{ExecuteOptions, Gateway, GatewayBuilder, SqlExecutor};
pub use security::{ComplexityAnalyzer, ConcurrencyLimiter, RateLimiter, SqlSanitizer};
