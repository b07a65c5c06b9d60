//! Gateway binary: executes one statement read from stdin.
//!
//! Options come from `GATEWAY_READ_ONLY`, `GATEWAY_ALLOW_MULTI`,
//! `GATEWAY_CALLER_ID` and `GATEWAY_PREFER_DIRECT`. The result is printed as
//! JSON on stdout; logs go to stderr.

use anyhow::{Context, Result, bail};
use supabase_sql_gateway::{ExecuteOptions, Gateway, GatewayConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    let options = options_from_env()?;
    let gateway = Gateway::builder(config)
        .build()
        .context("failed to build gateway")?;

    let mut sql = String::new();
    tokio::io::stdin()
        .read_to_string(&mut sql)
        .await
        .context("failed to read SQL from stdin")?;
    if sql.trim().is_empty() {
        bail!("no SQL statement on stdin");
    }

    let result = gateway.execute(sql.trim(), options).await;
    if let Some(body) = result.as_error() {
        error!(code = %body.code, "Statement failed: {}", body.message);
    }

    let mut output = serde_json::to_vec_pretty(&result)?;
    output.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await?;
    stdout.flush().await?;

    if result.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

fn options_from_env() -> Result<ExecuteOptions> {
    let mut options = ExecuteOptions::default();
    if let Some(v) = env_flag("GATEWAY_READ_ONLY")? {
        options.read_only = v;
    }
    if let Some(v) = env_flag("GATEWAY_ALLOW_MULTI")? {
        options.allow_multiple_statements = v;
    }
    if let Some(v) = env_flag("GATEWAY_PREFER_DIRECT")? {
        options.prefer_direct = v;
    }
    if let Ok(caller) = std::env::var("GATEWAY_CALLER_ID") {
        options.caller_id = caller;
    }
    Ok(options)
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => bail!("{name} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(None),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("supabase_sql_gateway=info,warn"));

    // stdout carries the result
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
