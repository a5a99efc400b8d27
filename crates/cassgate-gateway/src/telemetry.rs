//! Tracing setup
//!
//! The gateway is deliberately quiet on the wire path: session lifecycle
//! logs at `info`, rewrite and filter decisions at `debug`, and raw
//! per-packet frame traces at `trace` (emitted by the pipeline workers).
//! The base level comes from the binary's `--log-level` flag; `RUST_LOG`
//! overrides it with full directive syntax when set, e.g.
//! `RUST_LOG=cassgate_gateway::rewrite=debug` to watch only the
//! rewriters on a busy gateway.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber for the gateway process.
pub fn init(log_level: &str) -> Result<()> {
    // rustls handshake internals drown out the token-store flow at the
    // gateway's own debug level, so cap them unless RUST_LOG asks.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},rustls=warn", log_level)))?;

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        // JSON formatted logs for production
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        // Pretty formatted logs for development
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}
