//! Cassgate Gateway Service
//!
//! Transparent multi-tenant gateway for the CQL native protocol. Binds
//! the canonical native port, proxies every session to the real node on
//! the shifted port, and keeps tenants inside their token-prefixed
//! namespaces: keyspace references are prefixed on the way in, stripped
//! on the way out, and shared metadata results are filtered per tenant.

mod cql;
mod pipeline;
mod prepared;
mod rewrite;
mod session;
mod telemetry;
mod validator;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cassgate_common::{create_client_tls_config, GatewayConfig};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pipeline::run_session;
use crate::prepared::PreparedRegistry;
use crate::validator::{CqlTokenStore, TokenValidator};

const TCP_KEEPALIVE_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "cassgate-gateway")]
#[command(about = "Cassgate - multi-tenant CQL gateway")]
struct Args {
    /// Address to listen on for client connections
    #[arg(long, env = "CASSGATE_LISTEN_ADDR")]
    listen_addr: IpAddr,

    /// Port to listen on (the canonical native-protocol port)
    #[arg(long, env = "CASSGATE_NATIVE_PORT", default_value = "9042")]
    native_port: u16,

    /// Address of the backing database node
    #[arg(long, env = "CASSGATE_UPSTREAM_ADDR", default_value = "127.0.0.1")]
    upstream_addr: IpAddr,

    /// Port of the backing database node
    #[arg(long, env = "CASSGATE_UPSTREAM_PORT", default_value = "9043")]
    upstream_port: u16,

    /// Fixed byte width of user and internal tokens
    #[arg(long, env = "CASSGATE_TOKEN_LENGTH", default_value = "20")]
    token_length: usize,

    /// Username the token store connection authenticates with
    #[arg(long, env = "CASSGATE_ROOT_USERNAME", default_value = "cassandra")]
    root_username: String,

    /// Password the token store connection authenticates with
    #[arg(long, env = "CASSGATE_ROOT_PASSWORD", default_value = "cassandra")]
    root_password: String,

    /// Enable TLS on the token store connection
    #[arg(long, env = "CASSGATE_USE_TLS", default_value = "false")]
    use_tls: bool,

    /// Extra CA bundle (PEM) trusted for the token store
    #[arg(long, env = "CASSGATE_TLS_CA")]
    tls_ca: Option<String>,

    /// The gateway's private keyspace, hidden from every tenant
    #[arg(
        long,
        env = "CASSGATE_RESTRICTED_KEYSPACE",
        default_value = "multitenantcassandra"
    )]
    restricted_keyspace: String,

    /// Maximum accepted frame body length in bytes
    #[arg(long, env = "CASSGATE_MAX_FRAME_LEN", default_value = "268435456")]
    max_frame_len: usize,

    /// Per-read timeout in seconds; 0 disables it
    #[arg(long, env = "CASSGATE_READ_TIMEOUT_SECS", default_value = "0")]
    read_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            listen_addr: self.listen_addr,
            native_port: self.native_port,
            upstream_addr: self.upstream_addr,
            upstream_port: self.upstream_port,
            token_length: self.token_length,
            root_username: self.root_username,
            root_password: self.root_password,
            use_tls: self.use_tls,
            tls_ca: self.tls_ca,
            restricted_keyspace: self.restricted_keyspace,
            max_frame_len: self.max_frame_len,
            read_timeout_secs: self.read_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize rustls crypto provider (used by the token store TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    telemetry::init(&args.log_level)?;

    let config = Arc::new(args.into_config());
    config.validate().context("invalid configuration")?;

    info!("Starting Cassgate");
    info!("  Listening on: {}", config.listen_socket());
    info!("  Upstream node: {}", config.upstream_socket());
    info!("  Token width: {} bytes", config.token_length);
    info!("  Token store TLS: {}", config.use_tls);

    let tls = if config.use_tls {
        Some(
            create_client_tls_config(config.tls_ca.as_deref())
                .context("token store TLS configuration")?,
        )
    } else {
        None
    };

    let validator: Arc<dyn TokenValidator> = Arc::new(CqlTokenStore::new(
        config.upstream_socket(),
        config.root_username.clone(),
        config.root_password.clone(),
        config.restricted_keyspace.clone(),
        config.token_length,
        tls,
    ));
    let prepared = PreparedRegistry::new();

    let listener = TcpListener::bind(config.listen_socket())
        .await
        .with_context(|| format!("binding {}", config.listen_socket()))?;

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (client, peer_addr) = accepted.context("accepting connection")?;
                info!("New client connection from {}", peer_addr);
                configure_tcp_keepalive(&client, TCP_KEEPALIVE_SECS);

                let upstream = match TcpStream::connect(config.upstream_socket()).await {
                    Ok(upstream) => {
                        if let Err(e) = upstream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY on upstream: {}", e);
                        }
                        upstream
                    }
                    Err(e) => {
                        error!("Upstream {} unreachable: {}", config.upstream_socket(), e);
                        continue;
                    }
                };

                sessions.spawn(run_session(
                    client,
                    upstream,
                    config.clone(),
                    validator.clone(),
                    prepared.clone(),
                ));
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, draining sessions");
                break;
            }
        }
    }

    // Stop accepting, then drain the sessions still in flight.
    drop(listener);
    while sessions.join_next().await.is_some() {}
    info!("Cassgate stopped");

    Ok(())
}

/// Configure TCP keepalive on an accepted socket so dead clients are
/// detected without waiting for a write to fail.
fn configure_tcp_keepalive(stream: &TcpStream, keepalive_secs: u64) {
    use socket2::SockRef;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    } else {
        debug!("TCP keepalive configured: {}s", keepalive_secs);
    }
}
