//! Configuration for the gateway process

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Gateway configuration
///
/// The gateway binds the canonical native-protocol port and proxies to the
/// real node, which by convention listens on the canonical port shifted up
/// by one on the same host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address to listen on for client connections
    pub listen_addr: IpAddr,
    /// Port to listen on (canonical native-protocol port)
    pub native_port: u16,
    /// Address of the backing database node
    pub upstream_addr: IpAddr,
    /// Port of the backing database node
    pub upstream_port: u16,
    /// Fixed byte width of user and internal tokens
    pub token_length: usize,
    /// Root credentials the token store connection authenticates with
    pub root_username: String,
    pub root_password: String,
    /// Enable TLS on the token store connection
    pub use_tls: bool,
    /// CA bundle (PEM) trusted for the token store, in addition to webpki roots
    pub tls_ca: Option<String>,
    /// The gateway's own private keyspace; its rows are never shown to tenants
    pub restricted_keyspace: String,
    /// Maximum accepted frame body length in bytes
    pub max_frame_len: usize,
    /// Per-read timeout in seconds; 0 disables the timeout
    pub read_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            native_port: 9042,
            upstream_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            upstream_port: 9043,
            token_length: 20,
            root_username: "cassandra".into(),
            root_password: "cassandra".into(),
            use_tls: false,
            tls_ca: None,
            restricted_keyspace: "multitenantcassandra".into(),
            max_frame_len: 256 * 1024 * 1024,
            read_timeout_secs: 0,
        }
    }
}

impl GatewayConfig {
    /// Socket address the gateway listens on
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.native_port)
    }

    /// Socket address of the backing node
    pub fn upstream_socket(&self) -> SocketAddr {
        SocketAddr::new(self.upstream_addr, self.upstream_port)
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.token_length == 0 {
            return Err(GatewayError::Config("token_length must be non-zero".into()));
        }
        if self.max_frame_len == 0 {
            return Err(GatewayError::Config("max_frame_len must be non-zero".into()));
        }
        if self.restricted_keyspace.is_empty() {
            return Err(GatewayError::Config(
                "restricted_keyspace must be non-empty".into(),
            ));
        }
        if self.native_port == self.upstream_port && self.listen_addr == self.upstream_addr {
            return Err(GatewayError::Config(
                "listener and upstream cannot share an address".into(),
            ));
        }
        Ok(())
    }
}
