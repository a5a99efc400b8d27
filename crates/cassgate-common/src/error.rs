//! Error types for Cassgate services

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// CQL wire error codes the gateway emits or recognizes
pub mod wire_code {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const ALREADY_EXISTS: i32 = 0x2400;
}

/// Main error type for the gateway
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or out-of-contract framing / packet contents
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame body exceeds the configured maximum
    #[error("Frame body of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: i64, max: usize },

    /// Packet body ended before a declared field
    #[error("Truncated body: needed {expected} more bytes, had {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Client presented credentials the gateway cannot accept
    #[error("Bad credentials: {0}")]
    BadCredentials(String),

    /// User token not present in the token store
    #[error("Token not recognized")]
    TokenNotFound,

    /// User token is past its expiration
    #[error("Token expired")]
    TokenExpired,

    /// Tenant attempted to use another tenant's prepared statement
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Compression codec unknown or used before negotiation
    #[error("Unknown compression method: {0}")]
    UnknownCompression(String),

    /// Compressed body failed to decode with the negotiated codec
    #[error("Compression error: {0}")]
    Compression(String),

    /// Token store could not be reached or answered out of contract
    #[error("Token store unavailable: {0}")]
    TokenStoreUnavailable(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Startup misconfiguration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The CQL error code a client sees when this error terminates its
    /// session. IO errors never surface as packets; they map to
    /// SERVER_ERROR for completeness.
    pub fn wire_code(&self) -> i32 {
        match self {
            GatewayError::Protocol(_)
            | GatewayError::FrameTooLarge { .. }
            | GatewayError::Truncated { .. }
            | GatewayError::UnknownCompression(_)
            | GatewayError::Compression(_) => wire_code::PROTOCOL_ERROR,
            GatewayError::BadCredentials(_)
            | GatewayError::TokenNotFound
            | GatewayError::TokenExpired => wire_code::BAD_CREDENTIALS,
            GatewayError::Unauthorized(_) => wire_code::UNAUTHORIZED,
            GatewayError::TokenStoreUnavailable(_)
            | GatewayError::Tls(_)
            | GatewayError::Config(_)
            | GatewayError::Io(_) => wire_code::SERVER_ERROR,
        }
    }

    /// True when the session should close without writing an error packet
    /// (the peer is already gone or the transport itself failed).
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Io(_))
    }
}
