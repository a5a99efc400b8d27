//! Tenant token types
//!
//! A tenant is identified on the wire by two fixed-width opaque tokens of
//! the same configured byte width: the *user token* a client prefixes to
//! its username, and the *internal token* the token store maps it to. The
//! internal token doubles as the tenant's keyspace prefix on the shared
//! node, so it must be valid UTF-8 identifier text.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// A tenant's internal token: the namespace prefix on the shared node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantToken(String);

impl TenantToken {
    /// Build a token, enforcing the configured fixed width.
    pub fn new(raw: impl Into<String>, expected_len: usize) -> Result<Self> {
        let raw = raw.into();
        if raw.len() != expected_len {
            return Err(GatewayError::BadCredentials(format!(
                "internal token width {} does not match configured width {}",
                raw.len(),
                expected_len
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TenantToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful token-store lookup
#[derive(Debug, Clone)]
pub struct TokenValidation {
    /// The tenant's internal token
    pub internal_token: TenantToken,
    /// Expiration as epoch seconds; `None` (or zero on the wire) never expires
    pub expires_at: Option<u64>,
}

impl TokenValidation {
    /// Check expiry against wall-clock seconds.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => (Utc::now().timestamp() as u64) >= exp,
            None => false,
        }
    }
}
