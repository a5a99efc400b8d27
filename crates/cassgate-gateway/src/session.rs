//! Per-session shared state
//!
//! One record per accepted connection, shared between the ingress and
//! egress workers behind a single mutex. Critical sections are a few
//! field reads or writes and never span an await. The protocol version
//! and compression codec are written once during session setup, the
//! tenant token exactly once on successful credentials; the interesting
//! stream set is the only field both workers mutate for the life of the
//! session.

use std::collections::HashSet;

use cassgate_common::{GatewayError, Result, TenantToken};
use parking_lot::Mutex;

use crate::cql::Compression;

#[derive(Debug, Default)]
struct Inner {
    protocol_version: Option<u8>,
    compression: Compression,
    token: Option<TenantToken>,
    interesting_streams: HashSet<i8>,
}

/// Shared mutable state for one client session
#[derive(Debug, Default)]
pub struct SessionState {
    inner: Mutex<Inner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the protocol version from the first packet; later packets read
    /// the pinned value back for framing checks.
    pub fn pin_version(&self, version: u8) -> u8 {
        let mut inner = self.inner.lock();
        *inner.protocol_version.get_or_insert(version)
    }

    pub fn protocol_version(&self) -> Option<u8> {
        self.inner.lock().protocol_version
    }

    /// Set only while handling the STARTUP packet.
    pub fn set_compression(&self, compression: Compression) {
        self.inner.lock().compression = compression;
    }

    pub fn compression(&self) -> Compression {
        self.inner.lock().compression
    }

    /// Store the tenant token after successful credential validation.
    /// A second CREDENTIALS packet on the same session is out of contract.
    pub fn set_token(&self, token: TenantToken) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.token.is_some() {
            return Err(GatewayError::Protocol(
                "credentials already presented on this session".into(),
            ));
        }
        inner.token = Some(token);
        Ok(())
    }

    pub fn token(&self) -> Option<TenantToken> {
        self.inner.lock().token.clone()
    }

    /// Flag a request stream whose response must be row-filtered.
    pub fn mark_interesting(&self, stream: i8) {
        self.inner.lock().interesting_streams.insert(stream);
    }

    /// Remove a stream's flag, reporting whether it was set. Called
    /// exactly once per flagged stream, on the correlated response.
    pub fn take_interesting(&self, stream: i8) -> bool {
        self.inner.lock().interesting_streams.remove(&stream)
    }

    /// Outstanding flagged streams, reported at teardown.
    pub fn interesting_count(&self) -> usize {
        self.inner.lock().interesting_streams.len()
    }
}
