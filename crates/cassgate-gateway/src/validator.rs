//! Token validation against the backing store
//!
//! Exactly one validation happens per client session, during CREDENTIALS
//! processing: the presented user token is exchanged for the tenant's
//! internal token plus an optional expiry. The store is an external
//! collaborator; the gateway only requires that a lookup is deterministic
//! within a session's lifetime and that transport failures are
//! distinguishable from unknown tokens (server error vs bad credentials).
//!
//! The production store lives in the gateway's own restricted keyspace on
//! the shared node, so [`CqlTokenStore`] speaks the same v1 protocol the
//! gateway proxies, authenticating with the configured root credentials,
//! optionally over TLS.

#[cfg(test)]
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cassgate_common::{GatewayError, Result, TenantToken, TokenValidation};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cql::body::{write_long_string, write_string_map, BodyReader};
use crate::cql::frame::{self, result_kind, Direction, Frame, Opcode, PROTOCOL_V1};
use crate::cql::metadata::ResultMetadata;
use crate::cql::rows::RowSet;

/// Token-store responses are small; cap frames defensively below the
/// gateway's own client-facing limit.
const STORE_MAX_FRAME_LEN: usize = 1024 * 1024;

const CONSISTENCY_ONE: u16 = 0x0001;

/// A token store the gateway can validate user tokens against
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Exchange a user token for the tenant's internal token and expiry.
    /// `TokenNotFound` means the token is unknown; `TokenStoreUnavailable`
    /// means the store could not answer.
    async fn validate(&self, user_token: &str) -> Result<TokenValidation>;
}

/// In-memory token store backing the test suites
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    tokens: HashMap<String, TokenValidation>,
}

#[cfg(test)]
impl StaticTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        user_token: impl Into<String>,
        internal_token: TenantToken,
        expires_at: Option<u64>,
    ) {
        self.tokens.insert(
            user_token.into(),
            TokenValidation {
                internal_token,
                expires_at,
            },
        );
    }
}

#[cfg(test)]
#[async_trait]
impl TokenValidator for StaticTokenStore {
    async fn validate(&self, user_token: &str) -> Result<TokenValidation> {
        self.tokens
            .get(user_token)
            .cloned()
            .ok_or(GatewayError::TokenNotFound)
    }
}

/// Token store backed by the shared node itself
pub struct CqlTokenStore {
    addr: SocketAddr,
    root_username: String,
    root_password: String,
    keyspace: String,
    token_length: usize,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl CqlTokenStore {
    pub fn new(
        addr: SocketAddr,
        root_username: String,
        root_password: String,
        keyspace: String,
        token_length: usize,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            addr,
            root_username,
            root_password,
            keyspace,
            token_length,
            tls,
        }
    }

    /// Run the v1 conversation over an established stream: STARTUP,
    /// CREDENTIALS when challenged, then the token lookup query.
    async fn lookup<S>(&self, mut stream: S, user_token: &str) -> Result<TokenValidation>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut body = Vec::new();
        write_string_map(&mut body, &[("CQL_VERSION".to_string(), "3.0.0".to_string())]);
        frame::write_frame(&mut stream, &request(Opcode::Startup, body))
            .await
            .map_err(store_error)?;

        let reply = self.read_reply(&mut stream).await?;
        match reply.opcode {
            Opcode::Ready => {}
            Opcode::Authenticate => {
                let mut reader = BodyReader::new(&reply.body);
                let authenticator = reader.read_string().unwrap_or_default();
                debug!(%authenticator, "token store requested authentication");

                let mut body = Vec::new();
                write_string_map(
                    &mut body,
                    &[
                        ("username".to_string(), self.root_username.clone()),
                        ("password".to_string(), self.root_password.clone()),
                    ],
                );
                frame::write_frame(&mut stream, &request(Opcode::Credentials, body))
                    .await
                    .map_err(store_error)?;

                let auth_reply = self.read_reply(&mut stream).await?;
                if auth_reply.opcode != Opcode::Ready {
                    return Err(GatewayError::TokenStoreUnavailable(format!(
                        "root authentication rejected with {}",
                        auth_reply.opcode.name()
                    )));
                }
            }
            other => {
                return Err(GatewayError::TokenStoreUnavailable(format!(
                    "unexpected {} after STARTUP",
                    other.name()
                )))
            }
        }

        // Single-quote escaping keeps an adversarial token inert.
        let query = format!(
            "SELECT internal_token, expires_at FROM {}.access_tokens WHERE user_token = '{}';",
            self.keyspace,
            user_token.replace('\'', "''")
        );
        let mut body = Vec::new();
        write_long_string(&mut body, &query);
        body.extend_from_slice(&CONSISTENCY_ONE.to_be_bytes());
        frame::write_frame(&mut stream, &request(Opcode::Query, body))
            .await
            .map_err(store_error)?;

        let reply = self.read_reply(&mut stream).await?;
        if reply.opcode != Opcode::Result {
            return Err(GatewayError::TokenStoreUnavailable(format!(
                "unexpected {} for token lookup",
                reply.opcode.name()
            )));
        }
        self.parse_lookup_result(&reply.body)
    }

    async fn read_reply<S>(&self, stream: &mut S) -> Result<Frame>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = frame::read_frame(stream, Direction::Response, Some(PROTOCOL_V1), STORE_MAX_FRAME_LEN)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                GatewayError::TokenStoreUnavailable("store closed the connection".into())
            })?;
        if reply.opcode == Opcode::Error {
            let mut reader = BodyReader::new(&reply.body);
            let code = reader.read_i32().unwrap_or(-1);
            let message = reader.read_string().unwrap_or_default();
            return Err(GatewayError::TokenStoreUnavailable(format!(
                "store error 0x{:04X}: {}",
                code, message
            )));
        }
        Ok(reply)
    }

    fn parse_lookup_result(&self, body: &[u8]) -> Result<TokenValidation> {
        let mut reader = BodyReader::new(body);
        let kind = reader.read_i32().map_err(store_error)?;
        if kind != result_kind::ROWS {
            return Err(GatewayError::TokenStoreUnavailable(format!(
                "token lookup returned result kind {}",
                kind
            )));
        }

        let metadata = ResultMetadata::parse(&mut reader).map_err(store_error)?;
        let rows = RowSet::parse(&mut reader, metadata.columns.len()).map_err(store_error)?;

        let row = match rows.rows.first() {
            Some(row) => row,
            None => return Err(GatewayError::TokenNotFound),
        };

        let internal_raw = row
            .first()
            .and_then(|cell| cell.as_deref())
            .ok_or_else(|| {
                GatewayError::TokenStoreUnavailable("token row is missing the internal token".into())
            })?;
        let internal_text = std::str::from_utf8(internal_raw).map_err(|_| {
            GatewayError::TokenStoreUnavailable("internal token is not valid UTF-8".into())
        })?;
        let internal_token =
            TenantToken::new(internal_text, self.token_length).map_err(|_| {
                GatewayError::TokenStoreUnavailable(format!(
                    "internal token width {} does not match configured width {}",
                    internal_text.len(),
                    self.token_length
                ))
            })?;

        // Expiry rides as a bigint of epoch seconds; zero or null never expires.
        let expires_at = match row.get(1).and_then(|cell| cell.as_deref()) {
            Some(raw) => {
                let mut cell = BodyReader::new(raw);
                match cell.read_i64() {
                    Ok(0) => None,
                    Ok(secs) => Some(secs.max(0) as u64),
                    Err(_) => {
                        return Err(GatewayError::TokenStoreUnavailable(
                            "expiry cell is not a bigint".into(),
                        ))
                    }
                }
            }
            None => None,
        };

        Ok(TokenValidation {
            internal_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenValidator for CqlTokenStore {
    async fn validate(&self, user_token: &str) -> Result<TokenValidation> {
        let tcp = TcpStream::connect(self.addr).await.map_err(|e| {
            GatewayError::TokenStoreUnavailable(format!("connect {}: {}", self.addr, e))
        })?;

        match &self.tls {
            Some(config) => {
                let server_name = ServerName::from(self.addr.ip());
                let stream = TlsConnector::from(config.clone())
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| GatewayError::Tls(format!("store handshake: {}", e)))?;
                self.lookup(stream, user_token).await
            }
            None => self.lookup(tcp, user_token).await,
        }
    }
}

/// Everything that goes wrong while talking to the store is a server-side
/// failure, never the client's bad credentials.
fn store_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::TokenNotFound | GatewayError::TokenStoreUnavailable(_) => err,
        other => GatewayError::TokenStoreUnavailable(other.to_string()),
    }
}

fn request(opcode: Opcode, body: Vec<u8>) -> Frame {
    Frame {
        version: PROTOCOL_V1,
        direction: Direction::Request,
        flags: 0,
        stream: 0,
        opcode,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::body::write_string;
    use crate::cql::metadata::FLAG_GLOBAL_TABLES_SPEC;
    use bytes::BufMut;

    fn store() -> CqlTokenStore {
        CqlTokenStore::new(
            "127.0.0.1:9043".parse().unwrap(),
            "cassandra".into(),
            "cassandra".into(),
            "multitenantcassandra".into(),
            20,
            None,
        )
    }

    fn lookup_result(rows: &[(&[u8], Option<i64>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(result_kind::ROWS);
        body.put_i32(FLAG_GLOBAL_TABLES_SPEC);
        body.put_i32(2);
        write_string(&mut body, "multitenantcassandra");
        write_string(&mut body, "access_tokens");
        write_string(&mut body, "internal_token");
        body.put_u16(0x000D);
        write_string(&mut body, "expires_at");
        body.put_u16(0x0002);
        body.put_i32(rows.len() as i32);
        for (token, expiry) in rows {
            body.put_i32(token.len() as i32);
            body.put_slice(token);
            match expiry {
                Some(secs) => {
                    body.put_i32(8);
                    body.put_i64(*secs);
                }
                None => body.put_i32(-1),
            }
        }
        body
    }

    #[tokio::test]
    async fn test_static_store() {
        let mut store = StaticTokenStore::new();
        let internal = TenantToken::new("tttttttttttttttttttt", 20).unwrap();
        store.insert("0123456789abcdef0123", internal.clone(), None);

        let validation = store.validate("0123456789abcdef0123").await.unwrap();
        assert_eq!(validation.internal_token, internal);
        assert!(!validation.is_expired());

        let err = store.validate("ffffffffffffffffffff").await.unwrap_err();
        assert!(matches!(err, GatewayError::TokenNotFound));
    }

    #[test]
    fn test_parse_lookup_result() {
        let body = lookup_result(&[(b"tttttttttttttttttttt", Some(4102444800))]);
        let validation = store().parse_lookup_result(&body).unwrap();
        assert_eq!(validation.internal_token.as_str(), "tttttttttttttttttttt");
        assert_eq!(validation.expires_at, Some(4102444800));
    }

    #[test]
    fn test_zero_expiry_never_expires() {
        let body = lookup_result(&[(b"tttttttttttttttttttt", Some(0))]);
        let validation = store().parse_lookup_result(&body).unwrap();
        assert_eq!(validation.expires_at, None);
    }

    #[test]
    fn test_empty_result_is_not_found() {
        let body = lookup_result(&[]);
        let err = store().parse_lookup_result(&body).unwrap_err();
        assert!(matches!(err, GatewayError::TokenNotFound));
    }

    #[test]
    fn test_wrong_width_token_is_store_failure() {
        let body = lookup_result(&[(b"short", None)]);
        let err = store().parse_lookup_result(&body).unwrap_err();
        assert!(matches!(err, GatewayError::TokenStoreUnavailable(_)));
    }

    #[test]
    fn test_non_rows_result_is_store_failure() {
        let mut body = Vec::new();
        body.put_i32(result_kind::VOID);
        let err = store().parse_lookup_result(&body).unwrap_err();
        assert!(matches!(err, GatewayError::TokenStoreUnavailable(_)));
    }
}
