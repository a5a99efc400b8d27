//! Per-session duplex pipelines
//!
//! Each accepted connection runs two peer workers: ingress drains the
//! client socket, rewrites requests, and forwards them upstream; egress
//! drains the upstream socket, rewrites responses, and forwards them back.
//! Both share one [`SessionState`] record. The client write half sits
//! behind an async mutex so the ingress worker can emit a terminal error
//! packet on its own failures; whole packets are written under that lock,
//! so the two writers never interleave bytes.
//!
//! Either worker finishing resolves the session's `select!`, which cancels
//! the peer at its next suspension point; teardown then shuts the client
//! link down and drops both sockets. No session outlives either socket.

use std::sync::Arc;
use std::time::Duration;

use cassgate_common::{GatewayConfig, GatewayError, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::cql::frame::{self, flags, Direction, Frame};
use crate::prepared::PreparedRegistry;
use crate::rewrite::request::{rewrite_request, RequestContext};
use crate::rewrite::response::{rewrite_response, ResponseAction, ResponseContext};
use crate::session::SessionState;
use crate::validator::TokenValidator;

/// Drive one client session to completion.
pub async fn run_session<C, U>(
    client: C,
    upstream: U,
    config: Arc<GatewayConfig>,
    validator: Arc<dyn TokenValidator>,
    prepared: PreparedRegistry,
) where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let client_write = Arc::new(Mutex::new(client_write));

    let state = Arc::new(SessionState::new());

    let ingress = ingress_worker(
        client_read,
        upstream_write,
        client_write.clone(),
        state.clone(),
        config.clone(),
        validator,
        prepared.clone(),
    );
    let egress = egress_worker(
        upstream_read,
        client_write.clone(),
        state.clone(),
        config.clone(),
        prepared,
    );

    tokio::select! {
        result = ingress => log_worker_exit("client", result),
        result = egress => log_worker_exit("upstream", result),
    }

    // The loser of the select is dropped at its suspension point and its
    // socket half with it; finish the client side explicitly.
    let _ = client_write.lock().await.shutdown().await;
    debug!(
        outstanding_flags = state.interesting_count(),
        "session torn down"
    );
}

fn log_worker_exit(side: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!(side, "peer closed, ending session"),
        Err(err) if err.is_transport() => debug!(side, %err, "transport failed, ending session"),
        Err(err) => error!(side, %err, "session ended on error"),
    }
}

/// Client → upstream. On any non-transport failure the client is sent a
/// terminal error packet carrying the offending stream id.
async fn ingress_worker<C, U>(
    mut client_read: ReadHalf<C>,
    mut upstream_write: WriteHalf<U>,
    client_write: Arc<Mutex<WriteHalf<C>>>,
    state: Arc<SessionState>,
    config: Arc<GatewayConfig>,
    validator: Arc<dyn TokenValidator>,
    prepared: PreparedRegistry,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let mut current_stream: i8 = 0;

    let result = loop {
        let frame = match read_with_timeout(
            &mut client_read,
            Direction::Request,
            &state,
            &config,
        )
        .await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };

        current_stream = frame.stream;
        if let Err(err) = process_request(
            frame,
            &mut upstream_write,
            &state,
            &config,
            &*validator,
            &prepared,
        )
        .await
        {
            break Err(err);
        }
    };

    if let Err(ref err) = result {
        if !err.is_transport() {
            let version = state.protocol_version().unwrap_or(frame::PROTOCOL_V1);
            let packet = Frame::error_for(version, current_stream, err);
            let mut writer = client_write.lock().await;
            if let Err(send_err) = frame::write_frame(&mut *writer, &packet).await {
                debug!(%send_err, "could not deliver terminal error packet");
            }
        }
    }
    result
}

async fn process_request<U>(
    mut frame: Frame,
    upstream_write: &mut WriteHalf<U>,
    state: &SessionState,
    config: &GatewayConfig,
    validator: &dyn TokenValidator,
    prepared: &PreparedRegistry,
) -> Result<()>
where
    U: AsyncRead + AsyncWrite,
{
    // The first packet fixes the session's protocol version.
    state.pin_version(frame.version);
    trace!(
        opcode = frame.opcode.name(),
        stream = frame.stream,
        len = frame.body.len(),
        tracing_requested = frame.flags & flags::TRACING != 0,
        "request"
    );

    if frame.stream < 0 {
        return Err(GatewayError::Protocol(format!(
            "negative stream id {} on a request",
            frame.stream
        )));
    }

    // The upstream link is local and uncompressed by contract.
    if frame.is_compressed() {
        frame.body = state.compression().decompress(&frame.body)?;
        frame.flags &= !flags::COMPRESSION;
    }

    let ctx = RequestContext {
        state,
        validator,
        prepared,
        token_length: config.token_length,
    };
    let frame = rewrite_request(frame, &ctx).await?;
    frame::write_frame(upstream_write, &frame).await
}

/// Upstream → client. Failures close the session without a packet; the
/// upstream is trusted to be well-formed, so a parse failure here is not
/// recoverable.
async fn egress_worker<C, U>(
    mut upstream_read: ReadHalf<U>,
    client_write: Arc<Mutex<WriteHalf<C>>>,
    state: Arc<SessionState>,
    config: Arc<GatewayConfig>,
    prepared: PreparedRegistry,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    loop {
        let frame = match read_with_timeout(
            &mut upstream_read,
            Direction::Response,
            &state,
            &config,
        )
        .await?
        {
            Some(frame) => frame,
            None => return Ok(()),
        };

        state.pin_version(frame.version);
        trace!(
            opcode = frame.opcode.name(),
            stream = frame.stream,
            len = frame.body.len(),
            "response"
        );

        if frame.is_compressed() {
            return Err(GatewayError::Protocol(
                "upstream sent a compressed body on the uncompressed link".into(),
            ));
        }

        let ctx = ResponseContext {
            state: &state,
            prepared: &prepared,
            restricted_keyspace: &config.restricted_keyspace,
        };
        let mut frame = match rewrite_response(frame, &ctx)? {
            ResponseAction::Forward(frame) => frame,
            ResponseAction::Drop => continue,
        };

        let codec = state.compression();
        if !codec.is_none() {
            frame.body = codec.compress(&frame.body)?;
            frame.flags |= flags::COMPRESSION;
        }

        let mut writer = client_write.lock().await;
        frame::write_frame(&mut *writer, &frame).await?;
    }
}

/// One bounded read: the coarse per-operation timeout tears the session
/// down; there is no per-stream timeout.
async fn read_with_timeout<R>(
    reader: &mut R,
    direction: Direction,
    state: &SessionState,
    config: &GatewayConfig,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let pinned = state.protocol_version();
    let read = frame::read_frame(reader, direction, pinned, config.max_frame_len);
    if config.read_timeout_secs == 0 {
        return read.await;
    }
    match tokio::time::timeout(Duration::from_secs(config.read_timeout_secs), read).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read timed out",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::body::{
        write_long_string, write_short_bytes, write_string, write_string_map, BodyReader,
    };
    use crate::cql::frame::{result_kind, Opcode, PROTOCOL_V1};
    use crate::cql::Compression;
    use crate::validator::StaticTokenStore;
    use bytes::BufMut;
    use cassgate_common::error::wire_code;
    use cassgate_common::TenantToken;
    use tokio::io::DuplexStream;

    const TOKEN: &str = "tttttttttttttttttttt";
    const USER_TOKEN: &str = "0123456789abcdef0123";

    struct Harness {
        client: DuplexStream,
        upstream: DuplexStream,
    }

    fn spawn_session() -> Harness {
        let (client, gateway_client_end) = tokio::io::duplex(64 * 1024);
        let (gateway_upstream_end, upstream) = tokio::io::duplex(64 * 1024);

        let mut validator = StaticTokenStore::new();
        validator.insert(
            USER_TOKEN,
            TenantToken::new(TOKEN, TOKEN.len()).unwrap(),
            None,
        );

        let config = Arc::new(GatewayConfig::default());
        tokio::spawn(run_session(
            gateway_client_end,
            gateway_upstream_end,
            config,
            Arc::new(validator) as Arc<dyn TokenValidator>,
            PreparedRegistry::new(),
        ));

        Harness { client, upstream }
    }

    fn request(opcode: Opcode, stream: i8, body: Vec<u8>) -> Frame {
        Frame {
            version: PROTOCOL_V1,
            direction: Direction::Request,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    fn response(opcode: Opcode, stream: i8, body: Vec<u8>) -> Frame {
        Frame {
            version: PROTOCOL_V1,
            direction: Direction::Response,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    async fn send(stream: &mut DuplexStream, frame: &Frame) {
        frame::write_frame(stream, frame).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream, direction: Direction) -> Frame {
        frame::read_frame(stream, direction, None, 1024 * 1024)
            .await
            .unwrap()
            .expect("peer closed unexpectedly")
    }

    fn string_map_body(entries: &[(&str, &str)]) -> Vec<u8> {
        let owned: Vec<(String, String)> = entries
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut body = Vec::new();
        write_string_map(&mut body, &owned);
        body
    }

    fn query_body(statement: &str) -> Vec<u8> {
        let mut body = Vec::new();
        write_long_string(&mut body, statement);
        body.extend_from_slice(&0x0001u16.to_be_bytes());
        body
    }

    #[tokio::test]
    async fn test_happy_path_with_compression() {
        let mut h = spawn_session();

        // STARTUP negotiates snappy; upstream must not see the entry.
        send(
            &mut h.client,
            &request(
                Opcode::Startup,
                0,
                string_map_body(&[("CQL_VERSION", "3.0.0"), ("COMPRESSION", "snappy")]),
            ),
        )
        .await;
        let startup = recv(&mut h.upstream, Direction::Request).await;
        let mut reader = BodyReader::new(&startup.body);
        assert_eq!(
            reader.read_string_map().unwrap(),
            vec![("CQL_VERSION".to_string(), "3.0.0".to_string())]
        );

        // CREDENTIALS: the user token becomes the internal token.
        send(
            &mut h.client,
            &request(
                Opcode::Credentials,
                1,
                string_map_body(&[
                    ("username", &format!("{}alice", USER_TOKEN)),
                    ("password", "secret"),
                ]),
            ),
        )
        .await;
        let credentials = recv(&mut h.upstream, Direction::Request).await;
        let mut reader = BodyReader::new(&credentials.body);
        let entries = reader.read_string_map().unwrap();
        assert_eq!(entries[0].1, format!("{}alice", TOKEN));

        // READY comes back compressed now that snappy is negotiated.
        send(&mut h.upstream, &response(Opcode::Ready, 1, Vec::new())).await;
        let ready = recv(&mut h.client, Direction::Response).await;
        assert!(ready.is_compressed());
        assert!(Compression::Snappy.decompress(&ready.body).unwrap().is_empty());

        // A compressed QUERY reaches the upstream decompressed and rewritten.
        let mut query = request(Opcode::Query, 2, query_body("USE app;"));
        query.body = Compression::Snappy.compress(&query.body).unwrap();
        query.flags |= flags::COMPRESSION;
        send(&mut h.client, &query).await;

        let forwarded = recv(&mut h.upstream, Direction::Request).await;
        assert!(!forwarded.is_compressed());
        let mut reader = BodyReader::new(&forwarded.body);
        assert_eq!(
            reader.read_long_string().unwrap(),
            format!("USE {}app;", TOKEN)
        );

        // SET_KEYSPACE comes back with the prefix stripped.
        let mut body = Vec::new();
        body.put_i32(result_kind::SET_KEYSPACE);
        write_string(&mut body, &format!("{}app", TOKEN));
        send(&mut h.upstream, &response(Opcode::Result, 2, body)).await;

        let set_keyspace = recv(&mut h.client, Direction::Response).await;
        let plain = Compression::Snappy.decompress(&set_keyspace.body).unwrap();
        let mut reader = BodyReader::new(&plain);
        assert_eq!(reader.read_i32().unwrap(), result_kind::SET_KEYSPACE);
        assert_eq!(reader.read_string().unwrap(), "app");
    }

    #[tokio::test]
    async fn test_foreign_execute_is_refused_without_contacting_upstream() {
        let mut h = spawn_session();

        send(
            &mut h.client,
            &request(
                Opcode::Credentials,
                0,
                string_map_body(&[("username", &format!("{}alice", USER_TOKEN))]),
            ),
        )
        .await;
        recv(&mut h.upstream, Direction::Request).await;

        let mut body = Vec::new();
        write_short_bytes(&mut body, &[0xDE, 0xAD]);
        send(&mut h.client, &request(Opcode::Execute, 3, body)).await;

        let error = recv(&mut h.client, Direction::Response).await;
        assert_eq!(error.opcode, Opcode::Error);
        assert_eq!(error.stream, 3);
        let mut reader = BodyReader::new(&error.body);
        assert_eq!(reader.read_i32().unwrap(), wire_code::UNAUTHORIZED);

        // Nothing but the CREDENTIALS packet ever reached the upstream.
        let next = frame::read_frame(&mut h.upstream, Direction::Request, None, 1024)
            .await
            .unwrap();
        assert!(next.is_none(), "session should be closed");
    }

    #[tokio::test]
    async fn test_negative_stream_id_echoed_in_error() {
        let mut h = spawn_session();

        send(&mut h.client, &request(Opcode::Options, -4, Vec::new())).await;
        let error = recv(&mut h.client, Direction::Response).await;
        assert_eq!(error.opcode, Opcode::Error);
        assert_eq!(error.stream, -4);
        let mut reader = BodyReader::new(&error.body);
        assert_eq!(reader.read_i32().unwrap(), wire_code::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_schema_event_for_other_tenant_never_reaches_client() {
        let mut h = spawn_session();

        send(
            &mut h.client,
            &request(
                Opcode::Credentials,
                0,
                string_map_body(&[("username", &format!("{}alice", USER_TOKEN))]),
            ),
        )
        .await;
        recv(&mut h.upstream, Direction::Request).await;

        // Foreign schema event, then READY: only READY arrives.
        let mut event_body = Vec::new();
        write_string(&mut event_body, "SCHEMA_CHANGE");
        write_string(&mut event_body, "CREATED");
        write_string(&mut event_body, "uuuuuuuuuuuuuuuuuuuuother");
        write_string(&mut event_body, "table1");
        send(&mut h.upstream, &response(Opcode::Event, -1, event_body)).await;
        send(&mut h.upstream, &response(Opcode::Ready, 0, Vec::new())).await;

        let first = recv(&mut h.client, Direction::Response).await;
        assert_eq!(first.opcode, Opcode::Ready);
    }

    #[tokio::test]
    async fn test_upstream_close_ends_session_quietly() {
        let mut h = spawn_session();
        drop(h.upstream);

        let closed = frame::read_frame(&mut h.client, Direction::Response, None, 1024)
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_version_pinned_by_first_packet() {
        let mut h = spawn_session();

        send(
            &mut h.client,
            &request(Opcode::Startup, 0, string_map_body(&[("CQL_VERSION", "3.0.0")])),
        )
        .await;
        recv(&mut h.upstream, Direction::Request).await;

        // A later packet claiming a different version is a protocol error.
        let mut wrong = request(Opcode::Options, 1, Vec::new());
        wrong.version = 0x02;
        send(&mut h.client, &wrong).await;

        let error = recv(&mut h.client, Direction::Response).await;
        assert_eq!(error.opcode, Opcode::Error);
        let mut reader = BodyReader::new(&error.body);
        assert_eq!(reader.read_i32().unwrap(), wire_code::PROTOCOL_ERROR);
    }
}
