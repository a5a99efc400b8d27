//! Request rewriting (client → upstream)
//!
//! Runs on the decompressed body of every client packet. STARTUP and
//! CREDENTIALS mutate the session (codec, tenant token); QUERY and
//! PREPARE go through the keyspace-prefix rewriter; EXECUTE is checked
//! against the prepared-statement registry. Anything else the protocol
//! allows from a client passes through; anything it does not is a
//! protocol error that ends the session.

use cassgate_common::{GatewayError, Result};
use tracing::debug;

use crate::cql::body::{write_long_string, write_string_map, BodyReader};
use crate::cql::frame::{Frame, Opcode, PROTOCOL_V1};
use crate::cql::Compression;
use crate::prepared::PreparedRegistry;
use crate::rewrite::statement::{is_interesting, rewrite_statement};
use crate::session::SessionState;
use crate::validator::TokenValidator;

/// Everything a request rewrite can touch
pub struct RequestContext<'a> {
    pub state: &'a SessionState,
    pub validator: &'a dyn TokenValidator,
    pub prepared: &'a PreparedRegistry,
    pub token_length: usize,
}

/// Rewrite one client packet for the upstream link. The returned frame's
/// compression flag is already clear; the caller forwards it verbatim.
pub async fn rewrite_request(frame: Frame, ctx: &RequestContext<'_>) -> Result<Frame> {
    match frame.opcode {
        Opcode::Startup => rewrite_startup(frame, ctx),
        Opcode::Credentials => rewrite_credentials(frame, ctx).await,
        Opcode::Query => rewrite_query(frame, ctx, true),
        Opcode::Prepare => rewrite_query(frame, ctx, false),
        Opcode::Execute => check_execute(frame, ctx),
        Opcode::Options | Opcode::Register => Ok(frame),
        other => Err(GatewayError::Protocol(format!(
            "unexpected {} from client",
            other.name()
        ))),
    }
}

/// STARTUP: record the negotiated codec and hide the COMPRESSION entry
/// from the upstream, which always runs uncompressed.
fn rewrite_startup(mut frame: Frame, ctx: &RequestContext<'_>) -> Result<Frame> {
    let mut reader = BodyReader::new(&frame.body);
    let mut entries = reader.read_string_map()?;
    if entries.is_empty() {
        return Err(GatewayError::Protocol("malformed STARTUP".into()));
    }

    if let Some(idx) = entries.iter().position(|(key, _)| key == "COMPRESSION") {
        let (_, codec_name) = entries.remove(idx);
        let codec = Compression::from_name(&codec_name)?;
        ctx.state.set_compression(codec);
        debug!(codec = %codec_name, "client negotiated compression");
    }

    let mut body = Vec::new();
    write_string_map(&mut body, &entries);
    frame.body = body;
    Ok(frame)
}

/// CREDENTIALS: extract the user token from the username prefix, validate
/// it, and substitute the internal token so the upstream sees the
/// tenant-scoped principal.
async fn rewrite_credentials(mut frame: Frame, ctx: &RequestContext<'_>) -> Result<Frame> {
    if frame.version != PROTOCOL_V1 {
        return Err(GatewayError::Protocol(
            "CREDENTIALS is only valid in protocol version 1".into(),
        ));
    }

    let mut reader = BodyReader::new(&frame.body);
    let mut entries = reader.read_string_map()?;
    if entries.is_empty() {
        return Err(GatewayError::BadCredentials("no credentials supplied".into()));
    }

    let username_idx = entries
        .iter()
        .position(|(key, _)| key == "username")
        .ok_or_else(|| GatewayError::BadCredentials("no username supplied".into()))?;

    let supplied = entries[username_idx].1.as_str();
    if supplied.len() <= ctx.token_length || !supplied.is_char_boundary(ctx.token_length) {
        return Err(GatewayError::BadCredentials(
            "token + username is too short".into(),
        ));
    }
    let (user_token, real_username) = supplied.split_at(ctx.token_length);

    // The validator is awaited without the session lock; the token is
    // stored under it afterwards, still exactly once per session.
    let validation = ctx.validator.validate(user_token).await?;
    if validation.is_expired() {
        return Err(GatewayError::TokenExpired);
    }

    let effective = format!("{}{}", validation.internal_token.as_str(), real_username);
    ctx.state.set_token(validation.internal_token)?;
    debug!(username = %real_username, "tenant authenticated");

    entries[username_idx].1 = effective;
    let mut body = Vec::new();
    write_string_map(&mut body, &entries);
    frame.body = body;
    Ok(frame)
}

/// QUERY and PREPARE share a body shape: a `[long string]` statement,
/// followed for QUERY by two consistency bytes preserved verbatim.
fn rewrite_query(mut frame: Frame, ctx: &RequestContext<'_>, has_consistency: bool) -> Result<Frame> {
    let mut reader = BodyReader::new(&frame.body);
    let statement = reader.read_long_string()?;
    let tail = reader.rest().to_vec();
    if has_consistency && tail.len() < 2 {
        return Err(GatewayError::Truncated {
            expected: 2,
            actual: tail.len(),
        });
    }

    // Before credentials there is no namespace to map into; the upstream
    // rejects unauthenticated queries itself.
    let rewritten = match ctx.state.token() {
        Some(token) => rewrite_statement(&statement, token.as_str()),
        None => statement,
    };

    if is_interesting(&rewritten) {
        ctx.state.mark_interesting(frame.stream);
        debug!(stream = frame.stream, "flagged stream for response filtering");
    }

    let mut body = Vec::new();
    write_long_string(&mut body, &rewritten);
    body.extend_from_slice(&tail);
    frame.body = body;
    Ok(frame)
}

/// EXECUTE: the leading prepared id must belong to this session's tenant.
fn check_execute(frame: Frame, ctx: &RequestContext<'_>) -> Result<Frame> {
    let mut reader = BodyReader::new(&frame.body);
    let prepared_id = reader.read_short_bytes()?;

    let token = ctx
        .state
        .token()
        .ok_or_else(|| GatewayError::Unauthorized("session is not authenticated".into()))?;
    if !ctx.prepared.is_owned_by(&prepared_id, &token) {
        return Err(GatewayError::Unauthorized(
            "prepared statement belongs to another tenant".into(),
        ));
    }
    Ok(frame)
}
