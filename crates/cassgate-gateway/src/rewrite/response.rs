//! Response rewriting (upstream → client)
//!
//! Strips the tenant's internal token out of everything the upstream says
//! before a client sees it: error messages, SET_KEYSPACE and SCHEMA_CHANGE
//! names, and schema events. ROWS results on flagged streams are run
//! through the row filter. PREPARED results feed the ownership registry.
//! Schema events for other tenants are dropped outright.

use cassgate_common::error::wire_code;
use cassgate_common::{GatewayError, Result, TenantToken};
use tracing::debug;

use crate::cql::body::{write_string, BodyReader};
use crate::cql::frame::{result_kind, Frame, Opcode};
use crate::cql::metadata::ResultMetadata;
use crate::cql::rows::RowSet;
use crate::prepared::PreparedRegistry;
use crate::rewrite::filter::{filter_rows, is_privileged_table};
use crate::session::SessionState;

/// What to do with an upstream packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    Forward(Frame),
    /// The packet does not concern this tenant; the client never sees it.
    Drop,
}

/// Everything a response rewrite can touch
pub struct ResponseContext<'a> {
    pub state: &'a SessionState,
    pub prepared: &'a PreparedRegistry,
    pub restricted_keyspace: &'a str,
}

/// Rewrite one upstream packet for the client link.
pub fn rewrite_response(frame: Frame, ctx: &ResponseContext<'_>) -> Result<ResponseAction> {
    // A flagged stream is cleared by whatever response correlates to it,
    // error or not, so the set stays balanced. Events are uncorrelated.
    let was_interesting = match frame.opcode {
        Opcode::Event => false,
        _ => ctx.state.take_interesting(frame.stream),
    };

    match frame.opcode {
        Opcode::Error => rewrite_error(frame, ctx).map(ResponseAction::Forward),
        Opcode::Result => rewrite_result(frame, ctx, was_interesting),
        Opcode::Event => rewrite_event(frame, ctx),
        Opcode::Ready | Opcode::Supported => Ok(ResponseAction::Forward(frame)),
        Opcode::Authenticate => {
            let mut reader = BodyReader::new(&frame.body);
            if let Ok(authenticator) = reader.read_string() {
                debug!(%authenticator, "upstream requested authentication");
            }
            Ok(ResponseAction::Forward(frame))
        }
        other => Err(GatewayError::Protocol(format!(
            "unexpected {} from upstream",
            other.name()
        ))),
    }
}

/// ERROR: `[i32 code][string message]` + code-specific trailer. The token
/// must not leak through messages like "Keyspace 'tttt…app' already
/// exists", and the ALREADY_EXISTS trailer names the keyspace outright.
fn rewrite_error(mut frame: Frame, ctx: &ResponseContext<'_>) -> Result<Frame> {
    let token = match ctx.state.token() {
        Some(token) => token,
        None => return Ok(frame),
    };

    let mut reader = BodyReader::new(&frame.body);
    let code = reader.read_i32()?;
    let mut message = reader.read_string()?;

    // Fixed-width removal can splice two halves of the token back
    // together, so repeat until clean.
    while message.contains(token.as_str()) {
        message = message.replace(token.as_str(), "");
    }

    let mut body = Vec::new();
    body.extend_from_slice(&code.to_be_bytes());
    write_string(&mut body, &message);

    if code == wire_code::ALREADY_EXISTS {
        let keyspace = reader.read_string()?;
        let table = reader.read_string()?;
        write_string(&mut body, strip_prefix(&keyspace, &token));
        write_string(&mut body, &table);
    } else {
        body.extend_from_slice(reader.rest());
    }

    frame.body = body;
    Ok(frame)
}

fn rewrite_result(
    frame: Frame,
    ctx: &ResponseContext<'_>,
    was_interesting: bool,
) -> Result<ResponseAction> {
    let mut reader = BodyReader::new(&frame.body);
    let kind = reader.read_i32()?;

    match kind {
        result_kind::VOID => Ok(ResponseAction::Forward(frame)),
        result_kind::ROWS => rewrite_rows(frame, ctx, was_interesting),
        result_kind::SET_KEYSPACE => {
            let keyspace = reader.read_string()?;
            let stripped = match ctx.state.token() {
                Some(token) => strip_prefix(&keyspace, &token).to_string(),
                None => keyspace,
            };

            let mut frame = frame;
            let mut body = Vec::new();
            body.extend_from_slice(&result_kind::SET_KEYSPACE.to_be_bytes());
            write_string(&mut body, &stripped);
            frame.body = body;
            Ok(ResponseAction::Forward(frame))
        }
        result_kind::PREPARED => {
            let prepared_id = reader.read_short_bytes()?;
            // Metadata strings are left as-is on this path; the walk only
            // validates the block before the frame goes out.
            ResultMetadata::parse(&mut reader)?;

            let token = ctx.state.token().ok_or_else(|| {
                GatewayError::Protocol("PREPARED result on an unauthenticated session".into())
            })?;
            // Recorded before the response is forwarded, so an EXECUTE
            // racing this response cannot observe an unknown id.
            ctx.prepared.record(prepared_id, token);
            Ok(ResponseAction::Forward(frame))
        }
        result_kind::SCHEMA_CHANGE => {
            let change = reader.read_string()?;
            let keyspace = reader.read_string()?;
            let table = reader.read_string()?;
            let stripped = match ctx.state.token() {
                Some(token) => strip_prefix(&keyspace, &token).to_string(),
                None => keyspace,
            };

            let mut frame = frame;
            let mut body = Vec::new();
            body.extend_from_slice(&result_kind::SCHEMA_CHANGE.to_be_bytes());
            write_string(&mut body, &change);
            write_string(&mut body, &stripped);
            write_string(&mut body, &table);
            frame.body = body;
            Ok(ResponseAction::Forward(frame))
        }
        other => Err(GatewayError::Protocol(format!(
            "unexpected result kind {} from upstream",
            other
        ))),
    }
}

/// ROWS: parse the whole grid (a malformed result is fatal), and filter it
/// only when this stream was flagged on the way in and the result
/// addresses one of the privileged metadata tables. An untouched result
/// forwards byte-identical.
fn rewrite_rows(
    frame: Frame,
    ctx: &ResponseContext<'_>,
    was_interesting: bool,
) -> Result<ResponseAction> {
    let mut reader = BodyReader::new(&frame.body);
    let _kind = reader.read_i32()?;
    let metadata = ResultMetadata::parse(&mut reader)?;
    // The kind prefix plus the metadata block is copied through untouched.
    let metadata_end = 4 + metadata.byte_len;
    let mut rows = RowSet::parse(&mut reader, metadata.columns.len())?;

    let privileged = metadata
        .addressed_table()
        .map(|(ks, tbl)| is_privileged_table(ks, tbl))
        .unwrap_or(false);
    let token = ctx.state.token();

    if !(was_interesting && privileged && token.is_some()) {
        return Ok(ResponseAction::Forward(frame));
    }

    let before = rows.rows.len();
    filter_rows(
        &mut rows,
        &metadata.columns,
        token.as_ref().expect("checked above"),
        ctx.restricted_keyspace,
    );
    debug!(
        stream = frame.stream,
        kept = rows.rows.len(),
        dropped = before - rows.rows.len(),
        "filtered privileged result"
    );

    let mut frame = frame;
    let mut body = Vec::with_capacity(frame.body.len());
    body.extend_from_slice(&frame.body[..metadata_end]);
    rows.write(&mut body);
    frame.body = body;
    Ok(ResponseAction::Forward(frame))
}

/// EVENT: schema changes are forwarded (unprefixed) only to the tenant
/// they belong to; everything else passes through to every subscriber.
fn rewrite_event(frame: Frame, ctx: &ResponseContext<'_>) -> Result<ResponseAction> {
    let mut reader = BodyReader::new(&frame.body);
    let event_type = reader.read_string()?;
    if event_type != "SCHEMA_CHANGE" {
        return Ok(ResponseAction::Forward(frame));
    }

    let change = reader.read_string()?;
    let keyspace = reader.read_string()?;
    let table = reader.read_string()?;

    let token = ctx.state.token();
    let owned = token
        .as_ref()
        .map(|t| keyspace.starts_with(t.as_str()))
        .unwrap_or(false);
    if !owned {
        debug!(%keyspace, "schema change for another tenant, dropping");
        return Ok(ResponseAction::Drop);
    }
    let token = token.expect("owned implies a token");

    let mut frame = frame;
    let mut body = Vec::new();
    write_string(&mut body, &event_type);
    write_string(&mut body, &change);
    write_string(&mut body, strip_prefix(&keyspace, &token));
    write_string(&mut body, &table);
    frame.body = body;
    Ok(ResponseAction::Forward(frame))
}

fn strip_prefix<'a>(name: &'a str, token: &TenantToken) -> &'a str {
    name.strip_prefix(token.as_str()).unwrap_or(name)
}
