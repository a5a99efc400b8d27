//! Frame-level framing for the CQL native protocol
//!
//! Every packet is a fixed 8-byte header followed by a body:
//!
//! ```text
//! offset
//!    0  version   — high bit: 0 = request, 1 = response; low 7 bits: protocol version
//!    1  flags     — bit 0: body compressed; bit 1: tracing
//!    2  stream    — signed correlation id, non-negative on requests
//!    3  opcode
//!    4  ┐
//!    5  │ length (i32, big-endian) — MUST equal the body byte count
//!    6  │
//!    7  ┘
//! ------
//!    body (length bytes)
//! ```
//!
//! The length field is never stored on [`Frame`]; it is recomputed from the
//! body on every write, so a forwarded packet cannot carry a stale length.

use cassgate_common::error::wire_code;
use cassgate_common::{GatewayError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed header size in bytes
pub const HEADER_LEN: usize = 8;

/// High bit of the version byte carries the packet direction
pub const DIRECTION_BIT: u8 = 0x80;

/// Low 7 bits of the version byte carry the protocol version
pub const VERSION_MASK: u8 = 0x7F;

/// The protocol version the CREDENTIALS flow requires
pub const PROTOCOL_V1: u8 = 0x01;

/// Header flag bits
pub mod flags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
}

/// RESULT body kinds
pub mod result_kind {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
    pub const PREPARED: i32 = 0x0004;
    pub const SCHEMA_CHANGE: i32 = 0x0005;
}

/// Which way a packet travels; encoded in the version byte's high bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Direction::Request => 0x00,
            Direction::Response => DIRECTION_BIT,
        }
    }
}

/// Packet opcodes (v1 numbering; the v2 tail is recognized so it can be
/// rejected by name rather than as garbage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x04 => Opcode::Credentials,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unknown opcode 0x{:02X}",
                    other
                )))
            }
        })
    }

    /// Display name for trace logs
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Error => "ERROR",
            Opcode::Startup => "STARTUP",
            Opcode::Ready => "READY",
            Opcode::Authenticate => "AUTHENTICATE",
            Opcode::Credentials => "CREDENTIALS",
            Opcode::Options => "OPTIONS",
            Opcode::Supported => "SUPPORTED",
            Opcode::Query => "QUERY",
            Opcode::Result => "RESULT",
            Opcode::Prepare => "PREPARE",
            Opcode::Execute => "EXECUTE",
            Opcode::Register => "REGISTER",
            Opcode::Event => "EVENT",
            Opcode::Batch => "BATCH",
            Opcode::AuthChallenge => "AUTH_CHALLENGE",
            Opcode::AuthResponse => "AUTH_RESPONSE",
            Opcode::AuthSuccess => "AUTH_SUCCESS",
        }
    }
}

/// One parsed packet. The wire length field is derived from `body` on
/// write, never carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version, low 7 bits only
    pub version: u8,
    pub direction: Direction,
    pub flags: u8,
    pub stream: i8,
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl Frame {
    /// Build an ERROR response packet: `[i32 code][string message]`.
    pub fn error(version: u8, stream: i8, code: i32, message: &str) -> Self {
        let mut body = Vec::with_capacity(4 + 2 + message.len());
        body.extend_from_slice(&code.to_be_bytes());
        body.extend_from_slice(&(message.len() as u16).to_be_bytes());
        body.extend_from_slice(message.as_bytes());
        Self {
            version,
            direction: Direction::Response,
            flags: 0,
            stream,
            opcode: Opcode::Error,
            body,
        }
    }

    /// Build the ERROR packet for a session-fatal [`GatewayError`].
    pub fn error_for(version: u8, stream: i8, err: &GatewayError) -> Self {
        let message = match err.wire_code() {
            wire_code::SERVER_ERROR => "Internal gateway error".to_string(),
            _ => err.to_string(),
        };
        Self::error(version, stream, err.wire_code(), &message)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSION != 0
    }
}

/// Read one frame, or `None` on a clean close at a frame boundary.
///
/// Enforces: the direction bit matches `expect`, the version's low bits
/// match the session version when one is already pinned, and the declared
/// length is within bounds. EOF after the first header byte is a short
/// read and fails the session.
pub async fn read_frame<R>(
    reader: &mut R,
    expect: Direction,
    pinned_version: Option<u8>,
    max_frame_len: usize,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];

    // First byte on its own so a close between packets is clean, not an error.
    match reader.read(&mut header[..1]).await? {
        0 => return Ok(None),
        _ => {}
    }
    reader.read_exact(&mut header[1..]).await?;

    let raw_version = header[0];
    let direction = if raw_version & DIRECTION_BIT == 0 {
        Direction::Request
    } else {
        Direction::Response
    };
    if direction != expect {
        return Err(GatewayError::Protocol(format!(
            "packet direction bit 0x{:02X} is wrong for this side of the session",
            raw_version & DIRECTION_BIT
        )));
    }

    let version = raw_version & VERSION_MASK;
    if let Some(pinned) = pinned_version {
        if version != pinned {
            return Err(GatewayError::Protocol(format!(
                "protocol version {} differs from the negotiated version {}",
                version, pinned
            )));
        }
    }

    // Request stream ids must be non-negative, but that is checked by the
    // ingress worker so its error packet can echo the offending id.
    let stream = header[2] as i8;

    let opcode = Opcode::from_u8(header[3])?;

    let length = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if length < 0 || length as usize > max_frame_len {
        return Err(GatewayError::FrameTooLarge {
            len: length as i64,
            max: max_frame_len,
        });
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    Ok(Some(Frame {
        version,
        direction,
        flags: header[1],
        stream,
        opcode,
        body,
    }))
}

/// Write one frame; the length field is computed from the body.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut packet = Vec::with_capacity(HEADER_LEN + frame.body.len());
    packet.push(frame.version | frame.direction.bit());
    packet.push(frame.flags);
    packet.push(frame.stream as u8);
    packet.push(frame.opcode as u8);
    packet.extend_from_slice(&(frame.body.len() as i32).to_be_bytes());
    packet.extend_from_slice(&frame.body);
    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}
