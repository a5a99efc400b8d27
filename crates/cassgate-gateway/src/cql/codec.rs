//! Body compression codecs
//!
//! Compression is negotiated once, in the STARTUP packet, and applies only
//! on the client link; the upstream link is always uncompressed. The lz4
//! framing follows the protocol convention of a big-endian u32 of the
//! uncompressed length ahead of the lz4 block; snappy uses the raw block
//! format.

use cassgate_common::{GatewayError, Result};

/// Negotiated codec for the client link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Snappy,
}

impl Compression {
    /// Resolve the codec named in a STARTUP `COMPRESSION` entry.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "lz4" => Ok(Compression::Lz4),
            "snappy" => Ok(Compression::Snappy),
            other => Err(GatewayError::UnknownCompression(other.to_string())),
        }
    }

    pub fn is_none(self) -> bool {
        self == Compression::None
    }

    /// Compress a body for the client link.
    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Err(GatewayError::UnknownCompression(
                "compression not negotiated".into(),
            )),
            Compression::Lz4 => {
                let mut out = Vec::with_capacity(4 + body.len());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&lz4_flex::block::compress(body));
                Ok(out)
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(body)
                .map_err(|e| GatewayError::Compression(format!("snappy compress: {}", e))),
        }
    }

    /// Decompress a client body flagged as compressed.
    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Err(GatewayError::UnknownCompression(
                "compression not negotiated".into(),
            )),
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(GatewayError::Compression(
                        "lz4 body shorter than its length prefix".into(),
                    ));
                }
                let expected =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                lz4_flex::block::decompress(&body[4..], expected)
                    .map_err(|e| GatewayError::Compression(format!("lz4 decompress: {}", e)))
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| GatewayError::Compression(format!("snappy decompress: {}", e))),
        }
    }
}
