//! CQL native protocol v1 support
//!
//! Framing, body notation codecs, result-set metadata, and row-set
//! parsing for the binary protocol the gateway rewrites on the wire.

pub mod body;
pub mod codec;
pub mod frame;
pub mod metadata;
pub mod rows;

pub use codec::Compression;
