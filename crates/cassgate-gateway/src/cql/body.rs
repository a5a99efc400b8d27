//! Body notation codecs
//!
//! Checked reads over a packet body for the protocol's notations:
//! `[string]` (u16 length + UTF-8), `[long string]` (i32 length + UTF-8),
//! `[string map]` (u16 count + string pairs), `[short bytes]` (u16 length
//! + raw bytes), and `[bytes]` cells (i32 length, negative = null). All
//! integers are big-endian. A read past the end of the body is a protocol
//! error, never a panic.

use bytes::BufMut;
use cassgate_common::{GatewayError, Result};

/// Checked cursor over a packet body.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left in the body
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The unread tail of the body
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(GatewayError::Truncated {
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    /// `[string]`: u16 length + UTF-8 bytes
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| GatewayError::Protocol("string is not valid UTF-8".into()))
    }

    /// `[long string]`: i32 length + UTF-8 bytes
    pub fn read_long_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(GatewayError::Protocol(format!(
                "negative long string length {}",
                len
            )));
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| GatewayError::Protocol("long string is not valid UTF-8".into()))
    }

    /// `[short bytes]`: u16 length + raw bytes
    pub fn read_short_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// `[bytes]` cell: i32 length + raw bytes; negative length means null
    pub fn read_bytes_cell(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    /// `[string map]`: u16 pair count + (key, value) strings, order kept
    pub fn read_string_map(&mut self) -> Result<Vec<(String, String)>> {
        let count = self.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub fn write_long_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

pub fn write_short_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

pub fn write_bytes_cell(buf: &mut Vec<u8>, cell: Option<&[u8]>) {
    match cell {
        Some(content) => {
            buf.put_i32(content.len() as i32);
            buf.put_slice(content);
        }
        None => buf.put_i32(-1),
    }
}

pub fn write_string_map(buf: &mut Vec<u8>, entries: &[(String, String)]) {
    buf.put_u16(entries.len() as u16);
    for (key, value) in entries {
        write_string(buf, key);
        write_string(buf, value);
    }
}
