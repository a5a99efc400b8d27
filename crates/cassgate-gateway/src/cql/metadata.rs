//! Result-set metadata parsing
//!
//! The metadata block heads both ROWS and PREPARED result bodies:
//! `[i32 flags][i32 column count]`, a global `(keyspace, table)` pair when
//! the global-tables flag is set, then per column an optional
//! `(keyspace, table)` pair (only when the flag is unset), the column name,
//! and a u16 type code with a type-specific payload for custom, list, map,
//! and set types. Collection element types may themselves be custom; the
//! protocol bounds that nesting to one level here.
//!
//! The gateway never rewrites metadata strings; it parses the block to
//! learn the addressed `(keyspace, table)`, the column names for the row
//! filter, and the exact byte length of the block so the row data behind
//! it can be located.

use cassgate_common::{GatewayError, Result};

use super::body::BodyReader;

/// Metadata flag: one global (keyspace, table) pair instead of per-column pairs
pub const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;

/// Type codes with a trailing payload in the column spec
const TYPE_CUSTOM: u16 = 0x0000;
const TYPE_LIST: u16 = 0x0020;
const TYPE_MAP: u16 = 0x0021;
const TYPE_SET: u16 = 0x0022;

/// One column of a result set
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub type_code: u16,
}

/// Parsed metadata block
#[derive(Debug, Clone)]
pub struct ResultMetadata {
    /// Keyspace the result addresses: the global pair, or the first column's
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub columns: Vec<ColumnSpec>,
    /// Total byte length of the metadata block
    pub byte_len: usize,
}

impl ResultMetadata {
    /// Parse a metadata block at the reader's position.
    pub fn parse(reader: &mut BodyReader<'_>) -> Result<Self> {
        let start = reader.position();

        let flags = reader.read_i32()?;
        let columns_count = reader.read_i32()?;
        if columns_count < 0 {
            return Err(GatewayError::Protocol(format!(
                "negative column count {}",
                columns_count
            )));
        }

        let global = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
        let mut keyspace = None;
        let mut table = None;

        if global {
            keyspace = Some(reader.read_string()?);
            table = Some(reader.read_string()?);
        }

        let mut columns = Vec::new();
        for i in 0..columns_count {
            if !global {
                let col_keyspace = reader.read_string()?;
                let col_table = reader.read_string()?;
                if i == 0 {
                    keyspace = Some(col_keyspace);
                    table = Some(col_table);
                }
            }

            let name = reader.read_string()?;
            let type_code = reader.read_u16()?;
            skip_type_payload(reader, type_code)?;
            columns.push(ColumnSpec { name, type_code });
        }

        Ok(Self {
            keyspace,
            table,
            columns,
            byte_len: reader.position() - start,
        })
    }

    /// The (keyspace, table) pair this result addresses, when known.
    pub fn addressed_table(&self) -> Option<(&str, &str)> {
        match (&self.keyspace, &self.table) {
            (Some(ks), Some(t)) => Some((ks.as_str(), t.as_str())),
            _ => None,
        }
    }
}

/// Advance past the payload that follows a type code.
fn skip_type_payload(reader: &mut BodyReader<'_>, type_code: u16) -> Result<()> {
    match type_code {
        TYPE_CUSTOM => {
            reader.read_string()?;
        }
        TYPE_LIST | TYPE_SET => {
            skip_element_type(reader)?;
        }
        TYPE_MAP => {
            skip_element_type(reader)?;
            skip_element_type(reader)?;
        }
        _ => {}
    }
    Ok(())
}

/// A collection element type: a u16 code, plus a class name for custom.
fn skip_element_type(reader: &mut BodyReader<'_>) -> Result<()> {
    let code = reader.read_u16()?;
    if code == TYPE_CUSTOM {
        reader.read_string()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::body::write_string;
    use bytes::BufMut;

    const TYPE_VARCHAR: u16 = 0x000D;

    fn global_metadata(keyspace: &str, table: &str, columns: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i32(FLAG_GLOBAL_TABLES_SPEC);
        buf.put_i32(columns.len() as i32);
        write_string(&mut buf, keyspace);
        write_string(&mut buf, table);
        for name in columns {
            write_string(&mut buf, name);
            buf.put_u16(TYPE_VARCHAR);
        }
        buf
    }

    #[test]
    fn test_global_tables_spec() {
        let buf = global_metadata("system", "schema_keyspaces", &["keyspace_name", "durable_writes"]);
        let mut reader = BodyReader::new(&buf);
        let meta = ResultMetadata::parse(&mut reader).unwrap();

        assert_eq!(meta.addressed_table(), Some(("system", "schema_keyspaces")));
        assert_eq!(meta.columns.len(), 2);
        assert_eq!(meta.columns[0].name, "keyspace_name");
        assert_eq!(meta.byte_len, buf.len());
    }

    #[test]
    fn test_per_column_spec_takes_first_pair() {
        let mut buf = Vec::new();
        buf.put_i32(0);
        buf.put_i32(2);
        for (ks, tbl, name) in [
            ("system_auth", "users", "name"),
            ("system_auth", "users", "super"),
        ] {
            write_string(&mut buf, ks);
            write_string(&mut buf, tbl);
            write_string(&mut buf, name);
            buf.put_u16(TYPE_VARCHAR);
        }

        let mut reader = BodyReader::new(&buf);
        let meta = ResultMetadata::parse(&mut reader).unwrap();
        assert_eq!(meta.addressed_table(), Some(("system_auth", "users")));
        assert_eq!(meta.columns[1].name, "super");
        assert_eq!(meta.byte_len, buf.len());
    }

    #[test]
    fn test_collection_type_payloads() {
        let mut buf = Vec::new();
        buf.put_i32(FLAG_GLOBAL_TABLES_SPEC);
        buf.put_i32(3);
        write_string(&mut buf, "app");
        write_string(&mut buf, "things");
        // list<custom>
        write_string(&mut buf, "tags");
        buf.put_u16(0x0020);
        buf.put_u16(0x0000);
        write_string(&mut buf, "org.example.Type");
        // map<varchar, varchar>
        write_string(&mut buf, "attrs");
        buf.put_u16(0x0021);
        buf.put_u16(TYPE_VARCHAR);
        buf.put_u16(TYPE_VARCHAR);
        // custom
        write_string(&mut buf, "blob_ish");
        buf.put_u16(0x0000);
        write_string(&mut buf, "org.example.Other");

        let mut reader = BodyReader::new(&buf);
        let meta = ResultMetadata::parse(&mut reader).unwrap();
        assert_eq!(meta.columns.len(), 3);
        assert_eq!(meta.byte_len, buf.len());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_metadata_fails() {
        let buf = global_metadata("system", "local", &["key"]);
        let mut reader = BodyReader::new(&buf[..buf.len() - 3]);
        assert!(ResultMetadata::parse(&mut reader).is_err());
    }

    #[test]
    fn test_zero_columns_without_global_spec() {
        let mut buf = Vec::new();
        buf.put_i32(0);
        buf.put_i32(0);
        let mut reader = BodyReader::new(&buf);
        let meta = ResultMetadata::parse(&mut reader).unwrap();
        assert_eq!(meta.addressed_table(), None);
        assert!(meta.columns.is_empty());
    }
}
