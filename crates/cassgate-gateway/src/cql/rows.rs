//! Row-set parsing and serialization
//!
//! A ROWS result carries `[i32 row count]` followed by `rows × cols` cells,
//! each an i32 length (negative = null) and that many bytes of opaque
//! content. The gateway materializes the grid so the row filter can drop
//! whole rows, then re-serializes; the output is never longer than the
//! input.

use bytes::BufMut;
use cassgate_common::{GatewayError, Result};

use super::body::{write_bytes_cell, BodyReader};

/// One row: a cell per column, `None` for wire nulls
pub type Row = Vec<Option<Vec<u8>>>;

/// A fully parsed row grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSet {
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Parse `[i32 row count]` + cells at the reader's position.
    pub fn parse(reader: &mut BodyReader<'_>, columns: usize) -> Result<Self> {
        let row_count = reader.read_i32()?;
        if row_count < 0 {
            return Err(GatewayError::Protocol(format!(
                "negative row count {}",
                row_count
            )));
        }

        let mut rows = Vec::new();
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(columns);
            for _ in 0..columns {
                row.push(reader.read_bytes_cell()?);
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    /// Serialize as `[i32 row count]` + cells.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.put_i32(self.rows.len() as i32);
        for row in &self.rows {
            for cell in row {
                write_bytes_cell(buf, cell.as_deref());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[Option<&[u8]>]]) -> RowSet {
        RowSet {
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.map(|b| b.to_vec())).collect())
                .collect(),
        }
    }

    #[test]
    fn test_round_trip() {
        let set = grid(&[
            &[Some(b"system"), Some(b"true")],
            &[None, Some(b"false")],
        ]);
        let mut buf = Vec::new();
        set.write(&mut buf);

        let mut reader = BodyReader::new(&buf);
        let parsed = RowSet::parse(&mut reader, 2).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_empty_grid() {
        let set = grid(&[]);
        let mut buf = Vec::new();
        set.write(&mut buf);
        let mut reader = BodyReader::new(&buf);
        let parsed = RowSet::parse(&mut reader, 4).unwrap();
        assert!(parsed.rows.is_empty());
    }

    #[test]
    fn test_dropping_rows_shrinks_output() {
        let mut set = grid(&[
            &[Some(b"keep")],
            &[Some(b"drop-me-please")],
        ]);
        let mut before = Vec::new();
        set.write(&mut before);

        set.rows.truncate(1);
        let mut after = Vec::new();
        set.write(&mut after);
        assert!(after.len() < before.len());
        assert_eq!(&after[..4], &1i32.to_be_bytes());
    }

    #[test]
    fn test_truncated_cells_fail() {
        let set = grid(&[&[Some(b"abcdef")]]);
        let mut buf = Vec::new();
        set.write(&mut buf);
        let mut reader = BodyReader::new(&buf[..buf.len() - 2]);
        assert!(RowSet::parse(&mut reader, 1).is_err());
    }

    #[test]
    fn test_negative_row_count_rejected() {
        let mut buf = Vec::new();
        buf.put_i32(-1);
        let mut reader = BodyReader::new(&buf);
        assert!(matches!(
            RowSet::parse(&mut reader, 1),
            Err(GatewayError::Protocol(_))
        ));
    }
}
