//! Tenant row filtering
//!
//! The shared node's own metadata tables list every tenant's keyspaces,
//! column families, and users side by side. When a flagged stream returns
//! rows from one of those tables, each row is inspected through its
//! *important* columns (`keyspace_name`, `name`): a row survives only if
//! every important cell either carries the tenant's internal token or
//! names one of the open metadata namespaces, and no cell names the
//! gateway's own restricted keyspace. One failing cell removes the whole
//! row.

use cassgate_common::TenantToken;

use crate::cql::metadata::ColumnSpec;
use crate::cql::rows::RowSet;

/// Namespaces whose rows every tenant may see verbatim
const OPEN_NAMESPACES: &[&str] = &["system", "system_auth", "system_traces"];

/// Columns that can expose a row's owning namespace
const IMPORTANT_COLUMNS: &[&str] = &["keyspace_name", "name"];

/// The metadata tables whose rows are subject to filtering
const PRIVILEGED_TABLES: &[(&str, &str)] = &[
    ("system", "schema_keyspaces"),
    ("system", "schema_columnfamilies"),
    ("system", "schema_columns"),
    ("system_auth", "users"),
];

/// Whether a result addressed to (keyspace, table) must be row-filtered.
pub fn is_privileged_table(keyspace: &str, table: &str) -> bool {
    PRIVILEGED_TABLES
        .iter()
        .any(|&(ks, tbl)| ks == keyspace && tbl == table)
}

/// Drop rows that belong to other tenants. Rows with no important columns
/// pass unchanged.
pub fn filter_rows(
    rows: &mut RowSet,
    columns: &[ColumnSpec],
    token: &TenantToken,
    restricted_keyspace: &str,
) {
    let important: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, col)| IMPORTANT_COLUMNS.contains(&col.name.as_str()))
        .map(|(i, _)| i)
        .collect();
    if important.is_empty() {
        return;
    }

    rows.rows
        .retain(|row| important.iter().all(|&i| cell_allowed(row.get(i), token, restricted_keyspace)));
}

/// A single important cell's verdict.
fn cell_allowed(
    cell: Option<&Option<Vec<u8>>>,
    token: &TenantToken,
    restricted_keyspace: &str,
) -> bool {
    let text = match cell {
        Some(Some(content)) => String::from_utf8_lossy(content),
        // A null or missing cell cannot prove ownership.
        _ => return false,
    };

    if text.eq_ignore_ascii_case(restricted_keyspace) {
        return false;
    }
    text.contains(token.as_str())
        || OPEN_NAMESPACES.iter().any(|ns| text.eq_ignore_ascii_case(ns))
}
