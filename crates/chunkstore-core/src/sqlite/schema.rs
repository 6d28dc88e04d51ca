//! Schema and connection setup for the SQLite backend.
//!
//! Tables:
//! - `metadata`: one `(key, json)` row per committed entry
//! - `pending_writes`: keys with a saver opened but not yet closed
//! - one data table per key, named by the key string

use rusqlite::{Connection, OptionalExtension};
use std::time::Duration;

use crate::error::StoreResult;

/// DDL for the shared tables.
///
/// `metadata` has no UNIQUE constraint. The commit transaction checks
/// uniqueness; a duplicated row is reported as corruption on read.
pub const CACHE_SCHEMA: &str = r#"
-- Committed metadata, one row per cached key
CREATE TABLE IF NOT EXISTS metadata (
    name             TEXT,
    metadata         TEXT
);

-- Writes in progress (or abandoned); keys listed here read as not cached
CREATE TABLE IF NOT EXISTS pending_writes (
    name             TEXT PRIMARY KEY,
    started_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_metadata_name
    ON metadata(name);
"#;

pub(crate) fn init_connection_impl(conn: &Connection, busy_timeout: Duration) -> StoreResult<()> {
    conn.busy_timeout(busy_timeout)?;
    // WAL mode for file-backed DBs (reports "memory" for in-memory)
    let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0));
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(())
}

/// Name of the table SQLite resolves `table` to, if any.
///
/// SQLite identifiers ignore ASCII case, so the stored name may differ from
/// `table` in case; such a table belongs to another key.
pub(crate) fn stored_table_name_impl(
    conn: &Connection,
    table: &str,
) -> StoreResult<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(name)
}

/// Whether a table named exactly `table` exists.
pub(crate) fn table_exists_impl(conn: &Connection, table: &str) -> StoreResult<bool> {
    Ok(stored_table_name_impl(conn, table)?.as_deref() == Some(table))
}

pub(crate) fn list_tables_impl(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
pub(crate) fn in_immediate_txn_impl<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> StoreResult<T>,
) -> StoreResult<T> {
    conn.execute("BEGIN IMMEDIATE", [])?;

    let result = f(conn);

    match &result {
        Ok(_) => {
            if let Err(e) = conn.execute("COMMIT", []) {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e.into());
            }
        }
        Err(_) => {
            let _ = conn.execute("ROLLBACK", []);
        }
    }

    result
}
