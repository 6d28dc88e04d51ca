//! Metadata rows, pending-write markers and the commit transaction.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::rows::{create_data_table_impl, drop_data_table_impl};
use super::schema::{in_immediate_txn_impl, stored_table_name_impl, table_exists_impl};
use crate::chunk::Schema;
use crate::config::OverwritePolicy;
use crate::error::{StoreError, StoreResult};
use crate::metadata::Metadata;

pub(crate) fn count_metadata_rows_impl(conn: &Connection, name: &str) -> StoreResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM metadata WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Read the single metadata record for `name`.
///
/// Zero rows, several rows, and unparseable rows are distinct corruption
/// errors.
pub(crate) fn read_metadata_impl(conn: &Connection, name: &str) -> StoreResult<Metadata> {
    let mut stmt = conn.prepare("SELECT metadata FROM metadata WHERE name = ?1")?;
    let rows = stmt
        .query_map([name], |row| {
            Ok(match row.get_ref(0)? {
                ValueRef::Text(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    match rows.as_slice() {
        [] => Err(StoreError::MetadataMissing {
            key: name.to_string(),
        }),
        [None] => Err(StoreError::misformatted(name, "metadata column is not text")),
        [Some(json)] => {
            Metadata::from_json(json).map_err(|reason| StoreError::misformatted(name, reason))
        }
        many => Err(StoreError::RepeatedMetadata {
            key: name.to_string(),
            count: many.len(),
        }),
    }
}

pub(crate) fn is_pending_impl(conn: &Connection, name: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_writes WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn list_metadata_names_impl(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT name FROM metadata WHERE name IS NOT NULL")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// A table, pending marker or metadata row whose name equals `name` apart
/// from ASCII case. SQLite would resolve such a table to `name`'s table.
pub(crate) fn case_variant_impl(conn: &Connection, name: &str) -> StoreResult<Option<String>> {
    if let Some(stored) = stored_table_name_impl(conn, name)? {
        if stored != name {
            return Ok(Some(stored));
        }
    }
    let other = conn
        .query_row(
            "SELECT name FROM pending_writes WHERE name = ?1 COLLATE NOCASE AND name <> ?1
             UNION ALL
             SELECT name FROM metadata WHERE name = ?1 COLLATE NOCASE AND name <> ?1
             LIMIT 1",
            [name],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(other)
}

/// Clear the way for a new write of `name` and plant its pending marker.
///
/// A committed entry is rejected or removed according to `policy`. Leftovers
/// of an uncommitted write (orphan table, stale metadata) are always removed.
pub(crate) fn prepare_write_impl(
    conn: &Connection,
    name: &str,
    policy: OverwritePolicy,
) -> StoreResult<()> {
    in_immediate_txn_impl(conn, |conn| {
        if let Some(existing) = case_variant_impl(conn, name)? {
            return Err(StoreError::KeyCollision {
                key: name.to_string(),
                existing,
            });
        }

        let has_table = table_exists_impl(conn, name)?;
        let meta_rows = count_metadata_rows_impl(conn, name)?;
        let pending = is_pending_impl(conn, name)?;

        if has_table && meta_rows > 0 && !pending {
            match policy {
                OverwritePolicy::Reject => {
                    return Err(StoreError::AlreadyCached {
                        key: name.to_string(),
                    });
                }
                OverwritePolicy::Replace => {
                    debug!(key = name, "replacing cached entry");
                }
            }
        } else if has_table || meta_rows > 0 {
            warn!(
                key = name,
                has_table,
                meta_rows,
                pending,
                "removing leftovers of an uncommitted write"
            );
        }

        if has_table {
            drop_data_table_impl(conn, name)?;
        }
        if meta_rows > 0 {
            conn.execute("DELETE FROM metadata WHERE name = ?1", [name])?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO pending_writes (name, started_at) VALUES (?1, ?2)",
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
}

/// Publish the metadata record for `name`: the single commit point.
pub(crate) fn commit_metadata_impl(
    conn: &Connection,
    name: &str,
    json: &str,
    schema: Option<&Schema>,
) -> StoreResult<()> {
    in_immediate_txn_impl(conn, |conn| {
        create_data_table_impl(conn, name, schema)?;

        if count_metadata_rows_impl(conn, name)? > 0 {
            return Err(StoreError::AlreadyCached {
                key: name.to_string(),
            });
        }

        conn.execute(
            "INSERT INTO metadata (name, metadata) VALUES (?1, ?2)",
            params![name, json],
        )?;
        conn.execute("DELETE FROM pending_writes WHERE name = ?1", [name])?;
        Ok(())
    })
}
