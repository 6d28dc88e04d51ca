//! Chunk rows: table creation, insert and point reads by `chunk_i`.

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::Connection;

use super::ident::{index_name_impl, quote_ident_impl, sql_type_impl};
use super::schema::stored_table_name_impl;
use crate::chunk::{Chunk, DType, RecordBatch, Schema, Value};
use crate::error::{StoreError, StoreResult};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*v))),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn value_from_sql_impl(v: ValueRef<'_>, dtype: DType) -> Result<Value, String> {
    match (v, dtype) {
        (ValueRef::Null, _) => Ok(Value::Null),
        (ValueRef::Integer(i), DType::Int64) => Ok(Value::Int(i)),
        (ValueRef::Integer(i), DType::Bool) => Ok(Value::Bool(i != 0)),
        (ValueRef::Real(f), DType::Float64) => Ok(Value::Float(f)),
        (ValueRef::Integer(i), DType::Float64) => Ok(Value::Float(i as f64)),
        (ValueRef::Text(b), DType::Text) => String::from_utf8(b.to_vec())
            .map(Value::Text)
            .map_err(|e| format!("invalid UTF-8 text: {}", e)),
        (ValueRef::Blob(b), DType::Bytes) => Ok(Value::Bytes(b.to_vec())),
        (other, dtype) => Err(format!(
            "stored {:?} cannot be read as {}",
            other.data_type(),
            dtype.as_str()
        )),
    }
}

/// Create the data table for a key if it does not exist yet.
///
/// Without a schema only the reserved columns are created (an entry with
/// zero chunks still needs its table to be findable). A table whose name
/// differs from `table` only in case belongs to another key and is refused.
pub(crate) fn create_data_table_impl(
    conn: &Connection,
    table: &str,
    schema: Option<&Schema>,
) -> StoreResult<()> {
    if let Some(stored) = stored_table_name_impl(conn, table)? {
        if stored != table {
            return Err(StoreError::KeyCollision {
                key: table.to_string(),
                existing: stored,
            });
        }
    }

    let mut columns = vec![
        "chunk_i INTEGER NOT NULL".to_string(),
        "row_i INTEGER NOT NULL".to_string(),
    ];
    if let Some(schema) = schema {
        for field in schema.fields() {
            columns.push(format!(
                "{} {}",
                quote_ident_impl(&field.name)?,
                sql_type_impl(field.dtype)
            ));
        }
    }

    let quoted = quote_ident_impl(table)?;
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {} ({})", quoted, columns.join(", ")),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(chunk_i)",
            quote_ident_impl(&index_name_impl(table))?,
            quoted
        ),
        [],
    )?;
    Ok(())
}

pub(crate) fn drop_data_table_impl(conn: &Connection, table: &str) -> StoreResult<()> {
    conn.execute(
        &format!("DROP TABLE IF EXISTS {}", quote_ident_impl(table)?),
        [],
    )?;
    Ok(())
}

/// Insert every row of `chunk`, stamped with `chunk_i` and its position.
///
/// Caller owns the transaction.
pub(crate) fn insert_chunk_rows_impl(
    conn: &Connection,
    table: &str,
    chunk: &Chunk,
) -> StoreResult<usize> {
    let schema = chunk.batch.schema();
    create_data_table_impl(conn, table, Some(schema))?;

    let mut names = vec!["chunk_i".to_string(), "row_i".to_string()];
    for field in schema.fields() {
        names.push(quote_ident_impl(&field.name)?);
    }
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident_impl(table)?,
        names.join(", "),
        placeholders.join(", ")
    );

    let chunk_i = i64::try_from(chunk.chunk_i)
        .map_err(|_| StoreError::Database(format!("chunk_i {} out of range", chunk.chunk_i)))?;

    let mut stmt = conn.prepare(&sql)?;
    for (row_i, row) in chunk.batch.rows().iter().enumerate() {
        let row_i = row_i as i64;
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(row.len() + 2);
        params.push(&chunk_i);
        params.push(&row_i);
        params.extend(row.iter().map(|v| v as &dyn ToSql));
        stmt.execute(rusqlite::params_from_iter(params))?;
    }
    Ok(chunk.batch.num_rows())
}

/// Select the rows of one chunk, in write order, decoded with `dtype`.
pub(crate) fn read_chunk_rows_impl(
    conn: &Connection,
    table: &str,
    chunk_i: u64,
    dtype: &Schema,
) -> StoreResult<RecordBatch> {
    let mut select = vec!["row_i".to_string()];
    for field in dtype.fields() {
        select.push(quote_ident_impl(&field.name)?);
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE chunk_i = ?1 ORDER BY row_i ASC",
        select.join(", "),
        quote_ident_impl(table)?
    );
    let chunk_i = i64::try_from(chunk_i)
        .map_err(|_| StoreError::Database(format!("chunk_i {} out of range", chunk_i)))?;

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([chunk_i])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(dtype.len());
        for (i, field) in dtype.fields().iter().enumerate() {
            let value = value_from_sql_impl(row.get_ref(i + 1)?, field.dtype).map_err(|reason| {
                StoreError::SchemaMismatch {
                    key: table.to_string(),
                    reason: format!("field {:?}: {}", field.name, reason),
                }
            })?;
            values.push(value);
        }
        out.push(values);
    }

    RecordBatch::new(dtype.clone(), out).map_err(|e| StoreError::SchemaMismatch {
        key: table.to_string(),
        reason: e.to_string(),
    })
}
