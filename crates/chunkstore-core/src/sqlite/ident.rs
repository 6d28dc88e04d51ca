//! Identifier quoting and column type mapping.
//!
//! Keys and field names are validated at construction. Quoting still doubles
//! any embedded `"` and refuses NUL.

use crate::chunk::DType;
use crate::error::{StoreError, StoreResult};

pub(crate) fn quote_ident_impl(name: &str) -> StoreResult<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(StoreError::Database(format!(
            "refusing to quote identifier {:?}",
            name
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Index name for a data table. `#` never occurs in a key, so the name
/// cannot coincide with another key's table.
pub(crate) fn index_name_impl(table: &str) -> String {
    format!("{}#chunk_i", table)
}

pub(crate) fn sql_type_impl(dtype: DType) -> &'static str {
    match dtype {
        DType::Int64 | DType::Bool => "INTEGER",
        DType::Float64 => "REAL",
        DType::Text => "TEXT",
        DType::Bytes => "BLOB",
    }
}
