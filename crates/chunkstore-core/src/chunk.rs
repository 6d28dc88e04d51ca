//! Fixed-schema record batches and the chunks that carry them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Column names the relational backend adds to every data table.
pub const RESERVED_COLUMNS: &[&str] = &["chunk_i", "row_i"];

/// Column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float64,
    Bool,
    Text,
    Bytes,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Int64 => "int64",
            DType::Float64 => "float64",
            DType::Bool => "bool",
            DType::Text => "text",
            DType::Bytes => "bytes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered column list shared by every chunk of one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Field>", into = "Vec<Field>")]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Build a schema, validating field names.
    ///
    /// Names must be non-empty ASCII identifiers (`[A-Za-z_][A-Za-z0-9_]*`),
    /// unique ignoring ASCII case, and must not shadow [`RESERVED_COLUMNS`].
    pub fn new(fields: Vec<Field>) -> StoreResult<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            validate_field_name(&field.name)?;
            if !seen.insert(field.name.to_ascii_lowercase()) {
                return Err(StoreError::InvalidSchema {
                    reason: format!("duplicate field {:?}", field.name),
                });
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TryFrom<Vec<Field>> for Schema {
    type Error = StoreError;

    fn try_from(fields: Vec<Field>) -> StoreResult<Self> {
        Self::new(fields)
    }
}

impl From<Schema> for Vec<Field> {
    fn from(s: Schema) -> Self {
        s.fields
    }
}

fn validate_field_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidSchema {
        reason: format!("field {:?}: {}", name, reason),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("empty name")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(invalid("must start with a letter or '_'"))
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("only [A-Za-z0-9_] allowed"));
    }
    if RESERVED_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(invalid("reserved column name"));
    }
    Ok(())
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this value may be stored in a column of `dtype`.
    pub fn fits(&self, dtype: DType) -> bool {
        matches!(
            (self, dtype),
            (Value::Null, _)
                | (Value::Int(_), DType::Int64)
                | (Value::Float(_), DType::Float64)
                | (Value::Bool(_), DType::Bool)
                | (Value::Text(_), DType::Text)
                | (Value::Bytes(_), DType::Bytes)
        )
    }

    fn nbytes(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Bool(_) => 1,
            Value::Text(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
        }
    }
}

/// Ordered rows of one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl RecordBatch {
    /// Build a batch, checking row arity and cell types against `schema`.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> StoreResult<Self> {
        let batch = Self { schema, rows };
        batch.validate()?;
        Ok(batch)
    }

    /// Check every row against the schema. Non-finite floats are refused:
    /// neither backend can store them faithfully.
    pub fn validate(&self) -> StoreResult<()> {
        for (row_i, row) in self.rows.iter().enumerate() {
            if row.len() != self.schema.len() {
                return Err(StoreError::InvalidSchema {
                    reason: format!(
                        "row {} has {} values, schema has {} fields",
                        row_i,
                        row.len(),
                        self.schema.len()
                    ),
                });
            }
            for (value, field) in row.iter().zip(self.schema.fields()) {
                if !value.fits(field.dtype) {
                    return Err(StoreError::InvalidSchema {
                        reason: format!(
                            "row {} field {:?}: {:?} is not {}",
                            row_i,
                            field.name,
                            value,
                            field.dtype.as_str()
                        ),
                    });
                }
                if let Value::Float(v) = value {
                    if !v.is_finite() {
                        return Err(StoreError::InvalidSchema {
                            reason: format!(
                                "row {} field {:?}: non-finite float {} cannot be stored",
                                row_i, field.name, v
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn into_parts(self) -> (Schema, Vec<Vec<Value>>) {
        (self.schema, self.rows)
    }

    /// Payload size in bytes, independent of the backend encoding.
    pub fn nbytes(&self) -> u64 {
        self.rows.iter().flatten().map(Value::nbytes).sum()
    }
}

/// One positioned batch handed to a saver.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_i: u64,
    pub batch: RecordBatch,
    /// Optional producer markers (e.g. first/last timestamp covered).
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl Chunk {
    pub fn new(chunk_i: u64, batch: RecordBatch) -> Self {
        Self {
            chunk_i,
            batch,
            start: None,
            end: None,
        }
    }

    pub fn with_bounds(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}
