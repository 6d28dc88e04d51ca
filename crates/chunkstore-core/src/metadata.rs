//! Dataset metadata record.
//!
//! Serialized as one flat JSON object:
//!
//! ```text
//! {
//!   "chunks": [{"chunk_i": 0, "n": 5, "nbytes": 120}, ...],
//!   "dtype": [{"name": "time", "dtype": "int64"}, ...],
//!   "writing_started": "...",
//!   "writing_ended": "...",
//!   ...caller fields
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::Schema;

/// Keys owned by the record itself; removed from a caller seed.
pub const RESERVED_KEYS: &[&str] = &["chunks", "dtype", "writing_started", "writing_ended"];

/// Compression applied to a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    Gzip,
}

impl Compressor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compressor::Gzip => "gzip",
        }
    }
}

/// Descriptor of one persisted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_i: u64,
    /// Row count.
    pub n: u64,
    pub nbytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressor: Option<Compressor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub chunks: Vec<ChunkInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<Schema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writing_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writing_ended: Option<DateTime<Utc>>,

    /// Free-form dataset fields supplied by the caller.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Metadata {
    /// Start a record from caller-supplied fields with an empty chunk list.
    ///
    /// Reserved keys are taken out of the seed; a seed `dtype` that parses as
    /// a [`Schema`] is adopted, anything else under a reserved key is dropped.
    pub fn from_seed(mut seed: Map<String, Value>) -> Self {
        let dtype = seed
            .remove("dtype")
            .and_then(|v| serde_json::from_value::<Schema>(v).ok());
        for key in RESERVED_KEYS {
            seed.remove(*key);
        }
        Self {
            chunks: Vec::new(),
            dtype,
            writing_started: None,
            writing_ended: None,
            fields: seed,
        }
    }

    /// Parse a committed record and check its invariants.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))?;
        if !value.is_object() {
            return Err("metadata is not a JSON object".to_string());
        }
        let md: Metadata =
            serde_json::from_value(value).map_err(|e| format!("unexpected shape: {}", e))?;
        md.validate()?;
        Ok(md)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Chunk descriptors must be exactly `0, 1, .., n-1` in order, and a
    /// record with chunks must carry their schema.
    pub fn validate(&self) -> Result<(), String> {
        if !self.chunks.is_empty() && self.dtype.is_none() {
            return Err("chunks recorded without a dtype".to_string());
        }
        for (pos, info) in self.chunks.iter().enumerate() {
            if info.chunk_i != pos as u64 {
                return Err(format!(
                    "chunk descriptor {} has chunk_i {} (expected {})",
                    pos, info.chunk_i, pos
                ));
            }
        }
        Ok(())
    }

    pub fn chunk(&self, chunk_i: u64) -> Option<&ChunkInfo> {
        self.chunks.get(usize::try_from(chunk_i).ok()?)
    }

    pub fn total_rows(&self) -> u64 {
        self.chunks.iter().map(|c| c.n).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.nbytes).sum()
    }
}
