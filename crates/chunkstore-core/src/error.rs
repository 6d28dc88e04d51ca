//! Error types for the chunk cache.

/// Coarse classification of a [`StoreError`].
///
/// Callers usually only need to tell a miss (compute and save) from a
/// corrupted entry (abort the run for this key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing stored under the key.
    Miss,
    /// Storage exists for the key but its metadata invariant is broken.
    Corruption,
    /// The caller violated the store/saver contract.
    Contract,
    /// Driver, filesystem or serialization failure.
    Backend,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Miss => "miss",
            ErrorClass::Corruption => "corruption",
            ErrorClass::Contract => "contract",
            ErrorClass::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chunk cache errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No storage location exists for the key (or a write is still in flight).
    #[error("not cached: {key}")]
    NotCached { key: String },

    /// Data exists but no metadata record was committed for it.
    #[error("metadata missing for {key}")]
    MetadataMissing { key: String },

    /// More than one metadata record exists for the key.
    #[error("repeated metadata for {key}: {count} records")]
    RepeatedMetadata { key: String, count: usize },

    /// The metadata record exists but cannot be parsed or violates ordering.
    #[error("misformatted metadata for {key}: {reason}")]
    MisformattedMetadata { key: String, reason: String },

    #[error("invalid cache key component {component}={value:?}: {reason}")]
    InvalidKey {
        component: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    #[error("schema mismatch for {key}: {reason}")]
    SchemaMismatch { key: String, reason: String },

    /// `chunk_i` was already written for this key.
    #[error("duplicate chunk {chunk_i} for {key}")]
    DuplicateChunk { key: String, chunk_i: u64 },

    /// `chunk_i` skips ahead of the next expected index.
    #[error("chunk out of order for {key}: expected {expected}, got {got}")]
    ChunkOutOfOrder { key: String, expected: u64, got: u64 },

    #[error("saver for {key} is already closed")]
    SaverClosed { key: String },

    /// A previous write failed; the saver refuses to commit.
    #[error("saver for {key} failed earlier and cannot commit")]
    SaverFailed { key: String },

    #[error("already cached: {key}")]
    AlreadyCached { key: String },

    /// Another key's data already lives at the location this key maps to
    /// (backend names compare without ASCII case).
    #[error("cache key {key} collides with stored location {existing}")]
    KeyCollision { key: String, existing: String },

    /// Another saver holds the writer lock for this key.
    #[error("writer busy: {key}")]
    WriterBusy { key: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {message}")]
    Io { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotCached { .. } => ErrorClass::Miss,

            Self::MetadataMissing { .. }
            | Self::RepeatedMetadata { .. }
            | Self::MisformattedMetadata { .. } => ErrorClass::Corruption,

            Self::InvalidKey { .. }
            | Self::InvalidSchema { .. }
            | Self::SchemaMismatch { .. }
            | Self::DuplicateChunk { .. }
            | Self::ChunkOutOfOrder { .. }
            | Self::SaverClosed { .. }
            | Self::SaverFailed { .. }
            | Self::AlreadyCached { .. }
            | Self::KeyCollision { .. }
            | Self::WriterBusy { .. } => ErrorClass::Contract,

            Self::Database(_) | Self::Io { .. } | Self::Serialization { .. } | Self::Config { .. } => {
                ErrorClass::Backend
            }
        }
    }

    /// True for the expected, recoverable miss.
    pub fn is_not_cached(&self) -> bool {
        matches!(self, Self::NotCached { .. })
    }

    /// True when the stored entry is unreadable. Never treat this as a miss.
    pub fn is_corruption(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }

    pub(crate) fn misformatted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MisformattedMetadata {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: e.to_string(),
        }
    }
}

/// Result type for chunk cache operations.
pub type StoreResult<T> = Result<T, StoreError>;
