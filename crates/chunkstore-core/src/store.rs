//! Store / Saver contract shared by every backend.
//!
//! A [`Store`] answers "is this key cached?" and mints [`Saver`]s. A saver
//! owns one in-progress write: chunks go in with strictly increasing
//! `chunk_i`, and `close` publishes the metadata record in a single atomic
//! step. Until that step, `find` reports [`StoreError::NotCached`] for the key.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::chunk::{Chunk, RecordBatch, Schema};
use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::lock::WriterGuard;
use crate::metadata::{ChunkInfo, Compressor, Metadata};

/// Read handle for a cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub key: CacheKey,
    /// Backend location (table name, document directory).
    pub location: String,
    pub metadata: Metadata,
}

pub trait Store: Send + Sync {
    /// Look up `key`.
    ///
    /// Missing storage (or a write still in progress) is `NotCached`. Storage
    /// with a broken metadata record is a corruption error, never a miss.
    fn find(&self, key: &CacheKey) -> StoreResult<CachedEntry>;

    fn read_metadata(&self, key: &CacheKey) -> StoreResult<Metadata>;

    /// Random-access read of one chunk of a cached entry.
    fn read_chunk(
        &self,
        entry: &CachedEntry,
        info: &ChunkInfo,
        dtype: &Schema,
    ) -> StoreResult<RecordBatch>;

    /// Start a new write for `key`, seeding the metadata with `seed`.
    fn saver(&self, key: &CacheKey, seed: Map<String, Value>) -> StoreResult<Box<dyn Saver>>;

    /// Keys with a committed metadata record, sorted.
    fn list_keys(&self) -> StoreResult<Vec<CacheKey>>;

    /// All chunks of `entry` in descriptor order.
    fn chunks<'a>(&'a self, entry: &'a CachedEntry) -> ChunkReader<'a>;
}

/// Saver lifecycle. `Failed` is entered when a backend write or the commit
/// fails; a failed saver never commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaverState {
    Open,
    Closed,
    Failed,
}

pub trait Saver: Send {
    fn key(&self) -> &CacheKey;

    /// In-memory record accumulated so far.
    fn metadata(&self) -> &Metadata;

    fn state(&self) -> SaverState;

    /// Persist one chunk. `chunk.chunk_i` must equal the number of chunks
    /// written so far.
    fn write_chunk(&mut self, chunk: Chunk, compressor: Option<Compressor>) -> StoreResult<()>;

    /// Commit the metadata record and return it. Valid once.
    fn close(&mut self) -> StoreResult<Metadata>;
}

/// Iterator over the chunks of a cached entry.
pub struct ChunkReader<'a> {
    store: &'a dyn Store,
    entry: &'a CachedEntry,
    next: usize,
    done: bool,
}

impl<'a> ChunkReader<'a> {
    pub fn new(store: &'a dyn Store, entry: &'a CachedEntry) -> Self {
        Self {
            store,
            entry,
            next: 0,
            done: false,
        }
    }
}

impl Iterator for ChunkReader<'_> {
    type Item = StoreResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let info = self.entry.metadata.chunks.get(self.next)?;
        self.next += 1;

        let Some(dtype) = self.entry.metadata.dtype.as_ref() else {
            self.done = true;
            return Some(Err(StoreError::misformatted(
                self.entry.key.to_string(),
                "chunks recorded without a dtype",
            )));
        };

        let result = self
            .store
            .read_chunk(self.entry, info, dtype)
            .map(|batch| Chunk {
                chunk_i: info.chunk_i,
                batch,
                start: info.start,
                end: info.end,
            });
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Backend-independent bookkeeping for one saver: state machine, chunk
/// ordering, schema consistency and the in-memory metadata record.
#[derive(Debug)]
pub struct WriteSession {
    key: CacheKey,
    metadata: Metadata,
    state: SaverState,
    _guard: WriterGuard,
}

impl WriteSession {
    pub fn new(key: CacheKey, seed: Map<String, Value>, guard: WriterGuard) -> Self {
        let mut metadata = Metadata::from_seed(seed);
        metadata.writing_started = Some(chrono::Utc::now());
        Self {
            key,
            metadata,
            state: SaverState::Open,
            _guard: guard,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn state(&self) -> SaverState {
        self.state
    }

    fn ensure_open(&self) -> StoreResult<()> {
        match self.state {
            SaverState::Open => Ok(()),
            SaverState::Closed => Err(StoreError::SaverClosed {
                key: self.key.to_string(),
            }),
            SaverState::Failed => Err(StoreError::SaverFailed {
                key: self.key.to_string(),
            }),
        }
    }

    /// Reject a chunk before anything is persisted.
    pub fn check_chunk(&self, chunk: &Chunk) -> StoreResult<()> {
        self.ensure_open()?;

        let expected = self.metadata.chunks.len() as u64;
        if chunk.chunk_i < expected {
            return Err(StoreError::DuplicateChunk {
                key: self.key.to_string(),
                chunk_i: chunk.chunk_i,
            });
        }
        if chunk.chunk_i > expected {
            return Err(StoreError::ChunkOutOfOrder {
                key: self.key.to_string(),
                expected,
                got: chunk.chunk_i,
            });
        }

        if let Some(dtype) = &self.metadata.dtype {
            if chunk.batch.schema() != dtype {
                return Err(StoreError::SchemaMismatch {
                    key: self.key.to_string(),
                    reason: format!(
                        "chunk {} schema differs from the schema of this key",
                        chunk.chunk_i
                    ),
                });
            }
        }
        chunk.batch.validate()
    }

    /// Append the descriptor of a chunk that was persisted successfully.
    pub fn record_chunk(&mut self, chunk: &Chunk, compressor: Option<Compressor>) -> &ChunkInfo {
        if self.metadata.dtype.is_none() {
            self.metadata.dtype = Some(chunk.batch.schema().clone());
        }
        self.metadata.chunks.push(ChunkInfo {
            chunk_i: chunk.chunk_i,
            n: chunk.batch.num_rows() as u64,
            nbytes: chunk.batch.nbytes(),
            compressor,
            start: chunk.start,
            end: chunk.end,
        });
        debug!(
            key = %self.key,
            chunk_i = chunk.chunk_i,
            rows = chunk.batch.num_rows(),
            "chunk saved"
        );
        let last = self.metadata.chunks.len() - 1;
        &self.metadata.chunks[last]
    }

    pub fn fail(&mut self) {
        self.state = SaverState::Failed;
    }

    /// Check that a commit may start and stamp the end time.
    pub fn begin_close(&mut self) -> StoreResult<&Metadata> {
        self.ensure_open()?;
        self.metadata.writing_ended = Some(chrono::Utc::now());
        Ok(&self.metadata)
    }

    pub fn finish_close(&mut self) -> Metadata {
        self.state = SaverState::Closed;
        debug!(key = %self.key, chunks = self.metadata.chunks.len(), "metadata committed");
        self.metadata.clone()
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.state == SaverState::Open {
            warn!(
                key = %self.key,
                chunks = self.metadata.chunks.len(),
                "saver dropped without close; entry left uncommitted"
            );
        }
    }
}
