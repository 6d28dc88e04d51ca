//! Chunked result cache for tabular processing runs.
//!
//! Results are stored under a [`CacheKey`] (`run_id`, `data_type`,
//! `lineage_hash`) as an ordered sequence of fixed-schema chunks plus one
//! metadata record. The record is written last and is the commit point:
//! until it exists, the key reads as not cached.
//!
//! Two backends implement the same [`Store`] / [`Saver`] contract:
//!
//! - [`SqliteStore`]: one table per key and a shared `metadata` table
//! - [`DocumentStore`]: one directory per key with JSON chunk documents
//!
//! # Quick Start
//!
//! ```no_run
//! use chunkstore_core::{CacheKey, Chunk, RecordBatch, Schema, Field, DType, Value};
//! use chunkstore_core::{SqliteStore, Store};
//!
//! # fn example() -> anyhow::Result<()> {
//! let store = SqliteStore::open(std::path::Path::new("chunkstore.db"))?;
//! let key = CacheKey::new("run001", "raw", "cfgHashABC")?;
//!
//! match store.find(&key) {
//!     Ok(entry) => {
//!         for chunk in store.chunks(&entry) {
//!             println!("chunk {} has {} rows", chunk?.chunk_i, entry.metadata.total_rows());
//!         }
//!     }
//!     Err(e) if e.is_not_cached() => {
//!         let schema = Schema::new(vec![Field::new("time", DType::Int64)])?;
//!         let batch = RecordBatch::new(schema, vec![vec![Value::Int(1)]])?;
//!         let mut saver = store.saver(&key, serde_json::Map::new())?;
//!         saver.write_chunk(Chunk::new(0, batch), None)?;
//!         saver.close()?;
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `CHUNKSTORE_BACKEND` | `sqlite` or `document` (default: `sqlite`) |
//! | `CHUNKSTORE_SQLITE_PATH` | SQLite database file (default: `chunkstore.db`) |
//! | `CHUNKSTORE_DOCUMENT_ROOT` | Document backend root (default: `chunkstore-docs`) |
//! | `CHUNKSTORE_BUSY_TIMEOUT_MS` | SQLite busy timeout (default: 5000) |
//! | `CHUNKSTORE_OVERWRITE` | `reject` or `replace` (default: `reject`) |

pub mod chunk;
pub mod config;
pub mod document;
pub mod error;
pub mod key;
pub mod lock;
pub mod metadata;
pub mod sqlite;
pub mod store;

// Re-export main types
pub use chunk::{Chunk, DType, Field, RecordBatch, Schema, Value};
pub use config::{BackendKind, OverwritePolicy, StoreConfig};
pub use document::{DocumentSaver, DocumentStore};
pub use error::{ErrorClass, StoreError, StoreResult};
pub use key::{lineage_hash, CacheKey};
pub use lock::{WriterGuard, WriterLock};
pub use metadata::{ChunkInfo, Compressor, Metadata};
pub use sqlite::{SqliteSaver, SqliteStore};
pub use store::{CachedEntry, ChunkReader, Saver, SaverState, Store, WriteSession};
