//! Document backend: one directory per key under a root directory.
//!
//! ```text
//! <root>/<run_id>-<data_type>-<lineage_hash>/
//! ├── .pending               # present while a write is open or abandoned
//! ├── chunk_000000.json      # or chunk_000000.json.gz when gzip-compressed
//! ├── chunk_000001.json
//! └── metadata.json          # the commit point
//! ```
//!
//! Every file is written to a temp file and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::chunk::{Chunk, RecordBatch, Schema};
use crate::config::{OverwritePolicy, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::lock::WriterLock;
use crate::metadata::{ChunkInfo, Compressor, Metadata};
use crate::store::{CachedEntry, ChunkReader, Saver, SaverState, Store, WriteSession};

mod io;

use io::{METADATA_FILE, PENDING_FILE};

/// Filesystem document store.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
    overwrite: OverwritePolicy,
    lock: WriterLock,
}

impl DocumentStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::Io {
            message: format!("failed to create store root {}: {}", root.display(), e),
        })?;
        let scope = root.canonicalize()?.display().to_string();
        debug!(root = %root.display(), "opened document chunk store");
        Ok(Self {
            root,
            overwrite: OverwritePolicy::default(),
            lock: WriterLock::new(format!("document:{}", scope)),
        })
    }

    pub fn from_config(cfg: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::open(&cfg.document_root)?.with_overwrite_policy(cfg.overwrite))
    }

    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the documents of `key`.
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    fn read_metadata_at(dir: &Path, key: &CacheKey) -> StoreResult<Metadata> {
        let path = dir.join(METADATA_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MetadataMissing {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| StoreError::misformatted(key.to_string(), "metadata is not UTF-8"))?;
        Metadata::from_json(&text).map_err(|reason| StoreError::misformatted(key.to_string(), reason))
    }

    fn prepare_write(&self, key: &CacheKey, dir: &Path) -> StoreResult<()> {
        if dir.exists() {
            let pending = dir.join(PENDING_FILE).exists();
            let committed = dir.join(METADATA_FILE).exists();
            if committed && !pending {
                match self.overwrite {
                    OverwritePolicy::Reject => {
                        return Err(StoreError::AlreadyCached {
                            key: key.to_string(),
                        })
                    }
                    OverwritePolicy::Replace => debug!(key = %key, "replacing cached entry"),
                }
            } else {
                warn!(key = %key, pending, "removing leftovers of an uncommitted write");
            }
            io::remove_dir_impl(dir)?;
        }

        fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            message: format!("failed to create {}: {}", dir.display(), e),
        })?;
        io::write_atomic_impl(
            &dir.join(PENDING_FILE),
            chrono::Utc::now().to_rfc3339().as_bytes(),
        )
    }
}

impl Store for DocumentStore {
    fn find(&self, key: &CacheKey) -> StoreResult<CachedEntry> {
        let dir = self.entry_dir(key);
        if !io::scan_entry_impl(&self.root, &key.to_string())?.exact {
            debug!(key = %key, "not in cache");
            return Err(StoreError::NotCached {
                key: key.to_string(),
            });
        }
        if dir.join(PENDING_FILE).exists() {
            debug!(key = %key, "write in progress or abandoned; not in cache");
            return Err(StoreError::NotCached {
                key: key.to_string(),
            });
        }

        let metadata = Self::read_metadata_at(&dir, key)?;
        debug!(key = %key, chunks = metadata.chunks.len(), "cache hit");
        Ok(CachedEntry {
            key: key.clone(),
            location: dir.display().to_string(),
            metadata,
        })
    }

    fn read_metadata(&self, key: &CacheKey) -> StoreResult<Metadata> {
        Self::read_metadata_at(&self.entry_dir(key), key)
    }

    fn read_chunk(
        &self,
        entry: &CachedEntry,
        info: &ChunkInfo,
        dtype: &Schema,
    ) -> StoreResult<RecordBatch> {
        let path = io::chunk_path_impl(&self.entry_dir(&entry.key), info.chunk_i, info.compressor);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::misformatted(
                    entry.key.to_string(),
                    format!("chunk {} is recorded but its document is missing", info.chunk_i),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let batch = io::decode_chunk_impl(&bytes, info.compressor).map_err(|e| {
            StoreError::SchemaMismatch {
                key: entry.key.to_string(),
                reason: format!("chunk {}: {}", info.chunk_i, e),
            }
        })?;
        if batch.schema() != dtype {
            return Err(StoreError::SchemaMismatch {
                key: entry.key.to_string(),
                reason: format!("chunk {} schema differs from the recorded dtype", info.chunk_i),
            });
        }
        if batch.num_rows() as u64 != info.n {
            return Err(StoreError::misformatted(
                entry.key.to_string(),
                format!(
                    "chunk {} has {} rows, metadata records {}",
                    info.chunk_i,
                    batch.num_rows(),
                    info.n
                ),
            ));
        }
        Ok(batch)
    }

    fn saver(&self, key: &CacheKey, seed: Map<String, Value>) -> StoreResult<Box<dyn Saver>> {
        let guard = self.lock.acquire(key)?;
        if let Some(existing) = io::scan_entry_impl(&self.root, &key.to_string())?.variant {
            return Err(StoreError::KeyCollision {
                key: key.to_string(),
                existing,
            });
        }
        let dir = self.entry_dir(key);
        self.prepare_write(key, &dir)?;
        debug!(key = %key, "saver opened");
        Ok(Box::new(DocumentSaver {
            dir,
            session: WriteSession::new(key.clone(), seed, guard),
        }))
    }

    fn list_keys(&self) -> StoreResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() || dir.join(PENDING_FILE).exists() || !dir.join(METADATA_FILE).exists()
            {
                continue;
            }
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<CacheKey>().ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn chunks<'a>(&'a self, entry: &'a CachedEntry) -> ChunkReader<'a> {
        ChunkReader::new(self, entry)
    }
}

/// Saver for one key of a [`DocumentStore`].
pub struct DocumentSaver {
    dir: PathBuf,
    session: WriteSession,
}

impl Saver for DocumentSaver {
    fn key(&self) -> &CacheKey {
        self.session.key()
    }

    fn metadata(&self) -> &Metadata {
        self.session.metadata()
    }

    fn state(&self) -> SaverState {
        self.session.state()
    }

    fn write_chunk(&mut self, chunk: Chunk, compressor: Option<Compressor>) -> StoreResult<()> {
        self.session.check_chunk(&chunk)?;

        let path = io::chunk_path_impl(&self.dir, chunk.chunk_i, compressor);
        let written = io::encode_chunk_impl(&chunk.batch, compressor)
            .and_then(|bytes| io::write_atomic_impl(&path, &bytes));

        match written {
            Ok(()) => {
                self.session.record_chunk(&chunk, compressor);
                Ok(())
            }
            Err(e) => {
                self.session.fail();
                Err(e)
            }
        }
    }

    fn close(&mut self) -> StoreResult<Metadata> {
        let json = self.session.begin_close()?.to_json()?;
        let metadata_path = self.dir.join(METADATA_FILE);

        let committed = if metadata_path.exists() {
            Err(StoreError::AlreadyCached {
                key: self.session.key().to_string(),
            })
        } else {
            io::write_atomic_impl(&metadata_path, json.as_bytes())
                .and_then(|()| fs::remove_file(self.dir.join(PENDING_FILE)).map_err(Into::into))
        };

        match committed {
            Ok(()) => Ok(self.session.finish_close()),
            Err(e) => {
                self.session.fail();
                Err(e)
            }
        }
    }
}
