//! SQLite backend: one table per key plus a shared `metadata` table.
//!
//! Every data table carries two extra columns, `chunk_i` (indexed, for
//! point reads) and `row_i` (row order inside a chunk). A key is cached
//! once its `metadata` row is committed and no pending marker remains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::debug;

use crate::chunk::{Chunk, RecordBatch, Schema};
use crate::config::{OverwritePolicy, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::lock::WriterLock;
use crate::metadata::{ChunkInfo, Compressor, Metadata};
use crate::store::{CachedEntry, ChunkReader, Saver, SaverState, Store, WriteSession};

mod ident;
mod meta;
mod rows;
pub mod schema;

pub use schema::CACHE_SCHEMA;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Distinguishes writer-lock scopes of in-memory databases.
static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(0);

fn lock_conn(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
}

/// SQLite-backed chunk store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Set for file-backed stores; savers open their own connection to it.
    path: Option<PathBuf>,
    busy_timeout: Duration,
    overwrite: OverwritePolicy,
    lock: WriterLock,
}

impl SqliteStore {
    /// Open a file-backed store, creating the shared tables if absent.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    fn open_with_timeout(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        schema::init_connection_impl(&conn, busy_timeout)?;
        let scope = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        debug!(path = %path.display(), "opened sqlite chunk store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            busy_timeout,
            overwrite: OverwritePolicy::default(),
            lock: WriterLock::new(format!("sqlite:{}", scope)),
        })
    }

    /// Create an in-memory store (for testing). Savers share its connection.
    pub fn memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Create a store from an existing connection. Savers share it.
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        schema::init_connection_impl(&conn, DEFAULT_BUSY_TIMEOUT)?;
        let id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            overwrite: OverwritePolicy::default(),
            lock: WriterLock::new(format!("sqlite-conn:{}", id)),
        })
    }

    pub fn from_config(cfg: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::open_with_timeout(&cfg.sqlite_path, cfg.busy_timeout())?
            .with_overwrite_policy(cfg.overwrite))
    }

    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn overwrite_policy(&self) -> OverwritePolicy {
        self.overwrite
    }

    /// Direct access to the store connection (maintenance and tests).
    pub fn connection(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        lock_conn(&self.conn)
    }

    /// All tables in the database, shared tables included.
    pub fn tables(&self) -> StoreResult<Vec<String>> {
        let conn = lock_conn(&self.conn)?;
        schema::list_tables_impl(&conn)
    }

    fn saver_connection(&self) -> StoreResult<Arc<Mutex<Connection>>> {
        match &self.path {
            Some(path) => {
                let conn = Connection::open(path)?;
                schema::init_connection_impl(&conn, self.busy_timeout)?;
                Ok(Arc::new(Mutex::new(conn)))
            }
            None => Ok(Arc::clone(&self.conn)),
        }
    }
}

impl Store for SqliteStore {
    fn find(&self, key: &CacheKey) -> StoreResult<CachedEntry> {
        let table = key.to_string();
        let conn = lock_conn(&self.conn)?;

        if !schema::table_exists_impl(&conn, &table)? {
            debug!(key = %key, "not in cache");
            return Err(StoreError::NotCached { key: table });
        }
        if meta::is_pending_impl(&conn, &table)? {
            debug!(key = %key, "write in progress or abandoned; not in cache");
            return Err(StoreError::NotCached { key: table });
        }

        let metadata = meta::read_metadata_impl(&conn, &table)?;
        debug!(key = %key, chunks = metadata.chunks.len(), "cache hit");
        Ok(CachedEntry {
            key: key.clone(),
            location: table,
            metadata,
        })
    }

    fn read_metadata(&self, key: &CacheKey) -> StoreResult<Metadata> {
        let conn = lock_conn(&self.conn)?;
        meta::read_metadata_impl(&conn, &key.to_string())
    }

    fn read_chunk(
        &self,
        entry: &CachedEntry,
        info: &ChunkInfo,
        dtype: &Schema,
    ) -> StoreResult<RecordBatch> {
        // Rows are stored as native columns; the compressor tag is informational.
        let batch = {
            let conn = lock_conn(&self.conn)?;
            rows::read_chunk_rows_impl(&conn, &entry.location, info.chunk_i, dtype)?
        };
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
        let conn = self.saver_connection()?;
        let table = key.to_string();
        {
            let c = lock_conn(&conn)?;
            meta::prepare_write_impl(&c, &table, self.overwrite)?;
        }
        debug!(key = %key, "saver opened");
        Ok(Box::new(SqliteSaver {
            conn,
            table,
            session: WriteSession::new(key.clone(), seed, guard),
        }))
    }

    fn list_keys(&self) -> StoreResult<Vec<CacheKey>> {
        let names = {
            let conn = lock_conn(&self.conn)?;
            meta::list_metadata_names_impl(&conn)?
        };
        let mut keys: Vec<CacheKey> = names.iter().filter_map(|n| n.parse().ok()).collect();
        keys.sort();
        Ok(keys)
    }

    fn chunks<'a>(&'a self, entry: &'a CachedEntry) -> ChunkReader<'a> {
        ChunkReader::new(self, entry)
    }
}

/// Saver for one key of a [`SqliteStore`].
pub struct SqliteSaver {
    conn: Arc<Mutex<Connection>>,
    table: String,
    session: WriteSession,
}

impl Saver for SqliteSaver {
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

        let written = lock_conn(&self.conn).and_then(|conn| {
            schema::in_immediate_txn_impl(&conn, |c| {
                rows::insert_chunk_rows_impl(c, &self.table, &chunk)
            })
        });

        match written {
            Ok(_) => {
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
        let schema = self.session.metadata().dtype.clone();

        let committed = lock_conn(&self.conn).and_then(|conn| {
            meta::commit_metadata_impl(&conn, &self.table, &json, schema.as_ref())
        });

        match committed {
            Ok(()) => Ok(self.session.finish_close()),
            Err(e) => {
                self.session.fail();
                Err(e)
            }
        }
    }
}
