//! Store configuration.
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `CHUNKSTORE_BACKEND` | `sqlite` or `document` (default: `sqlite`) |
//! | `CHUNKSTORE_SQLITE_PATH` | SQLite database file (default: `chunkstore.db`) |
//! | `CHUNKSTORE_DOCUMENT_ROOT` | Root directory of the document backend (default: `chunkstore-docs`) |
//! | `CHUNKSTORE_BUSY_TIMEOUT_MS` | SQLite busy timeout in milliseconds (default: 5000) |
//! | `CHUNKSTORE_OVERWRITE` | `reject` or `replace` when saving over a cached key (default: `reject`) |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::document::DocumentStore;
use crate::error::{StoreError, StoreResult};
use crate::sqlite::SqliteStore;
use crate::store::Store;

/// What `saver()` does when the key is already cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Fail with `AlreadyCached`.
    #[default]
    Reject,
    /// Remove the cached entry, then write.
    Replace,
}

impl FromStr for OverwritePolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(StoreError::Config {
                message: format!("unknown overwrite policy: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Document,
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "document" => Ok(Self::Document),
            other => Err(StoreError::Config {
                message: format!("unknown backend: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Root directory of the document backend.
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub overwrite: OverwritePolicy,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("chunkstore.db")
}

fn default_document_root() -> PathBuf {
    PathBuf::from("chunkstore-docs")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sqlite_path: default_sqlite_path(),
            document_root: default_document_root(),
            busy_timeout_ms: default_busy_timeout_ms(),
            overwrite: OverwritePolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables. Unset or unparseable
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            backend: get("CHUNKSTORE_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            sqlite_path: get("CHUNKSTORE_SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_sqlite_path),
            document_root: get("CHUNKSTORE_DOCUMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_document_root),
            busy_timeout_ms: get("CHUNKSTORE_BUSY_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_busy_timeout_ms),
            overwrite: get("CHUNKSTORE_OVERWRITE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("parse store config")
    }

    /// Load a YAML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read store config {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = path.into();
        self
    }

    pub fn with_document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    /// Open the configured backend.
    pub fn open_store(&self) -> StoreResult<Box<dyn Store>> {
        let store: Box<dyn Store> = match self.backend {
            BackendKind::Sqlite => Box::new(SqliteStore::from_config(self)?),
            BackendKind::Document => Box::new(DocumentStore::from_config(self)?),
        };
        Ok(store)
    }
}
