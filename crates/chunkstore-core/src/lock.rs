//! Process-wide writer locks: at most one open saver per (store, key).
//!
//! Locks are in-process only. Two processes writing the same key through
//! the same database or document root are not coordinated. Keys are
//! compared without ASCII case, the way SQLite resolves table names.

use std::collections::HashSet;
use std::sync::Mutex;

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;

lazy_static! {
    static ref ACTIVE_WRITERS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Lock namespace of one physical store (database path, document root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterLock {
    scope: String,
}

impl WriterLock {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn slot(&self, key: &CacheKey) -> String {
        format!("{}::{}", self.scope, key.to_string().to_ascii_lowercase())
    }

    /// Take the writer lock for `key`, failing with `WriterBusy` if held.
    pub fn acquire(&self, key: &CacheKey) -> StoreResult<WriterGuard> {
        let slot = self.slot(key);
        let mut active = ACTIVE_WRITERS.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(slot.clone()) {
            return Err(StoreError::WriterBusy {
                key: key.to_string(),
            });
        }
        debug!(key = %key, scope = %self.scope, "writer lock acquired");
        Ok(WriterGuard { slot })
    }

    pub fn is_locked(&self, key: &CacheKey) -> bool {
        let slot = self.slot(key);
        ACTIVE_WRITERS
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&slot)
    }
}

/// Releases the writer lock on drop.
#[derive(Debug)]
pub struct WriterGuard {
    slot: String,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_WRITERS.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.slot);
    }
}
