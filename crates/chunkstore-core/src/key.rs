//! Cache key: the address of one cached dataset.
//!
//! The string form `{run_id}-{data_type}-{lineage_hash}` names the backend
//! location (SQLite table, document directory). Components are restricted to
//! `[A-Za-z0-9_.]` so that the string form is unambiguous and safe to use as
//! an identifier or a path segment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Separator between key components in the string form.
pub const KEY_SEPARATOR: char = '-';

/// Upper bound per component, keeps table names and paths reasonable.
pub const MAX_COMPONENT_LEN: usize = 64;

/// Hex chars of the config digest kept in a derived lineage hash.
const LINEAGE_HASH_LEN: usize = 16;

/// Identifier of one cached dataset: what was computed, for which run, under
/// which configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "KeyParts", into = "KeyParts")]
pub struct CacheKey {
    run_id: String,
    data_type: String,
    lineage_hash: String,
}

impl CacheKey {
    pub fn new(
        run_id: impl Into<String>,
        data_type: impl Into<String>,
        lineage_hash: impl Into<String>,
    ) -> StoreResult<Self> {
        let run_id = run_id.into();
        let data_type = data_type.into();
        let lineage_hash = lineage_hash.into();

        validate_component("run_id", &run_id)?;
        validate_component("data_type", &data_type)?;
        validate_component("lineage_hash", &lineage_hash)?;

        Ok(Self {
            run_id,
            data_type,
            lineage_hash,
        })
    }

    /// Derive the key for `data_type` produced under `config`.
    ///
    /// The lineage hash is a truncated SHA-256 over the JCS canonical form of
    /// the configuration, so key order inside `config` does not matter.
    pub fn for_config(
        run_id: impl Into<String>,
        data_type: impl Into<String>,
        config: &serde_json::Value,
    ) -> StoreResult<Self> {
        Self::new(run_id, data_type, lineage_hash(config)?)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn lineage_hash(&self) -> &str {
        &self.lineage_hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.run_id,
            self.data_type,
            self.lineage_hash,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for CacheKey {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [run_id, data_type, lineage_hash] => Self::new(*run_id, *data_type, *lineage_hash),
            _ => Err(StoreError::InvalidKey {
                component: "key",
                value: s.to_string(),
                reason: format!(
                    "expected 3 components separated by '{}', got {}",
                    KEY_SEPARATOR,
                    parts.len()
                ),
            }),
        }
    }
}

/// Hash of a plugin configuration, as used in [`CacheKey::for_config`].
pub fn lineage_hash(config: &serde_json::Value) -> StoreResult<String> {
    let canonical = serde_jcs::to_string(config).map_err(|e| StoreError::Serialization {
        message: format!("failed to canonicalize config: {}", e),
    })?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(LINEAGE_HASH_LEN);
    Ok(hex)
}

fn validate_component(component: &'static str, value: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        component,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(invalid("too long"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
    {
        return Err(invalid(&format!("character {:?} not allowed", c)));
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct KeyParts {
    run_id: String,
    data_type: String,
    lineage_hash: String,
}

impl TryFrom<KeyParts> for CacheKey {
    type Error = StoreError;

    fn try_from(p: KeyParts) -> StoreResult<Self> {
        Self::new(p.run_id, p.data_type, p.lineage_hash)
    }
}

impl From<CacheKey> for KeyParts {
    fn from(k: CacheKey) -> Self {
        Self {
            run_id: k.run_id,
            data_type: k.data_type,
            lineage_hash: k.lineage_hash,
        }
    }
}
