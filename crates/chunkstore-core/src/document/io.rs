//! Filesystem helpers for the document backend.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::chunk::RecordBatch;
use crate::error::{StoreError, StoreResult};
use crate::metadata::Compressor;

pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const PENDING_FILE: &str = ".pending";

pub(crate) fn chunk_path_impl(dir: &Path, chunk_i: u64, compressor: Option<Compressor>) -> PathBuf {
    let name = match compressor {
        None => format!("chunk_{:06}.json", chunk_i),
        Some(Compressor::Gzip) => format!("chunk_{:06}.json.gz", chunk_i),
    };
    dir.join(name)
}

/// Write `content` to `path` via a temp file in the same directory and a
/// rename, so readers never see a half-written file.
pub(crate) fn write_atomic_impl(path: &Path, content: &[u8]) -> StoreResult<()> {
    let dir = path.parent().ok_or_else(|| StoreError::Io {
        message: format!("no parent directory for {}", path.display()),
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::Io {
        message: format!("failed to create temp file in {}: {}", dir.display(), e),
    })?;
    tmp.write_all(content).map_err(|e| StoreError::Io {
        message: format!("failed to write temp file: {}", e),
    })?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io {
        message: format!("failed to rename temp file to {}: {}", path.display(), e.error),
    })?;
    Ok(())
}

pub(crate) fn encode_chunk_impl(
    batch: &RecordBatch,
    compressor: Option<Compressor>,
) -> StoreResult<Vec<u8>> {
    let json = serde_json::to_vec(batch)?;
    match compressor {
        None => Ok(json),
        Some(Compressor::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decode a stored chunk and re-validate it against its own schema.
pub(crate) fn decode_chunk_impl(
    bytes: &[u8],
    compressor: Option<Compressor>,
) -> StoreResult<RecordBatch> {
    let json = match compressor {
        None => bytes.to_vec(),
        Some(Compressor::Gzip) => {
            let mut out = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut out)?;
            out
        }
    };
    let raw: RecordBatch = serde_json::from_slice(&json)?;
    let (schema, rows) = raw.into_parts();
    RecordBatch::new(schema, rows)
}

/// Entry directories under a root that match one key name.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EntryScan {
    /// A directory with exactly this name exists.
    pub exact: bool,
    /// A directory whose name differs only in ASCII case.
    pub variant: Option<String>,
}

/// Scan `root` for `name`. Case-insensitive filesystems resolve a variant
/// to the same directory, so the stored names are compared directly.
pub(crate) fn scan_entry_impl(root: &Path, name: &str) -> StoreResult<EntryScan> {
    let mut scan = EntryScan::default();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(stored) = file_name.to_str() else {
            continue;
        };
        if stored == name {
            scan.exact = true;
        } else if stored.eq_ignore_ascii_case(name) {
            scan.variant = Some(stored.to_string());
        }
    }
    Ok(scan)
}

pub(crate) fn remove_dir_impl(dir: &Path) -> StoreResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| StoreError::Io {
            message: format!("failed to remove {}: {}", dir.display(), e),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{DType, Field, Schema, Value};
    use tempfile::TempDir;

    fn batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("time", DType::Int64),
            Field::new("raw", DType::Bytes),
        ])
        .unwrap();
        RecordBatch::new(
            schema,
            vec![
                vec![Value::Int(1), Value::Bytes(vec![0, 1, 2])],
                vec![Value::Int(2), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_gzip_chunk_is_smaller_and_decodes() {
        let b = batch();
        let plain = encode_chunk_impl(&b, None).unwrap();
        let gz = encode_chunk_impl(&b, Some(Compressor::Gzip)).unwrap();
        assert_ne!(plain, gz);
        assert_eq!(decode_chunk_impl(&gz, Some(Compressor::Gzip)).unwrap(), b);
        assert_eq!(decode_chunk_impl(&plain, None).unwrap(), b);
        assert!(decode_chunk_impl(&plain, Some(Compressor::Gzip)).is_err());
    }

    #[test]
    fn test_decode_revalidates_rows() {
        let bad = br#"{"schema":[{"name":"time","dtype":"int64"}],"rows":[[{"Text":"x"}]]}"#;
        assert!(matches!(
            decode_chunk_impl(bad, None),
            Err(StoreError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        write_atomic_impl(&path, b"one").unwrap();
        write_atomic_impl(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_chunk_paths() {
        let dir = Path::new("/cache/run-raw-abc");
        assert_eq!(
            chunk_path_impl(dir, 7, None),
            Path::new("/cache/run-raw-abc/chunk_000007.json")
        );
        assert_eq!(
            chunk_path_impl(dir, 7, Some(Compressor::Gzip)),
            Path::new("/cache/run-raw-abc/chunk_000007.json.gz")
        );
    }

    #[test]
    fn test_scan_entry_reports_case_variants() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("run-raw-abc")).unwrap();
        fs::write(root.path().join("RUN-raw-ABC"), b"not a directory").unwrap();

        let scan = scan_entry_impl(root.path(), "run-raw-abc").unwrap();
        assert_eq!(scan, EntryScan { exact: true, variant: None });

        let scan = scan_entry_impl(root.path(), "Run-Raw-Abc").unwrap();
        assert!(!scan.exact);
        assert_eq!(scan.variant.as_deref(), Some("run-raw-abc"));

        let scan = scan_entry_impl(&root.path().join("missing"), "run-raw-abc").unwrap();
        assert_eq!(scan, EntryScan::default());
    }
}
