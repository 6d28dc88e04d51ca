//! Store/Saver contract, run against every backend.
//!
//! Each test opens a fresh SQLite database file and a fresh document root
//! and runs the same assertions against both.

use chunkstore_core::{
    CacheKey, Chunk, Compressor, DType, DocumentStore, ErrorClass, Field, OverwritePolicy,
    RecordBatch, SaverState, Schema, SqliteStore, Store, StoreError, Value,
};
use serde_json::{json, Map};
use std::fs;
use tempfile::TempDir;

struct Backends {
    stores: Vec<(&'static str, Box<dyn Store>)>,
    _tmp: TempDir,
}

fn backends() -> Backends {
    backends_with(OverwritePolicy::Reject)
}

fn backends_with(policy: OverwritePolicy) -> Backends {
    let tmp = TempDir::new().unwrap();
    let sqlite = SqliteStore::open(&tmp.path().join("cache.db"))
        .unwrap()
        .with_overwrite_policy(policy);
    let document = DocumentStore::open(tmp.path().join("docs"))
        .unwrap()
        .with_overwrite_policy(policy);
    Backends {
        stores: vec![
            ("sqlite", Box::new(sqlite) as Box<dyn Store>),
            ("document", Box::new(document) as Box<dyn Store>),
        ],
        _tmp: tmp,
    }
}

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("time", DType::Int64),
        Field::new("area", DType::Float64),
        Field::new("label", DType::Text),
    ])
    .unwrap()
}

fn batch(offset: i64, n: i64) -> RecordBatch {
    let rows = (0..n)
        .map(|i| {
            vec![
                Value::Int(offset + i),
                Value::Float((offset + i) as f64 * 0.25),
                Value::Text(format!("s{}", offset + i)),
            ]
        })
        .collect();
    RecordBatch::new(schema(), rows).unwrap()
}

fn seed() -> Map<String, serde_json::Value> {
    json!({"run_start": 1_700_000_000, "detector": "tpc"})
        .as_object()
        .unwrap()
        .clone()
}

fn hit_key() -> CacheKey {
    CacheKey::new("run001", "raw", "cfgHashABC").unwrap()
}

fn write_entry(store: &dyn Store, key: &CacheKey, sizes: &[i64]) {
    let mut saver = store.saver(key, seed()).unwrap();
    let mut offset = 0;
    for (i, n) in sizes.iter().enumerate() {
        saver
            .write_chunk(Chunk::new(i as u64, batch(offset, *n)), None)
            .unwrap();
        offset += n;
    }
    saver.close().unwrap();
}

#[test]
fn contract_hit_after_close_returns_all_chunks() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        saver
            .write_chunk(Chunk::new(0, batch(0, 5)).with_bounds(0, 4), None)
            .unwrap();
        saver
            .write_chunk(Chunk::new(1, batch(5, 3)).with_bounds(5, 7), None)
            .unwrap();
        let closed = saver.close().unwrap();
        assert_eq!(saver.state(), SaverState::Closed, "{}", name);

        let entry = store.find(&key).unwrap();
        assert_eq!(entry.metadata, closed, "{}", name);
        assert_eq!(entry.metadata.chunks.len(), 2, "{}", name);
        assert_eq!(entry.metadata.chunks[0].n, 5, "{}", name);
        assert_eq!(entry.metadata.chunks[1].n, 3, "{}", name);
        assert_eq!(entry.metadata.chunks[1].start, Some(5), "{}", name);
        assert_eq!(entry.metadata.total_rows(), 8, "{}", name);
        assert_eq!(entry.metadata.dtype.as_ref(), Some(&schema()), "{}", name);
        assert_eq!(entry.metadata.fields["detector"], json!("tpc"), "{}", name);
        assert!(entry.metadata.writing_started.is_some(), "{}", name);
        assert!(entry.metadata.writing_ended.is_some(), "{}", name);

        let chunks: Vec<Chunk> = store.chunks(&entry).collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 2, "{}", name);
        assert_eq!(chunks[0].batch, batch(0, 5), "{}", name);
        assert_eq!(chunks[1].batch, batch(5, 3), "{}", name);
        assert_eq!(chunks[1].end, Some(7), "{}", name);

        // Random access to the second chunk
        let second = store
            .read_chunk(&entry, &entry.metadata.chunks[1], &schema())
            .unwrap();
        assert_eq!(second, batch(5, 3), "{}", name);

        assert_eq!(store.read_metadata(&key).unwrap(), closed, "{}", name);
    }
}

#[test]
fn contract_unknown_key_is_a_miss() {
    for (name, store) in &backends().stores {
        let key = CacheKey::new("run999", "raw", "x").unwrap();
        let err = store.find(&key).unwrap_err();
        assert!(err.is_not_cached(), "{}: {}", name, err);
        assert_eq!(err.class(), ErrorClass::Miss, "{}", name);
        assert!(!err.is_corruption(), "{}", name);
    }
}

#[test]
fn contract_entry_invisible_until_close() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);

        saver.write_chunk(Chunk::new(0, batch(0, 5)), None).unwrap();
        assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);
        assert!(store.list_keys().unwrap().is_empty(), "{}", name);

        saver.close().unwrap();
        assert!(store.find(&key).is_ok(), "{}", name);
        assert_eq!(store.list_keys().unwrap(), vec![key], "{}", name);
    }
}

#[test]
fn contract_abandoned_saver_reads_as_miss_and_can_be_retried() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        {
            let mut saver = store.saver(&key, seed()).unwrap();
            saver.write_chunk(Chunk::new(0, batch(0, 5)), None).unwrap();
            // dropped without close
        }
        assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);

        write_entry(store.as_ref(), &key, &[2, 2]);
        let entry = store.find(&key).unwrap();
        assert_eq!(entry.metadata.total_rows(), 4, "{}", name);
        let rows: usize = store
            .chunks(&entry)
            .map(|c| c.unwrap().batch.num_rows())
            .sum();
        assert_eq!(rows, 4, "{}: leftovers of the abandoned write leaked", name);
    }
}

#[test]
fn contract_chunk_order_is_enforced() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();

        let err = saver.write_chunk(Chunk::new(1, batch(0, 1)), None).unwrap_err();
        assert!(
            matches!(err, StoreError::ChunkOutOfOrder { expected: 0, got: 1, .. }),
            "{}: {}",
            name,
            err
        );

        saver.write_chunk(Chunk::new(0, batch(0, 1)), None).unwrap();
        let err = saver.write_chunk(Chunk::new(0, batch(1, 1)), None).unwrap_err();
        assert!(
            matches!(err, StoreError::DuplicateChunk { chunk_i: 0, .. }),
            "{}: {}",
            name,
            err
        );

        // Rejected chunks leave the saver usable
        assert_eq!(saver.state(), SaverState::Open, "{}", name);
        saver.write_chunk(Chunk::new(1, batch(1, 1)), None).unwrap();
        let md = saver.close().unwrap();
        assert_eq!(md.chunks.len(), 2, "{}", name);
    }
}

#[test]
fn contract_schema_is_fixed_per_key() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        saver.write_chunk(Chunk::new(0, batch(0, 2)), None).unwrap();

        let other = Schema::new(vec![Field::new("time", DType::Text)]).unwrap();
        let err = saver
            .write_chunk(Chunk::new(1, RecordBatch::empty(other)), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }), "{}: {}", name, err);
    }
}

#[test]
fn contract_closed_saver_refuses_everything() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        saver.write_chunk(Chunk::new(0, batch(0, 1)), None).unwrap();
        saver.close().unwrap();

        assert!(
            matches!(saver.close(), Err(StoreError::SaverClosed { .. })),
            "{}",
            name
        );
        assert!(
            matches!(
                saver.write_chunk(Chunk::new(1, batch(1, 1)), None),
                Err(StoreError::SaverClosed { .. })
            ),
            "{}",
            name
        );
        assert_eq!(store.find(&key).unwrap().metadata.chunks.len(), 1, "{}", name);
    }
}

#[test]
fn contract_empty_entry_is_a_hit_with_no_chunks() {
    for (name, store) in &backends().stores {
        let key = CacheKey::new("run002", "peaks", "h0").unwrap();
        let mut saver = store.saver(&key, Map::new()).unwrap();
        let md = saver.close().unwrap();
        assert!(md.chunks.is_empty(), "{}", name);

        let entry = store.find(&key).unwrap();
        assert!(entry.metadata.chunks.is_empty(), "{}", name);
        assert!(entry.metadata.dtype.is_none(), "{}", name);
        assert_eq!(store.chunks(&entry).count(), 0, "{}", name);
    }
}

#[test]
fn contract_second_saver_for_same_key_is_busy() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let first = store.saver(&key, seed()).unwrap();
        let err = store.saver(&key, seed()).err().unwrap();
        assert!(matches!(err, StoreError::WriterBusy { .. }), "{}: {}", name, err);

        drop(first);
        assert!(store.saver(&key, seed()).is_ok(), "{}", name);
    }
}

#[test]
fn contract_reject_policy_keeps_cached_entry() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        write_entry(store.as_ref(), &key, &[5, 3]);

        let err = store.saver(&key, seed()).err().unwrap();
        assert!(matches!(err, StoreError::AlreadyCached { .. }), "{}: {}", name, err);
        assert_eq!(store.find(&key).unwrap().metadata.total_rows(), 8, "{}", name);
    }
}

#[test]
fn contract_replace_policy_rewrites_entry() {
    for (name, store) in &backends_with(OverwritePolicy::Replace).stores {
        let key = hit_key();
        write_entry(store.as_ref(), &key, &[5, 3]);

        let mut saver = store.saver(&key, seed()).unwrap();
        // Old entry is gone as soon as the replacing saver opens
        assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);
        saver.write_chunk(Chunk::new(0, batch(100, 2)), None).unwrap();
        saver.close().unwrap();

        let entry = store.find(&key).unwrap();
        assert_eq!(entry.metadata.total_rows(), 2, "{}", name);
        let chunks: Vec<Chunk> = store.chunks(&entry).collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 1, "{}", name);
        assert_eq!(chunks[0].batch, batch(100, 2), "{}", name);
    }
}

#[test]
fn contract_compressor_is_recorded() {
    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        saver
            .write_chunk(Chunk::new(0, batch(0, 4)), Some(Compressor::Gzip))
            .unwrap();
        saver.write_chunk(Chunk::new(1, batch(4, 1)), None).unwrap();
        saver.close().unwrap();

        let entry = store.find(&key).unwrap();
        assert_eq!(entry.metadata.chunks[0].compressor, Some(Compressor::Gzip), "{}", name);
        assert_eq!(entry.metadata.chunks[1].compressor, None, "{}", name);
        let chunks: Vec<Chunk> = store.chunks(&entry).collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks[0].batch, batch(0, 4), "{}", name);
    }
}

#[test]
fn contract_keys_are_independent() {
    for (name, store) in &backends().stores {
        let raw = CacheKey::for_config("run001", "raw", &json!({"gain": 2})).unwrap();
        let peaks = CacheKey::for_config("run001", "peaks", &json!({"gain": 2})).unwrap();
        let other_cfg = CacheKey::for_config("run001", "raw", &json!({"gain": 3})).unwrap();

        write_entry(store.as_ref(), &raw, &[1]);
        write_entry(store.as_ref(), &peaks, &[2]);

        assert_eq!(store.find(&raw).unwrap().metadata.total_rows(), 1, "{}", name);
        assert_eq!(store.find(&peaks).unwrap().metadata.total_rows(), 2, "{}", name);
        assert!(store.find(&other_cfg).unwrap_err().is_not_cached(), "{}", name);

        let mut expected = vec![raw, peaks];
        expected.sort();
        assert_eq!(store.list_keys().unwrap(), expected, "{}", name);
    }
}

#[test]
fn contract_float_extremes_round_trip() {
    let values = [
        f64::MAX,
        f64::MIN,
        f64::MIN_POSITIVE,
        5e-324,
        -1e-300,
        0.1,
        1.0 / 3.0,
        123_456_789.125,
    ];
    let rows = values
        .iter()
        .enumerate()
        .map(|(i, v)| vec![Value::Int(i as i64), Value::Float(*v), Value::Null])
        .collect();
    let extremes = RecordBatch::new(schema(), rows).unwrap();

    for (name, store) in &backends().stores {
        let key = hit_key();
        let mut saver = store.saver(&key, seed()).unwrap();
        saver
            .write_chunk(Chunk::new(0, extremes.clone()), None)
            .unwrap();
        saver
            .write_chunk(Chunk::new(1, extremes.clone()), Some(Compressor::Gzip))
            .unwrap();
        saver.close().unwrap();

        let entry = store.find(&key).unwrap();
        for chunk in store.chunks(&entry) {
            let chunk = chunk.unwrap();
            for (row, expected) in chunk.batch.rows().iter().zip(values) {
                match row[1] {
                    Value::Float(v) => {
                        assert_eq!(v.to_bits(), expected.to_bits(), "{}: {}", name, expected)
                    }
                    ref other => panic!("{}: {:?} read back as {:?}", name, expected, other),
                }
            }
        }
    }
}

#[test]
fn contract_non_finite_floats_never_reach_a_backend() {
    for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = RecordBatch::new(
            schema(),
            vec![vec![Value::Int(0), Value::Float(v), Value::Null]],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSchema { .. }), "{}", err);
        assert_eq!(err.class(), ErrorClass::Contract);
    }
}

/// Fail a write midway through `break_backend`, then check the key never
/// becomes a hit and can be written again once the saver is gone and
/// `repair` has run.
fn assert_failed_write_never_commits(
    name: &str,
    store: &dyn Store,
    break_backend: impl FnOnce(),
    repair: impl FnOnce(),
    during_close: bool,
) {
    let key = hit_key();
    let mut saver = store.saver(&key, seed()).unwrap();
    saver.write_chunk(Chunk::new(0, batch(0, 3)), None).unwrap();
    break_backend();

    let err = if during_close {
        saver.close().unwrap_err()
    } else {
        saver
            .write_chunk(Chunk::new(1, batch(3, 2)), None)
            .unwrap_err()
    };
    assert!(!err.is_not_cached(), "{}: {}", name, err);
    assert_eq!(saver.state(), SaverState::Failed, "{}", name);

    assert!(matches!(
        saver.write_chunk(Chunk::new(1, batch(3, 2)), None),
        Err(StoreError::SaverFailed { .. })
    ));
    assert!(matches!(saver.close(), Err(StoreError::SaverFailed { .. })));
    assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);
    drop(saver);
    repair();

    assert!(store.find(&key).unwrap_err().is_not_cached(), "{}", name);
    write_entry(store, &key, &[4, 1]);
    let entry = store.find(&key).unwrap();
    assert_eq!(entry.metadata.total_rows(), 5, "{}", name);
    let chunks: Vec<Chunk> = store.chunks(&entry).collect::<Result<_, _>>().unwrap();
    assert_eq!(chunks[1].batch, batch(4, 1), "{}", name);
}

#[test]
fn contract_failed_chunk_write_never_commits() {
    let tmp = TempDir::new().unwrap();
    let key = hit_key();

    let sqlite = SqliteStore::open(&tmp.path().join("cache.db")).unwrap();
    assert_failed_write_never_commits(
        "sqlite",
        &sqlite,
        || {
            // Replace the data table with one lacking the chunk columns
            sqlite
                .connection()
                .unwrap()
                .execute_batch(&format!(
                    "DROP TABLE \"{0}\"; CREATE TABLE \"{0}\" (x INTEGER);",
                    key
                ))
                .unwrap();
        },
        || {},
        false,
    );

    let document = DocumentStore::open(tmp.path().join("docs")).unwrap();
    let dir = document.entry_dir(&key);
    assert_failed_write_never_commits(
        "document",
        &document,
        || fs::create_dir(dir.join("chunk_000001.json")).unwrap(),
        || {},
        false,
    );
}

#[test]
fn contract_failed_commit_never_commits() {
    let tmp = TempDir::new().unwrap();
    let key = hit_key();

    let sqlite = SqliteStore::open(&tmp.path().join("cache.db")).unwrap();
    assert_failed_write_never_commits(
        "sqlite",
        &sqlite,
        || {
            sqlite
                .connection()
                .unwrap()
                .execute_batch(
                    "CREATE TRIGGER refuse_commit BEFORE INSERT ON metadata \
                     BEGIN SELECT RAISE(ABORT, 'commit refused'); END;",
                )
                .unwrap();
        },
        || {
            sqlite
                .connection()
                .unwrap()
                .execute_batch("DROP TRIGGER refuse_commit;")
                .unwrap();
        },
        true,
    );

    let document = DocumentStore::open(tmp.path().join("docs")).unwrap();
    let dir = document.entry_dir(&key);
    assert_failed_write_never_commits(
        "document",
        &document,
        || fs::create_dir(dir.join("metadata.json")).unwrap(),
        || {},
        true,
    );
}
