//! End-to-end scenarios exercised through the public [`Database`] surface.

use std::time::Duration;

use tempfile::TempDir;
use vesperdb::{ChangeKind, Database, DbConfig};

fn open(dir: &std::path::Path) -> Database {
    open_with_config(dir, DbConfig::default())
}

fn open_with_config(dir: &std::path::Path, config: DbConfig) -> Database {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Database::open_with("integration", config, None, Some(dir.to_path_buf()))
        .expect("open database")
}

/// Small memtable and one-deep immutable queue: every few writes reach
/// the LSM.
fn spill_config() -> DbConfig {
    DbConfig {
        memtable_size_bytes: 128,
        max_immutable_memtables: 1,
        batch_interval_ms: 1,
        ..DbConfig::default()
    }
}

#[test]
fn persistence_across_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        db.put(b"user:123", b"Alice").unwrap();
        db.put(b"user:456", b"Bob").unwrap();
        db.close().unwrap();
    }

    let db = open(tmp.path());
    assert_eq!(db.get(b"user:123").unwrap(), Some(b"Alice".to_vec()));
    assert_eq!(db.get(b"user:456").unwrap(), Some(b"Bob".to_vec()));
    db.close().unwrap();
}

#[test]
fn delete_persists_across_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        db.put(b"user:123", b"Alice").unwrap();
        db.put(b"user:456", b"Bob").unwrap();
        db.close().unwrap();
    }
    {
        let db = open(tmp.path());
        db.delete(b"user:456").unwrap();
        db.close().unwrap();
    }

    let db = open(tmp.path());
    assert_eq!(db.get(b"user:456").unwrap(), None);
    assert_eq!(db.get(b"user:123").unwrap(), Some(b"Alice".to_vec()));
    db.close().unwrap();
}

#[test]
fn compaction_preserves_data() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for i in 0..200 {
        db.put(
            format!("compact_{i}").as_bytes(),
            format!("value_{i}").as_bytes(),
        )
        .unwrap();
    }
    db.compact().unwrap();

    for i in 0..200 {
        assert_eq!(
            db.get(format!("compact_{i}").as_bytes()).unwrap(),
            Some(format!("value_{i}").into_bytes()),
            "compact_{i} lost after compaction"
        );
    }
    db.close().unwrap();
}

#[test]
fn tombstone_masks_older_sstable() {
    let tmp = TempDir::new().unwrap();
    let db = open_with_config(tmp.path(), spill_config());

    db.put(b"k", b"v1").unwrap();
    // Force the value down to disk.
    for i in 0..20 {
        db.put(format!("filler_a_{i}").as_bytes(), &[0u8; 32]).unwrap();
    }
    db.delete(b"k").unwrap();
    // Force the tombstone down as well.
    for i in 0..20 {
        db.put(format!("filler_b_{i}").as_bytes(), &[0u8; 32]).unwrap();
    }

    // The first table still physically contains ("k","v1"); the newer
    // tombstone must win.
    assert_eq!(db.get(b"k").unwrap(), None);

    db.compact().unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn sequence_stays_monotone_after_crash_recovery() {
    let tmp = TempDir::new().unwrap();
    let last_before_crash;
    {
        let db = open(tmp.path());
        for i in 0..10 {
            db.put(format!("seq_{i}").as_bytes(), b"v").unwrap();
        }
        last_before_crash = db.stats().unwrap().engine.last_seq;
        // Simulated crash: drop without close().
    }

    let db = open(tmp.path());
    db.put(b"post-crash", b"v").unwrap();
    let last_after = db.stats().unwrap().engine.last_seq;
    assert!(
        last_after > last_before_crash,
        "sequence regressed across recovery: {last_before_crash} -> {last_after}"
    );
    db.close().unwrap();
}

#[test]
fn batch_write_emits_per_key_events_in_order() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());
    let rx = db.subscribe_all();

    db.put_batch(&[
        (b"a".to_vec(), b"1".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ])
    .unwrap();

    for expected in [b"a", b"b", b"c"] {
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.kind, ChangeKind::Put);
        assert_eq!(event.key, expected);
    }
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Boundary behaviors
// ------------------------------------------------------------------------------------------------

#[test]
fn boundary_key_sizes_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    let empty: &[u8] = b"";
    let one = b"x";
    let huge = vec![0xABu8; 64 * 1024];

    db.put(empty, b"empty-key").unwrap();
    db.put(one, b"one-byte-key").unwrap();
    db.put(&huge, b"64k-key").unwrap();
    db.close().unwrap();

    let db = open(tmp.path());
    assert_eq!(db.get(empty).unwrap(), Some(b"empty-key".to_vec()));
    assert_eq!(db.get(one).unwrap(), Some(b"one-byte-key".to_vec()));
    assert_eq!(db.get(&huge).unwrap(), Some(b"64k-key".to_vec()));
    db.close().unwrap();
}

#[test]
fn empty_value_is_some_empty_not_none() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open(tmp.path());
        db.put(b"empty-value", b"").unwrap();
        db.close().unwrap();
    }

    // Must hold from disk too, not just from memory or cache.
    let db = open(tmp.path());
    assert_eq!(db.get(b"empty-value").unwrap(), Some(Vec::new()));
    db.compact().unwrap();
    assert_eq!(db.get(b"empty-value").unwrap(), Some(Vec::new()));
    db.close().unwrap();
}

#[test]
fn value_larger_than_memtable_budget_succeeds() {
    let tmp = TempDir::new().unwrap();
    let db = open_with_config(tmp.path(), spill_config());

    let big = vec![0x42u8; 8 * 1024];
    db.put(b"big", &big).unwrap();
    db.put(b"after", b"ok").unwrap();

    assert_eq!(db.get(b"big").unwrap(), Some(big.clone()));
    db.close().unwrap();

    let db = open_with_config(tmp.path(), spill_config());
    assert_eq!(db.get(b"big").unwrap(), Some(big));
    db.close().unwrap();
}

#[test]
fn wal_rotation_mid_stream_loses_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = DbConfig {
        wal_max_file_bytes: 512,
        batch_interval_ms: 1,
        ..DbConfig::default()
    };
    {
        let db = open_with_config(tmp.path(), config.clone());
        for i in 0..50 {
            db.put(format!("rotate_{i:03}").as_bytes(), &[0x11u8; 64])
                .unwrap();
        }
        // Crash without close: recovery must stitch the segments together.
    }

    let db = open_with_config(tmp.path(), config);
    for i in 0..50 {
        assert_eq!(
            db.get(format!("rotate_{i:03}").as_bytes()).unwrap(),
            Some(vec![0x11u8; 64]),
            "rotate_{i:03} lost across WAL rotation"
        );
    }
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Idempotence laws
// ------------------------------------------------------------------------------------------------

#[test]
fn repeated_delete_equals_single_delete() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    db.put(b"k", b"v").unwrap();
    db.delete(b"k").unwrap();
    db.delete(b"k").unwrap();

    assert_eq!(db.get(b"k").unwrap(), None);
    db.close().unwrap();

    let db = open(tmp.path());
    assert_eq!(db.get(b"k").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn repeated_put_equals_single_put() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    db.put(b"k", b"v").unwrap();
    db.put(b"k", b"v").unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    db.close().unwrap();
}

#[test]
fn compact_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db = open(tmp.path());

    for i in 0..50 {
        db.put(format!("idem_{i}").as_bytes(), b"v").unwrap();
    }
    db.compact().unwrap();
    let first = db.stats().unwrap().engine;
    db.compact().unwrap();
    let second = db.stats().unwrap().engine;

    assert_eq!(first.level_sizes, second.level_sizes);
    assert_eq!(first.sstable_entries, second.sstable_entries);
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Mixed workload
// ------------------------------------------------------------------------------------------------

#[test]
fn randomized_workload_matches_a_model() {
    use rand::Rng;
    use std::collections::HashMap;

    let tmp = TempDir::new().unwrap();
    let db = open_with_config(
        tmp.path(),
        DbConfig {
            memtable_size_bytes: 512,
            batch_interval_ms: 1,
            ..DbConfig::default()
        },
    );

    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = rand::rng();

    for _ in 0..400 {
        let key = format!("key_{}", rng.random_range(0..40)).into_bytes();
        if rng.random_bool(0.25) {
            db.delete(&key).unwrap();
            model.remove(&key);
        } else {
            let value = format!("value_{}", rng.random_range(0..1000)).into_bytes();
            db.put(&key, &value).unwrap();
            model.insert(key, value);
        }
    }

    for i in 0..40 {
        let key = format!("key_{i}").into_bytes();
        assert_eq!(db.get(&key).unwrap(), model.get(&key).cloned(), "key_{i}");
    }

    // The same must hold after a crash-recovery cycle.
    drop(db);
    let db = open(tmp.path());
    for i in 0..40 {
        let key = format!("key_{i}").into_bytes();
        assert_eq!(
            db.get(&key).unwrap(),
            model.get(&key).cloned(),
            "key_{i} diverged after recovery"
        );
    }
    db.close().unwrap();
}
