use tempfile::TempDir;

use super::helpers::{open_small_wal, open_wal};
use crate::wal::{WalEntryKind, WalError};

#[test]
fn fresh_directory_recovers_nothing() {
    let tmp = TempDir::new().unwrap();
    let (wal, recovery) = open_wal(tmp.path()).unwrap();

    assert!(recovery.entries.is_empty());
    assert_eq!(recovery.max_seq, 0);
    assert_eq!(wal.last_seq(), 0);

    wal.close().unwrap();
}

#[test]
fn puts_and_deletes_replay_in_sequence_order() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_wal(tmp.path()).unwrap();

    let s1 = wal.append_put(b"user:1", b"alice").unwrap();
    let s2 = wal.append_put(b"user:2", b"bob").unwrap();
    let s3 = wal.append_delete(b"user:1").unwrap();
    assert!(s1 < s2 && s2 < s3);
    wal.close().unwrap();

    let (wal, recovery) = open_wal(tmp.path()).unwrap();
    assert_eq!(recovery.entries.len(), 3);
    assert_eq!(recovery.max_seq, s3);

    assert_eq!(recovery.entries[0].kind, WalEntryKind::Put);
    assert_eq!(recovery.entries[0].key, b"user:1");
    assert_eq!(recovery.entries[0].value, b"alice");

    assert_eq!(recovery.entries[2].kind, WalEntryKind::Delete);
    assert_eq!(recovery.entries[2].key, b"user:1");
    assert!(recovery.entries[2].value.is_empty());

    let seqs: Vec<u64> = recovery.entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![s1, s2, s3]);
    wal.close().unwrap();
}

#[test]
fn sequence_continues_after_reopen() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_wal(tmp.path()).unwrap();
    let mut last = 0;
    for i in 0..10u32 {
        last = wal
            .append_put(format!("k{i}").as_bytes(), b"v")
            .unwrap();
    }
    // Simulated crash: drop without close(); entries were acknowledged,
    // so they are already on disk.
    drop(wal);

    let (wal, recovery) = open_wal(tmp.path()).unwrap();
    assert_eq!(recovery.entries.len(), 10);
    let next = wal.append_put(b"after", b"crash").unwrap();
    assert!(next > last);
    wal.close().unwrap();
}

#[test]
fn checkpoint_cuts_recovery_but_not_sequence() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_wal(tmp.path()).unwrap();

    wal.append_put(b"a", b"1").unwrap();
    wal.append_put(b"b", b"2").unwrap();
    wal.checkpoint().unwrap();
    let after = wal.append_put(b"c", b"3").unwrap();
    wal.close().unwrap();

    let (wal, recovery) = open_wal(tmp.path()).unwrap();
    // Only the post-checkpoint entry replays…
    assert_eq!(recovery.entries.len(), 1);
    assert_eq!(recovery.entries[0].key, b"c");
    // …but the sequence space still accounts for everything before it.
    assert_eq!(recovery.max_seq, after);
    wal.close().unwrap();
}

#[test]
fn empty_key_and_empty_value_are_preserved() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_wal(tmp.path()).unwrap();
    wal.append_put(b"", b"value-for-empty-key").unwrap();
    wal.append_put(b"empty-value", b"").unwrap();
    wal.close().unwrap();

    let (wal, recovery) = open_wal(tmp.path()).unwrap();
    assert_eq!(recovery.entries.len(), 2);
    assert!(recovery.entries[0].key.is_empty());
    assert_eq!(recovery.entries[0].kind, WalEntryKind::Put);
    assert!(recovery.entries[1].value.is_empty());
    assert_eq!(recovery.entries[1].kind, WalEntryKind::Put);
    wal.close().unwrap();
}

#[test]
fn append_after_close_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_wal(tmp.path()).unwrap();
    wal.close().unwrap();

    let err = wal.append_put(b"k", b"v").unwrap_err();
    assert!(matches!(err, WalError::Closed));
    // close() is idempotent.
    wal.close().unwrap();
}

#[test]
fn truncate_keeps_only_active_segment() {
    let tmp = TempDir::new().unwrap();
    let (wal, _) = open_small_wal(tmp.path()).unwrap();

    // Enough data to rotate through several segments.
    for i in 0..50u32 {
        wal.append_put(format!("key-{i:04}").as_bytes(), &[0xAB; 32])
            .unwrap();
    }
    let segments_before = std::fs::read_dir(tmp.path()).unwrap().count();
    assert!(segments_before > 1);

    wal.truncate().unwrap();
    let segments_after = std::fs::read_dir(tmp.path()).unwrap().count();
    assert_eq!(segments_after, 1);
    wal.close().unwrap();
}
