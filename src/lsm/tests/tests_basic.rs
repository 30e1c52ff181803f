use tempfile::TempDir;

use crate::lsm::LsmTree;
use crate::memtable::Memtable;
use crate::sstable::TableGetResult;

fn memtable_with(entries: &[(&[u8], Option<&[u8]>)]) -> Memtable {
    let mut mt = Memtable::new(1 << 20);
    for (key, value) in entries {
        match value {
            Some(v) => mt.put(key.to_vec(), v.to_vec()),
            None => mt.delete(key.to_vec()),
        }
    }
    mt
}

#[test]
fn empty_tree_finds_nothing() {
    let tmp = TempDir::new().unwrap();
    let tree = LsmTree::open(tmp.path()).unwrap();

    assert_eq!(tree.get(b"anything").unwrap(), TableGetResult::NotFound);
    assert_eq!(tree.entry_count(), 0);
    assert_eq!(tree.table_count(), 0);
}

#[test]
fn flush_then_get() {
    let tmp = TempDir::new().unwrap();
    let mut tree = LsmTree::open(tmp.path()).unwrap();

    tree.flush(&memtable_with(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]))
        .unwrap();

    assert_eq!(
        tree.get(b"a").unwrap(),
        TableGetResult::Value(b"1".to_vec())
    );
    assert_eq!(tree.get(b"missing").unwrap(), TableGetResult::NotFound);
    assert_eq!(tree.level_sizes()[0], 1);
}

#[test]
fn flush_of_empty_memtable_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let mut tree = LsmTree::open(tmp.path()).unwrap();
    tree.flush(&Memtable::new(64)).unwrap();

    assert_eq!(tree.table_count(), 0);
}

#[test]
fn newer_flush_shadows_older_within_level_zero() {
    let tmp = TempDir::new().unwrap();
    let mut tree = LsmTree::open(tmp.path()).unwrap();

    tree.flush(&memtable_with(&[(b"k", Some(b"old"))])).unwrap();
    tree.flush(&memtable_with(&[(b"k", Some(b"new"))])).unwrap();

    assert_eq!(
        tree.get(b"k").unwrap(),
        TableGetResult::Value(b"new".to_vec())
    );
}

#[test]
fn tombstone_in_newer_table_masks_older_value() {
    let tmp = TempDir::new().unwrap();
    let mut tree = LsmTree::open(tmp.path()).unwrap();

    tree.flush(&memtable_with(&[(b"k", Some(b"v1"))])).unwrap();
    tree.flush(&memtable_with(&[(b"k", None)])).unwrap();

    assert_eq!(tree.get(b"k").unwrap(), TableGetResult::Tombstone);
}

#[test]
fn reopen_rediscovers_tables() {
    let tmp = TempDir::new().unwrap();
    {
        let mut tree = LsmTree::open(tmp.path()).unwrap();
        tree.flush(&memtable_with(&[(b"persisted", Some(b"yes"))]))
            .unwrap();
    }

    let tree = LsmTree::open(tmp.path()).unwrap();
    assert_eq!(
        tree.get(b"persisted").unwrap(),
        TableGetResult::Value(b"yes".to_vec())
    );
}

#[test]
fn unreadable_table_is_skipped_on_open() {
    let tmp = TempDir::new().unwrap();
    {
        let mut tree = LsmTree::open(tmp.path()).unwrap();
        tree.flush(&memtable_with(&[(b"good", Some(b"data"))]))
            .unwrap();
    }
    // Drop a bogus table file beside the real one.
    std::fs::write(tmp.path().join("level_0_99999.sst"), b"junk").unwrap();

    let tree = LsmTree::open(tmp.path()).unwrap();
    assert_eq!(tree.table_count(), 1);
    assert_eq!(
        tree.get(b"good").unwrap(),
        TableGetResult::Value(b"data".to_vec())
    );
}
