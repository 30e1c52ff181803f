use tempfile::TempDir;

use crate::sstable::{SSTable, SSTableError, TableBuilder, TableGetResult, table_file_name};

fn build_table(
    dir: &std::path::Path,
    level: u8,
    created_at: u64,
    records: &[(&[u8], Option<&[u8]>)],
) -> std::path::PathBuf {
    let path = dir.join(table_file_name(level, created_at));
    let mut builder = TableBuilder::create(&path).unwrap();
    for (key, value) in records {
        builder.add(key, *value).unwrap();
    }
    builder.finish().unwrap();
    path
}

#[test]
fn build_then_get_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(
        tmp.path(),
        0,
        1000,
        &[
            (b"alpha", Some(b"1")),
            (b"beta", Some(b"2")),
            (b"gamma", Some(b"3")),
        ],
    );

    let table = SSTable::open(&path).unwrap();
    assert_eq!(table.level(), 0);
    assert_eq!(table.created_at(), 1000);
    assert_eq!(table.entry_count(), 3);

    assert_eq!(
        table.get(b"beta").unwrap(),
        TableGetResult::Value(b"2".to_vec())
    );
    assert_eq!(table.get(b"delta").unwrap(), TableGetResult::NotFound);
}

#[test]
fn tombstone_is_distinct_from_empty_value() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(
        tmp.path(),
        0,
        1000,
        &[(b"deleted", None), (b"empty", Some(b""))],
    );

    let table = SSTable::open(&path).unwrap();
    assert_eq!(table.get(b"deleted").unwrap(), TableGetResult::Tombstone);
    assert_eq!(
        table.get(b"empty").unwrap(),
        TableGetResult::Value(Vec::new())
    );
}

#[test]
fn empty_key_roundtrips() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(tmp.path(), 1, 5, &[(b"", Some(b"empty-key-value"))]);

    let table = SSTable::open(&path).unwrap();
    assert_eq!(
        table.get(b"").unwrap(),
        TableGetResult::Value(b"empty-key-value".to_vec())
    );
}

#[test]
fn min_max_and_contains_follow_the_index() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(
        tmp.path(),
        0,
        7,
        &[(b"aaa", Some(b"1")), (b"mmm", None), (b"zzz", Some(b"3"))],
    );

    let table = SSTable::open(&path).unwrap();
    assert_eq!(table.min_key(), Some(b"aaa".as_slice()));
    assert_eq!(table.max_key(), Some(b"zzz".as_slice()));
    assert!(table.contains(b"mmm"));
    assert!(!table.contains(b"nope"));
}

#[test]
fn read_all_yields_records_in_key_order() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(
        tmp.path(),
        2,
        42,
        &[(b"a", Some(b"1")), (b"b", None), (b"c", Some(b"3"))],
    );

    let table = SSTable::open(&path).unwrap();
    let all = table.read_all().unwrap();
    assert_eq!(
        all,
        vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), None),
            (b"c".to_vec(), Some(b"3".to_vec())),
        ]
    );
}

#[test]
fn out_of_order_add_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(table_file_name(0, 1));
    let mut builder = TableBuilder::create(&path).unwrap();
    builder.add(b"bbb", Some(b"1")).unwrap();

    let err = builder.add(b"aaa", Some(b"2")).unwrap_err();
    assert!(matches!(err, SSTableError::Internal(_)));

    let err = builder.add(b"bbb", Some(b"dup")).unwrap_err();
    assert!(matches!(err, SSTableError::Internal(_)));
}

#[test]
fn unrecognized_file_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("not-a-table.sst");
    std::fs::write(&path, b"whatever").unwrap();

    let err = SSTable::open(&path).unwrap_err();
    assert!(matches!(err, SSTableError::Corrupt(_)));
}

#[test]
fn large_values_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let big = vec![0xA5u8; 1 << 20];
    let path = build_table(tmp.path(), 0, 9, &[(b"big", Some(big.as_slice()))]);

    let table = SSTable::open(&path).unwrap();
    assert_eq!(table.get(b"big").unwrap(), TableGetResult::Value(big));
}
