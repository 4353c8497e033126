use tempfile::TempDir;

use btree::types::{StringType, U64Type};
use storage::StoreError;

use crate::config::StoreConfig;
use crate::store::Store;

fn memory_config() -> StoreConfig {
    StoreConfig::new().auto_commit_delay(0)
}

#[test]
fn test_in_memory_store_basics() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", StringType, StringType).unwrap();
    map.put("k".into(), "v".into()).unwrap();
    let version = store.commit().unwrap();
    assert_eq!(version, 1);
    assert_eq!(store.version(), 1);
    assert_eq!(map.get(&"k".into()).unwrap(), Some("v".into()));
    store.close().unwrap();
}

#[test]
fn test_commit_without_changes_keeps_version() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    map.put(1, "a".into()).unwrap();
    let v1 = store.commit().unwrap();
    let v2 = store.commit().unwrap();
    assert_eq!(v1, v2, "a commit without changes is a no-op");
}

#[test]
fn test_map_reuse_returns_same_map() {
    let store = Store::open(memory_config()).unwrap();
    let first = store.open_map("m", U64Type, StringType).unwrap();
    first.put(1, "a".into()).unwrap();
    let second = store.open_map("m", U64Type, StringType).unwrap();
    assert_eq!(second.get(&1).unwrap(), Some("a".into()));
    assert_eq!(first.id(), second.id());
}

#[test]
fn test_map_type_mismatch_is_rejected() {
    let store = Store::open(memory_config()).unwrap();
    let _map = store.open_map("m", U64Type, StringType).unwrap();
    let wrong = store.open_map("m", StringType, StringType);
    assert!(matches!(
        wrong,
        Err(StoreError::UnsupportedOperation(_))
    ));
}

#[test]
fn test_map_type_mismatch_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let store = Store::open(memory_config().file_name(&path)).unwrap();
        let map = store.open_map("m", U64Type, U64Type).unwrap();
        map.put(1, 2).unwrap();
        store.close().unwrap();
    }
    let store = Store::open(memory_config().file_name(&path)).unwrap();
    let wrong = store.open_map("m", U64Type, StringType);
    assert!(matches!(
        wrong,
        Err(StoreError::UnsupportedOperation(_))
    ));
    // the recorded types still work
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(2));
}

#[test]
fn test_map_names_and_remove_map() {
    let store = Store::open(memory_config()).unwrap();
    let a = store.open_map("alpha", U64Type, StringType).unwrap();
    let _b = store.open_map("beta", U64Type, StringType).unwrap();
    a.put(1, "x".into()).unwrap();
    store.commit().unwrap();

    let mut names = store.map_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

    store.remove_map("alpha").unwrap();
    let names = store.map_names().unwrap();
    assert_eq!(names, vec!["beta".to_string()]);
    // the removed map's handle is closed
    assert!(matches!(a.get(&1), Err(StoreError::Closed)));
}

#[test]
fn test_store_version_setting() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let store = Store::open(memory_config().file_name(&path)).unwrap();
        assert_eq!(store.store_version().unwrap(), None);
        store.set_store_version(42).unwrap();
        store.close().unwrap();
    }
    let store = Store::open(memory_config().file_name(&path)).unwrap();
    assert_eq!(store.store_version().unwrap(), Some(42));
}

#[test]
fn test_rollback_to_current_version_is_noop() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    map.put(1, "a".into()).unwrap();
    let v1 = store.commit().unwrap();
    store.rollback_to(v1).unwrap();
    assert_eq!(store.version(), v1);
    assert_eq!(map.get(&1).unwrap(), Some("a".into()));
}

#[test]
fn test_rollback_discards_uncommitted_changes() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    map.put(1, "a".into()).unwrap();
    let v1 = store.commit().unwrap();
    map.put(1, "b".into()).unwrap();
    map.put(2, "c".into()).unwrap();
    store.rollback_to(v1).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("a".into()));
    assert_eq!(map.get(&2).unwrap(), None);
}

#[test]
fn test_rollback_to_committed_version() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    for i in 0..50u64 {
        map.put(i, format!("v{i}")).unwrap();
    }
    let v1 = store.commit().unwrap();
    for i in 0..50u64 {
        map.put(i, "overwritten".into()).unwrap();
    }
    map.put(99, "new".into()).unwrap();
    let v2 = store.commit().unwrap();
    assert!(v2 > v1);

    store.rollback_to(v1).unwrap();
    assert_eq!(store.version(), v1);
    for i in 0..50u64 {
        assert_eq!(map.get(&i).unwrap(), Some(format!("v{i}")));
    }
    assert_eq!(map.get(&99).unwrap(), None);
    // maps created after the rollback target are closed
    let store2 = Store::open(memory_config()).unwrap();
    let before = store2.commit().unwrap();
    let extra = store2.open_map("late", U64Type, StringType).unwrap();
    extra.put(1, "x".into()).unwrap();
    store2.commit().unwrap();
    store2.rollback_to(before).unwrap();
    assert!(matches!(extra.get(&1), Err(StoreError::Closed)));
}

#[test]
fn test_rollback_to_future_version_fails() {
    let store = Store::open(memory_config()).unwrap();
    assert!(matches!(
        store.rollback_to(5),
        Err(StoreError::IllegalArgument(_))
    ));
}

#[test]
fn test_read_only_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let store = Store::open(memory_config().file_name(&path)).unwrap();
        let map = store.open_map("m", U64Type, StringType).unwrap();
        map.put(1, "a".into()).unwrap();
        store.close().unwrap();
    }
    let store = Store::open(memory_config().file_name(&path).read_only(true)).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("a".into()));
    assert!(map.put(2, "b".into()).is_err());
    assert!(store.commit().is_err());
    // a map that does not exist cannot be created read-only
    assert!(store.open_map("other", U64Type, StringType).is_err());
}

#[test]
fn test_closed_store_rejects_operations() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    store.close().unwrap();
    assert!(matches!(
        store.open_map("n", U64Type, StringType),
        Err(StoreError::Closed)
    ));
    assert!(matches!(map.get(&1), Err(StoreError::Closed)));
}

#[test]
fn test_chunk_ids_advance_per_commit() {
    let store = Store::open(memory_config()).unwrap();
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    for round in 0..30u64 {
        map.put(round, round).unwrap();
        store.commit().unwrap();
    }
    assert_eq!(store.version(), 30);
}

#[test]
fn test_oldest_version_tracks_retention_window() {
    let store = Store::open(memory_config().versions_to_keep(3)).unwrap();
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    for i in 0..10u64 {
        map.put(i, i).unwrap();
        store.commit().unwrap();
    }
    assert_eq!(store.version(), 10);
    assert_eq!(store.oldest_version_to_keep(), 8);
    // an open snapshot pins the window
    let snapshot = map.open_version(8).unwrap();
    for i in 10..15u64 {
        map.put(i, i).unwrap();
        store.commit().unwrap();
    }
    assert_eq!(store.oldest_version_to_keep(), 8);
    drop(snapshot);
    assert_eq!(store.oldest_version_to_keep(), 13);
}
