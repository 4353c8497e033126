use crate::map::MvMap;
use crate::types::{StringType, U64Type};

use super::TestStore;

fn filled_map(keys_per_page: usize, n: u64) -> MvMap<U64Type, StringType> {
    let store = TestStore::new(keys_per_page);
    let map = MvMap::open(store, 2, "m", U64Type, StringType, 0, false, true).unwrap();
    for i in 0..n {
        map.put(i, format!("v{i}")).unwrap();
    }
    map
}

#[test]
fn test_empty_map_cursor() {
    let map = filled_map(4, 0);
    let mut cursor = map.cursor(None).unwrap();
    assert!(!cursor.has_next().unwrap());
    assert_eq!(cursor.next_entry().unwrap(), None);
}

#[test]
fn test_full_scan_in_order() {
    let map = filled_map(4, 1000);
    let mut cursor = map.cursor(None).unwrap();
    for i in 0..1000u64 {
        assert!(cursor.has_next().unwrap());
        let (key, value) = cursor.next_entry().unwrap().unwrap();
        assert_eq!(key, i);
        assert_eq!(value, format!("v{i}"));
    }
    assert!(!cursor.has_next().unwrap());
}

#[test]
fn test_scan_from_bound() {
    let map = filled_map(4, 100);
    // from an existing key
    let mut cursor = map.cursor(Some(&40)).unwrap();
    assert_eq!(cursor.next_entry().unwrap().unwrap().0, 40);
    // from a missing key: starts at the next larger one
    let map2 = {
        let store = TestStore::new(4);
        let map2: MvMap<U64Type, StringType> =
            MvMap::open(store, 2, "m", U64Type, StringType, 0, false, true).unwrap();
        for i in 0..50u64 {
            map2.put(i * 2, String::new()).unwrap();
        }
        map2
    };
    let mut cursor = map2.cursor(Some(&41)).unwrap();
    assert_eq!(cursor.next_entry().unwrap().unwrap().0, 42);
    // past the end
    let mut cursor = map.cursor(Some(&1000)).unwrap();
    assert!(!cursor.has_next().unwrap());
}

#[test]
fn test_cursor_ignores_later_inserts() {
    let map = filled_map(4, 100);
    let mut cursor = map.cursor(None).unwrap();
    // concurrent growth is invisible to the running cursor
    for i in 100..200u64 {
        map.put(i, String::new()).unwrap();
    }
    let keys: Vec<u64> = cursor
        .by_ref()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, (0..100u64).collect::<Vec<_>>());
}

#[test]
fn test_cursor_as_iterator() {
    let map = filled_map(4, 10);
    let sum: u64 = map
        .cursor(None)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .sum();
    assert_eq!(sum, 45);
}
