use std::sync::Arc;

use crate::cache::PageCache;

fn entry(n: u64) -> Arc<dyn std::any::Any + Send + Sync> {
    Arc::new(n)
}

#[test]
fn test_get_after_insert() {
    let cache = PageCache::new(1, 1);
    cache.insert(10, entry(10), 100);
    let hit = cache.get(10).unwrap();
    assert_eq!(*hit.downcast::<u64>().unwrap(), 10);
    assert!(cache.get(11).is_none());
}

#[test]
fn test_memory_budget_evicts_lru() {
    let cache = PageCache::new(1, 1); // 1 MB budget, one shard
    cache.insert(1, entry(1), 600 * 1024);
    cache.insert(2, entry(2), 600 * 1024);
    // the first entry no longer fits
    assert!(cache.get(1).is_none());
    assert!(cache.get(2).is_some());
    assert!(cache.memory_used() <= 1024 * 1024);
}

#[test]
fn test_same_key_replacement_keeps_accounting() {
    let cache = PageCache::new(1, 1);
    cache.insert(1, entry(1), 300 * 1024);
    cache.insert(1, entry(2), 400 * 1024);
    assert_eq!(cache.memory_used(), 400 * 1024);
    cache.remove(1);
    assert_eq!(cache.memory_used(), 0);
    assert!(cache.get(1).is_none());
}

#[test]
fn test_clear() {
    let cache = PageCache::new(4, 4);
    for i in 0..64u64 {
        cache.insert(i, entry(i), 1024);
    }
    cache.clear();
    assert_eq!(cache.memory_used(), 0);
    assert!(cache.get(5).is_none());
}
