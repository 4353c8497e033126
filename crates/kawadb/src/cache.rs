use std::any::Any;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Sharded, memory-bounded page cache keyed by page position.
///
/// The engine treats this as an opaque lookup/insert service; entries are
/// type-erased decoded pages. Eviction is LRU per shard with a byte budget
/// instead of an entry count, since page sizes vary by orders of
/// magnitude.
pub struct PageCache {
    shards: Vec<Mutex<Shard>>,
    shard_budget: usize,
}

struct Shard {
    entries: LruCache<u64, (Arc<dyn Any + Send + Sync>, usize)>,
    memory: usize,
}

impl PageCache {
    /// `size_mb` total budget spread over `concurrency` shards.
    pub fn new(size_mb: usize, concurrency: usize) -> Self {
        let shard_count = concurrency.max(1);
        let shard_budget = (size_mb.max(1) * 1024 * 1024) / shard_count;
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    memory: 0,
                })
            })
            .collect();
        PageCache {
            shards,
            shard_budget,
        }
    }

    fn shard(&self, pos: u64) -> &Mutex<Shard> {
        // chunk id and offset are in the high bits; fold them down so
        // neighboring pages spread over shards
        let hash = pos ^ (pos >> 21) ^ (pos >> 43);
        &self.shards[(hash as usize) % self.shards.len()]
    }

    pub fn get(&self, pos: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut shard = self.shard(pos).lock();
        shard.entries.get(&pos).map(|(page, _)| page.clone())
    }

    pub fn insert(&self, pos: u64, page: Arc<dyn Any + Send + Sync>, memory: usize) {
        let mut shard = self.shard(pos).lock();
        if let Some((_, old)) = shard.entries.push(pos, (page, memory)) {
            // push returns the displaced entry; on key collision that is
            // the old value for the same key
            shard.memory = shard.memory.saturating_sub(old.1);
        }
        shard.memory += memory;
        while shard.memory > self.shard_budget {
            let Some((_, (_, evicted))) = shard.entries.pop_lru() else {
                break;
            };
            shard.memory = shard.memory.saturating_sub(evicted);
        }
    }

    pub fn remove(&self, pos: u64) {
        let mut shard = self.shard(pos).lock();
        if let Some((_, memory)) = shard.entries.pop(&pos) {
            shard.memory = shard.memory.saturating_sub(memory);
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.memory = 0;
        }
    }

    pub fn memory_used(&self) -> usize {
        self.shards.iter().map(|s| s.lock().memory).sum()
    }
}
