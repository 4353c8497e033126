mod cursor_test;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use storage::BLOCK_SIZE;
use storage::position;
use storage::{Result, StoreError};

use crate::map::{MapCommit, MvMap};
use crate::page::{Page, PageKind};
use crate::page_io::{PageSource, WriteContext};
use crate::types::DataType;

/// In-memory page source backing map unit tests: chunk payloads live in a
/// hash map, versions advance only when a test commits.
pub(crate) struct TestStore {
    chunks: Mutex<HashMap<u32, Vec<u8>>>,
    cache: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
    pub removed: Mutex<Vec<u64>>,
    pub unsaved: AtomicUsize,
    version: AtomicU64,
    next_chunk: AtomicU32,
    keys_per_page: usize,
}

impl TestStore {
    pub fn new(keys_per_page: usize) -> Arc<Self> {
        Arc::new(TestStore {
            chunks: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            unsaved: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            next_chunk: AtomicU32::new(1),
            keys_per_page,
        })
    }

    /// Serialize the map's current root into a fresh chunk and advance the
    /// version, the way a store commit would.
    pub fn commit<K: DataType, V: DataType>(&self, map: &MvMap<K, V>) -> Result<u64> {
        map.flush_append()?;
        let chunk_id = self.next_chunk.fetch_add(1, Ordering::Relaxed);
        let mut ctx = WriteContext::new(chunk_id);
        let pos = map.write_root(&mut ctx)?;
        self.chunks.lock().insert(chunk_id, ctx.buf);
        self.version.fetch_add(1, Ordering::Relaxed);
        Ok(pos)
    }

    pub fn committed_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Install a serialized chunk payload directly, for page-level tests.
    pub fn chunks_insert_for_test(&self, chunk_id: u32, buf: Vec<u8>) {
        self.chunks.lock().insert(chunk_id, buf);
    }
}

impl PageSource for TestStore {
    fn read_page_bytes(&self, pos: u64) -> Result<Bytes> {
        let chunks = self.chunks.lock();
        let chunk = chunks
            .get(&position::chunk_id(pos))
            .ok_or_else(|| StoreError::FileCorrupt(format!("unknown chunk in pos {pos:x}")))?;
        let offset = position::offset(pos) as usize - BLOCK_SIZE;
        let len =
            u32::from_be_bytes(chunk[offset..offset + 4].try_into().unwrap()) as usize;
        Ok(Bytes::copy_from_slice(&chunk[offset..offset + len]))
    }

    fn cache_get(&self, pos: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cache.lock().get(&pos).cloned()
    }

    fn cache_put(&self, pos: u64, page: Arc<dyn Any + Send + Sync>, _memory: usize) {
        self.cache.lock().insert(pos, page);
    }

    fn register_removed_page(&self, pos: u64) {
        self.removed.lock().push(pos);
    }

    fn register_unsaved_memory(&self, memory: usize) {
        self.unsaved.fetch_add(memory, Ordering::Relaxed);
    }

    fn next_write_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed) + 1
    }

    fn oldest_version_to_keep(&self) -> u64 {
        0
    }

    fn pin_version(&self, _version: u64) -> Arc<dyn Any + Send + Sync> {
        Arc::new(())
    }

    fn root_pos_at_version(&self, _map_id: u32, version: u64) -> Result<u64> {
        Err(StoreError::UnsupportedOperation(format!(
            "version {version} is not retained"
        )))
    }

    fn keys_per_page(&self) -> usize {
        self.keys_per_page
    }

    fn page_split_size(&self) -> usize {
        16 * 1024
    }
}

/// Check the structural invariants of a subtree: descendant counts add up
/// and each separator key bounds its children.
pub(crate) fn validate_subtree<K: DataType, V: DataType>(
    map: &MvMap<K, V>,
    page: &Arc<Page<K, V>>,
    key_type: &K,
) -> u64 {
    match &page.kind {
        PageKind::Leaf { values } => {
            assert_eq!(page.keys.len(), values.len());
            for pair in page.keys.windows(2) {
                assert_eq!(
                    key_type.compare(&pair[0], &pair[1]),
                    std::cmp::Ordering::Less
                );
            }
            page.keys.len() as u64
        }
        PageKind::Node {
            children,
            total_count,
        } => {
            assert_eq!(page.keys.len() + 1, children.len());
            let mut sum = 0;
            for (i, child_ref) in children.iter().enumerate() {
                let child = map.read_child(page, i).unwrap();
                let count = validate_subtree(map, &child, key_type);
                assert_eq!(count, child_ref.count, "descendant count mismatch");
                sum += count;
                // keys[i] is strictly greater than everything in child i
                // and not greater than anything in child i + 1
                if i < page.keys.len() {
                    if let Some(max) = subtree_last_key(map, &child) {
                        assert_eq!(
                            key_type.compare(&page.keys[i], &max),
                            std::cmp::Ordering::Greater
                        );
                    }
                }
                if i > 0 {
                    if let Some(min) = subtree_first_key(map, &child) {
                        assert_ne!(
                            key_type.compare(&page.keys[i - 1], &min),
                            std::cmp::Ordering::Greater
                        );
                    }
                }
            }
            assert_eq!(sum, *total_count, "node total count mismatch");
            sum
        }
    }
}

fn subtree_first_key<K: DataType, V: DataType>(
    map: &MvMap<K, V>,
    page: &Arc<Page<K, V>>,
) -> Option<K::Value> {
    let mut page = page.clone();
    while !page.is_leaf() {
        page = map.read_child(&page, 0).unwrap();
    }
    page.keys.first().cloned()
}

fn subtree_last_key<K: DataType, V: DataType>(
    map: &MvMap<K, V>,
    page: &Arc<Page<K, V>>,
) -> Option<K::Value> {
    let mut page = page.clone();
    while !page.is_leaf() {
        let last = page.children().len() - 1;
        page = map.read_child(&page, last).unwrap();
    }
    page.keys.last().cloned()
}

pub(crate) fn validate_map<K: DataType, V: DataType>(map: &MvMap<K, V>) {
    let root = map.root_page_for_test();
    let count = validate_subtree(map, &root, map.key_type());
    assert_eq!(count, root.total_count());
}
