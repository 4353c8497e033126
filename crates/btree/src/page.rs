use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use storage::position::{POS_REMOVED, POS_UNSAVED, is_saved};

use crate::types::DataType;

/// Base in-memory cost of a page, before keys and values.
const PAGE_MEMORY: usize = 128;
/// In-memory cost of one child reference.
const CHILD_MEMORY: usize = 40;

/// Reference from a node to one child subtree.
///
/// `pos` alone is sufficient to re-read the child from the file; `child`
/// is the owning in-memory link and is `None` for subtrees that were never
/// loaded through this node. For unsaved pages the position inside the
/// child is authoritative, so always go through [`PageRef::position`].
pub struct PageRef<K: DataType, V: DataType> {
    pos: u64,
    /// Number of key-value pairs in the subtree.
    pub count: u64,
    pub child: Option<Arc<Page<K, V>>>,
}

impl<K: DataType, V: DataType> Clone for PageRef<K, V> {
    fn clone(&self) -> Self {
        PageRef {
            pos: self.pos,
            count: self.count,
            child: self.child.clone(),
        }
    }
}

impl<K: DataType, V: DataType> PageRef<K, V> {
    pub fn saved(pos: u64, count: u64) -> Self {
        PageRef {
            pos,
            count,
            child: None,
        }
    }

    pub fn of(page: Arc<Page<K, V>>) -> Self {
        PageRef {
            pos: page.pos(),
            count: page.total_count(),
            child: Some(page),
        }
    }

    pub fn position(&self) -> u64 {
        match &self.child {
            Some(page) => page.pos(),
            None => self.pos,
        }
    }
}

pub enum PageKind<K: DataType, V: DataType> {
    Leaf {
        values: Vec<V::Value>,
    },
    Node {
        children: Vec<PageRef<K, V>>,
        total_count: u64,
    },
}

/// A node or leaf of one B-tree, immutable once published. Any change goes
/// through the `copy_*` constructors, producing a fresh page; old pages are
/// retired through chunk accounting, never overwritten.
pub struct Page<K: DataType, V: DataType> {
    map_id: u32,
    /// Encoded position; [`POS_UNSAVED`] until written,
    /// [`POS_REMOVED`] when removed before being written.
    pos: AtomicU64,
    /// Sequential number within the chunk, assigned at write time.
    page_no: AtomicU32,
    /// Last binary search index, probed first on the next search.
    cached_index: AtomicUsize,
    memory: u32,
    pub keys: Vec<K::Value>,
    pub kind: PageKind<K, V>,
}

/// Outcome of assigning a position during write.
pub enum PosAssignment {
    Assigned,
    /// The page was concurrently marked removed; the written bytes are
    /// dead on arrival and the chunk live counters must reflect that.
    RemovedWhileWriting,
    /// The page already had a position (shared subtree written earlier).
    AlreadySaved(u64),
}

impl<K: DataType, V: DataType> Page<K, V> {
    pub fn leaf(
        map_id: u32,
        keys: Vec<K::Value>,
        values: Vec<V::Value>,
        key_type: &K,
        value_type: &V,
    ) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let mut memory = PAGE_MEMORY;
        for key in &keys {
            memory += key_type.memory(key);
        }
        for value in &values {
            memory += value_type.memory(value);
        }
        Page {
            map_id,
            pos: AtomicU64::new(POS_UNSAVED),
            page_no: AtomicU32::new(0),
            cached_index: AtomicUsize::new(usize::MAX),
            memory: memory as u32,
            keys,
            kind: PageKind::Leaf { values },
        }
    }

    pub fn empty_leaf(map_id: u32) -> Self {
        Page {
            map_id,
            pos: AtomicU64::new(POS_UNSAVED),
            page_no: AtomicU32::new(0),
            cached_index: AtomicUsize::new(usize::MAX),
            memory: PAGE_MEMORY as u32,
            keys: Vec::new(),
            kind: PageKind::Leaf { values: Vec::new() },
        }
    }

    pub fn node(
        map_id: u32,
        keys: Vec<K::Value>,
        children: Vec<PageRef<K, V>>,
        key_type: &K,
    ) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let total_count = children.iter().map(|c| c.count).sum();
        let mut memory = PAGE_MEMORY + children.len() * CHILD_MEMORY;
        for key in &keys {
            memory += key_type.memory(key);
        }
        Page {
            map_id,
            pos: AtomicU64::new(POS_UNSAVED),
            page_no: AtomicU32::new(0),
            cached_index: AtomicUsize::new(usize::MAX),
            memory: memory as u32,
            keys,
            kind: PageKind::Node {
                children,
                total_count,
            },
        }
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn is_saved(&self) -> bool {
        is_saved(self.pos())
    }

    pub fn set_pos_on_read(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn page_no(&self) -> u32 {
        self.page_no.load(Ordering::Relaxed)
    }

    pub fn set_page_no(&self, page_no: u32) {
        self.page_no.store(page_no, Ordering::Relaxed);
    }

    /// Assign the position after serializing; gated against a concurrent
    /// removed-before-written mark.
    pub fn try_assign_pos(&self, pos: u64) -> PosAssignment {
        match self
            .pos
            .compare_exchange(POS_UNSAVED, pos, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => PosAssignment::Assigned,
            Err(POS_REMOVED) => {
                self.pos.store(pos, Ordering::Release);
                PosAssignment::RemovedWhileWriting
            }
            Err(current) => PosAssignment::AlreadySaved(current),
        }
    }

    /// Mark the page removed. Returns the saved position to retire, or 0
    /// when the page never reached the file.
    pub fn mark_removed(&self) -> u64 {
        loop {
            let current = self.pos.load(Ordering::Acquire);
            if is_saved(current) {
                return current;
            }
            if current == POS_REMOVED {
                return 0;
            }
            if self
                .pos
                .compare_exchange(POS_UNSAVED, POS_REMOVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return 0;
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, PageKind::Leaf { .. })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn memory(&self) -> usize {
        self.memory as usize
    }

    /// Number of key-value pairs in the subtree rooted here.
    pub fn total_count(&self) -> u64 {
        match &self.kind {
            PageKind::Leaf { .. } => self.keys.len() as u64,
            PageKind::Node { total_count, .. } => *total_count,
        }
    }

    pub fn children(&self) -> &[PageRef<K, V>] {
        match &self.kind {
            PageKind::Node { children, .. } => children,
            PageKind::Leaf { .. } => &[],
        }
    }

    pub fn values(&self) -> &[V::Value] {
        match &self.kind {
            PageKind::Leaf { values } => values,
            PageKind::Node { .. } => &[],
        }
    }

    /// Binary search, probing the index of the previous search first;
    /// tree operations show enough locality for the probe to pay off.
    pub fn binary_search(
        &self,
        key: &K::Value,
        key_type: &K,
    ) -> std::result::Result<usize, usize> {
        use std::cmp::Ordering::*;
        let keys = &self.keys;
        let mut low = 0usize;
        let mut high = keys.len();
        let cached = self.cached_index.load(Ordering::Relaxed);
        if cached < keys.len() {
            match key_type.compare(key, &keys[cached]) {
                Equal => return Ok(cached),
                Less => high = cached,
                Greater => low = cached + 1,
            }
        }
        while low < high {
            let mid = (low + high) / 2;
            match key_type.compare(key, &keys[mid]) {
                Equal => {
                    self.cached_index.store(mid, Ordering::Relaxed);
                    return Ok(mid);
                }
                Less => high = mid,
                Greater => low = mid + 1,
            }
        }
        self.cached_index.store(low, Ordering::Relaxed);
        Err(low)
    }

    /// Child index to descend into for `key`. The key at index `i` is
    /// strictly greater than anything in child `i`, so an exact match
    /// belongs to child `i + 1`.
    pub fn child_index(&self, search: std::result::Result<usize, usize>) -> usize {
        match search {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    // Copy-on-write constructors.

    pub fn copy_leaf_insert(
        &self,
        index: usize,
        key: K::Value,
        value: V::Value,
        key_type: &K,
        value_type: &V,
    ) -> Self {
        let PageKind::Leaf { values } = &self.kind else {
            unreachable!("leaf operation on a node");
        };
        let mut keys = self.keys.clone();
        let mut new_values = values.clone();
        keys.insert(index, key);
        new_values.insert(index, value);
        Page::leaf(self.map_id, keys, new_values, key_type, value_type)
    }

    pub fn copy_leaf_set(
        &self,
        index: usize,
        value: V::Value,
        key_type: &K,
        value_type: &V,
    ) -> Self {
        let PageKind::Leaf { values } = &self.kind else {
            unreachable!("leaf operation on a node");
        };
        let mut new_values = values.clone();
        new_values[index] = value;
        Page::leaf(self.map_id, self.keys.clone(), new_values, key_type, value_type)
    }

    pub fn copy_leaf_remove(&self, index: usize, key_type: &K, value_type: &V) -> Self {
        let PageKind::Leaf { values } = &self.kind else {
            unreachable!("leaf operation on a node");
        };
        let mut keys = self.keys.clone();
        let mut new_values = values.clone();
        keys.remove(index);
        new_values.remove(index);
        Page::leaf(self.map_id, keys, new_values, key_type, value_type)
    }

    pub fn copy_replace_child(&self, index: usize, child: PageRef<K, V>, key_type: &K) -> Self {
        let PageKind::Node { children, .. } = &self.kind else {
            unreachable!("node operation on a leaf");
        };
        let mut new_children = children.clone();
        new_children[index] = child;
        Page::node(self.map_id, self.keys.clone(), new_children, key_type)
    }

    /// Replace child `index` with a split pair, inserting the promoted key.
    pub fn copy_split_child(
        &self,
        index: usize,
        promoted: K::Value,
        left: PageRef<K, V>,
        right: PageRef<K, V>,
        key_type: &K,
    ) -> Self {
        let PageKind::Node { children, .. } = &self.kind else {
            unreachable!("node operation on a leaf");
        };
        let mut keys = self.keys.clone();
        let mut new_children = children.clone();
        keys.insert(index, promoted);
        new_children[index] = left;
        new_children.insert(index + 1, right);
        Page::node(self.map_id, keys, new_children, key_type)
    }

    /// Remove child `index` together with its separating key. The caller
    /// guarantees at least three children remain before the removal.
    pub fn copy_remove_child(&self, index: usize, key_type: &K) -> Self {
        let PageKind::Node { children, .. } = &self.kind else {
            unreachable!("node operation on a leaf");
        };
        debug_assert!(children.len() > 2);
        let mut keys = self.keys.clone();
        let mut new_children = children.clone();
        new_children.remove(index);
        keys.remove(if index < keys.len() { index } else { index - 1 });
        Page::node(self.map_id, keys, new_children, key_type)
    }

    /// Split around the middle, returning the left half, the promoted key
    /// and the right half. For leaves the promoted key stays the first key
    /// of the right half; for nodes it moves up.
    pub fn split(&self, key_type: &K, value_type: &V) -> (Self, K::Value, Self) {
        let at = self.keys.len() / 2;
        match &self.kind {
            PageKind::Leaf { values } => {
                debug_assert!(self.keys.len() >= 2);
                let promoted = self.keys[at].clone();
                let left = Page::leaf(
                    self.map_id,
                    self.keys[..at].to_vec(),
                    values[..at].to_vec(),
                    key_type,
                    value_type,
                );
                let right = Page::leaf(
                    self.map_id,
                    self.keys[at..].to_vec(),
                    values[at..].to_vec(),
                    key_type,
                    value_type,
                );
                (left, promoted, right)
            }
            PageKind::Node { children, .. } => {
                debug_assert!(self.keys.len() >= 3);
                let promoted = self.keys[at].clone();
                let left = Page::node(
                    self.map_id,
                    self.keys[..at].to_vec(),
                    children[..=at].to_vec(),
                    key_type,
                );
                let right = Page::node(
                    self.map_id,
                    self.keys[at + 1..].to_vec(),
                    children[at + 1..].to_vec(),
                    key_type,
                );
                (left, promoted, right)
            }
        }
    }
}
