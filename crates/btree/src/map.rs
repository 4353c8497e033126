use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use storage::position;
use storage::{Result, StoreError};

use crate::cursor::Cursor;
use crate::decision::{
    Decision, DecisionMaker, EqualsDecision, IfAbsentDecision, IfPresentDecision, PutDecision,
    RemoveDecision,
};
use crate::page::{Page, PageRef};
use crate::page_io::{self, PageSource, WriteContext};
use crate::root::{RootHolder, RootReference};
use crate::types::DataType;

/// Failed update attempts before a writer switches to the locked path.
const LOCK_AFTER_ATTEMPTS: u32 = 2;
/// Further attempts before a contending writer yields the CPU.
const YIELD_AFTER_ATTEMPTS: u32 = 4;
/// Further attempts before a contending writer sleeps.
const SLEEP_AFTER_ATTEMPTS: u32 = 24;

/// An ordered key-value map backed by one copy-on-write B-tree.
///
/// All shared state lives behind an `Arc`, so clones are handles onto the
/// same map. Writers coordinate through compare-and-swap on the root
/// reference; readers never block.
pub struct MvMap<K: DataType, V: DataType> {
    inner: Arc<MapInner<K, V>>,
}

impl<K: DataType, V: DataType> Clone for MvMap<K, V> {
    fn clone(&self) -> Self {
        MvMap {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct MapInner<K: DataType, V: DataType> {
    pub id: u32,
    pub name: String,
    pub key_type: K,
    pub value_type: V,
    pub store: Arc<dyn PageSource>,
    pub root: RootHolder<K, V>,
    pub keys_per_page: usize,
    pub page_split_size: usize,
    /// Enables the append-buffer fast path; the caller guarantees a single
    /// writer.
    pub single_writer: bool,
    pub writable: bool,
    /// `Some(v)` for read-only snapshots opened at version `v`.
    pub snapshot_version: Option<u64>,
    /// Keeps the snapshot version retained while this map is alive.
    _version_guard: Option<Arc<dyn Any + Send + Sync>>,
    closed: AtomicBool,
}

enum TryOutcome<K: DataType, V: DataType> {
    Aborted {
        existing: Option<V::Value>,
        repeat: bool,
    },
    Updated {
        new_root: Arc<Page<K, V>>,
        existing: Option<V::Value>,
        /// Pages replaced by the update. They are marked removed only
        /// after the new root is published; marking them earlier would
        /// poison the live tree when the publication loses the race.
        old_pages: Vec<Arc<Page<K, V>>>,
        added_memory: usize,
    },
}

impl<K: DataType, V: DataType> MvMap<K, V> {
    /// Open a map over the page at `root_pos`; position 0 starts empty.
    pub fn open(
        store: Arc<dyn PageSource>,
        id: u32,
        name: &str,
        key_type: K,
        value_type: V,
        root_pos: u64,
        single_writer: bool,
        writable: bool,
    ) -> Result<MvMap<K, V>> {
        let root_page = if position::is_saved(root_pos) {
            page_io::read_page(store.as_ref(), root_pos, id, &key_type, &value_type)?
        } else {
            Arc::new(Page::empty_leaf(id))
        };
        let version = store.next_write_version().saturating_sub(1);
        let keys_per_page = store.keys_per_page();
        let page_split_size = store.page_split_size();
        Ok(MvMap {
            inner: Arc::new(MapInner {
                id,
                name: name.to_string(),
                key_type,
                value_type,
                store,
                root: RootHolder::new(RootReference::new(root_page, version)),
                keys_per_page,
                page_split_size,
                single_writer,
                writable,
                snapshot_version: None,
                _version_guard: None,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn key_type(&self) -> &K {
        &self.inner.key_type
    }

    #[cfg(test)]
    pub(crate) fn root_page_for_test(&self) -> Arc<Page<K, V>> {
        self.inner.root.get().root.clone()
    }

    pub fn is_read_only(&self) -> bool {
        !self.inner.writable
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.inner.writable {
            return Err(StoreError::UnsupportedOperation(format!(
                "map {:?} is read-only",
                self.inner.name
            )));
        }
        Ok(())
    }

    // Reads.

    pub fn get(&self, key: &K::Value) -> Result<Option<V::Value>> {
        self.check_open()?;
        let root_ref = self.flushed_root()?;
        let mut page = root_ref.root.clone();
        loop {
            let search = page.binary_search(key, &self.inner.key_type);
            if page.is_leaf() {
                return Ok(search.ok().map(|i| page.values()[i].clone()));
            }
            let index = page.child_index(search);
            page = self.read_child(&page, index)?;
        }
    }

    pub fn contains_key(&self, key: &K::Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn size_as_long(&self) -> u64 {
        let root_ref = self.inner.root.get();
        root_ref.root.total_count() + root_ref.append_buffer.len() as u64
    }

    pub fn len(&self) -> usize {
        self.size_as_long() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size_as_long() == 0
    }

    pub fn first_key(&self) -> Result<Option<K::Value>> {
        self.bound_key(None, true, false)
    }

    pub fn last_key(&self) -> Result<Option<K::Value>> {
        self.bound_key(None, false, false)
    }

    /// Smallest key strictly greater than `key`.
    pub fn higher_key(&self, key: &K::Value) -> Result<Option<K::Value>> {
        self.bound_key(Some(key), true, false)
    }

    /// Smallest key greater than or equal to `key`.
    pub fn ceiling_key(&self, key: &K::Value) -> Result<Option<K::Value>> {
        self.bound_key(Some(key), true, true)
    }

    /// Largest key strictly smaller than `key`.
    pub fn lower_key(&self, key: &K::Value) -> Result<Option<K::Value>> {
        self.bound_key(Some(key), false, false)
    }

    /// Largest key smaller than or equal to `key`.
    pub fn floor_key(&self, key: &K::Value) -> Result<Option<K::Value>> {
        self.bound_key(Some(key), false, true)
    }

    /// The key at `index` in key order, by rank descent over the
    /// descendant counts.
    pub fn key_at(&self, index: u64) -> Result<Option<K::Value>> {
        self.check_open()?;
        let root_ref = self.flushed_root()?;
        let mut page = root_ref.root.clone();
        if index >= page.total_count() {
            return Ok(None);
        }
        let mut remaining = index;
        loop {
            if page.is_leaf() {
                return Ok(Some(page.keys[remaining as usize].clone()));
            }
            let mut next = None;
            for (i, child) in page.children().iter().enumerate() {
                if remaining < child.count {
                    next = Some(i);
                    break;
                }
                remaining -= child.count;
            }
            let Some(i) = next else {
                return Err(StoreError::Internal(
                    "descendant counts do not cover the index".into(),
                ));
            };
            page = self.read_child(&page, i)?;
        }
    }

    /// Rank of `key`. A missing key yields `-(insertion rank) - 1`, the
    /// same encoding a binary search uses.
    pub fn index_of_key(&self, key: &K::Value) -> Result<i64> {
        self.check_open()?;
        let root_ref = self.flushed_root()?;
        let mut page = root_ref.root.clone();
        let mut rank = 0i64;
        loop {
            let search = page.binary_search(key, &self.inner.key_type);
            if page.is_leaf() {
                return Ok(match search {
                    Ok(i) => rank + i as i64,
                    Err(i) => -(rank + i as i64) - 1,
                });
            }
            let index = page.child_index(search);
            for child in &page.children()[..index] {
                rank += child.count as i64;
            }
            page = self.read_child(&page, index)?;
        }
    }

    pub fn cursor(&self, from: Option<&K::Value>) -> Result<Cursor<K, V>> {
        self.check_open()?;
        let root_ref = self.flushed_root()?;
        Cursor::new(self.clone(), root_ref.root.clone(), from)
    }

    // Writes.

    pub fn put(&self, key: K::Value, value: V::Value) -> Result<Option<V::Value>> {
        self.operate(&key, Some(&value), &mut PutDecision)
    }

    /// Put unless a value exists; returns the existing value if any.
    pub fn put_if_absent(&self, key: K::Value, value: V::Value) -> Result<Option<V::Value>> {
        self.operate(&key, Some(&value), &mut IfAbsentDecision)
    }

    /// Replace an existing value, a no-op when the key is absent.
    pub fn replace(&self, key: K::Value, value: V::Value) -> Result<Option<V::Value>> {
        self.operate(&key, Some(&value), &mut IfPresentDecision)
    }

    /// Compare-and-set: store `new` iff the current value equals `old`.
    pub fn replace_if_equals(
        &self,
        key: K::Value,
        old: V::Value,
        new: V::Value,
    ) -> Result<bool> {
        let mut decision = EqualsDecision::new(self.inner.value_type.clone(), old);
        self.operate(&key, Some(&new), &mut decision)?;
        Ok(decision.matched())
    }

    pub fn remove(&self, key: &K::Value) -> Result<Option<V::Value>> {
        self.operate(key, None, &mut RemoveDecision)
    }

    /// Remove iff the current value equals `expected`.
    pub fn remove_if_equals(&self, key: &K::Value, expected: V::Value) -> Result<bool> {
        let mut decision = EqualsDecision::new(self.inner.value_type.clone(), expected);
        self.operate(key, None, &mut decision)?;
        Ok(decision.matched())
    }

    /// Remove all entries, retiring the old tree.
    pub fn clear(&self) -> Result<()> {
        self.check_writable()?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let root_ref = self.inner.root.get();
            if root_ref.locked {
                Self::backoff(attempt);
                continue;
            }
            let new_root = Arc::new(Page::empty_leaf(self.inner.id));
            let version = self.inner.store.next_write_version();
            let new_ref = RootReference::next(&root_ref, new_root, version, false, 1);
            if self.inner.root.compare_and_set(&root_ref, new_ref) {
                self.retire_subtree(&root_ref.root)?;
                return Ok(());
            }
            Self::backoff(attempt);
        }
    }

    /// The decision-driven update. Traverses to the target leaf, asks the
    /// decision maker what to do, rebuilds the path copy-on-write and
    /// publishes the new root by compare-and-swap, retrying under
    /// contention with a lock/yield/sleep ladder.
    pub fn operate(
        &self,
        key: &K::Value,
        candidate: Option<&V::Value>,
        decision_maker: &mut dyn DecisionMaker<V::Value>,
    ) -> Result<Option<V::Value>> {
        self.check_writable()?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let holding_lock = attempt > LOCK_AFTER_ATTEMPTS;
            let root_ref = if holding_lock {
                self.lock_root()?
            } else {
                let root_ref = self.flushed_root()?;
                if root_ref.locked {
                    Self::backoff(attempt);
                    continue;
                }
                root_ref
            };

            let outcome = self.try_update(&root_ref, key, candidate, decision_maker);
            match outcome {
                Err(e) => {
                    if holding_lock {
                        self.unlock_root();
                    }
                    return Err(e);
                }
                Ok(TryOutcome::Aborted { existing, repeat }) => {
                    if holding_lock {
                        self.unlock_root();
                    }
                    if repeat {
                        decision_maker.reset();
                        continue;
                    }
                    // an abort only binds if the root is still the one the
                    // decision was made against
                    if !holding_lock && !Arc::ptr_eq(&self.inner.root.get(), &root_ref) {
                        decision_maker.reset();
                        continue;
                    }
                    return Ok(existing);
                }
                Ok(TryOutcome::Updated {
                    new_root,
                    existing,
                    old_pages,
                    added_memory,
                }) => {
                    let version = self.inner.store.next_write_version();
                    let new_ref =
                        RootReference::next(&root_ref, new_root, version, false, attempt as u64);
                    let published = if holding_lock {
                        self.inner.root.set(new_ref);
                        true
                    } else {
                        self.inner.root.compare_and_set(&root_ref, new_ref)
                    };
                    if !published {
                        decision_maker.reset();
                        Self::backoff(attempt);
                        continue;
                    }
                    self.retire_pages(old_pages);
                    self.inner.store.register_unsaved_memory(added_memory);
                    return Ok(existing);
                }
            }
        }
    }

    fn try_update(
        &self,
        root_ref: &Arc<RootReference<K, V>>,
        key: &K::Value,
        candidate: Option<&V::Value>,
        decision_maker: &mut dyn DecisionMaker<V::Value>,
    ) -> Result<TryOutcome<K, V>> {
        let key_type = &self.inner.key_type;
        let value_type = &self.inner.value_type;

        let mut path: Vec<(Arc<Page<K, V>>, usize)> = Vec::new();
        let mut page = root_ref.root.clone();
        while !page.is_leaf() {
            let index = page.child_index(page.binary_search(key, key_type));
            let child = self.read_child(&page, index)?;
            path.push((page, index));
            page = child;
        }
        let leaf = page;
        let search = leaf.binary_search(key, key_type);
        let existing = search.ok().map(|i| leaf.values()[i].clone());

        match decision_maker.decide(existing.as_ref(), candidate) {
            Decision::Abort => Ok(TryOutcome::Aborted {
                existing,
                repeat: false,
            }),
            Decision::Repeat => Ok(TryOutcome::Aborted {
                existing,
                repeat: true,
            }),
            Decision::Remove => {
                let Ok(index) = search else {
                    return Ok(TryOutcome::Aborted {
                        existing: None,
                        repeat: false,
                    });
                };
                self.remove_from_leaf(path, leaf, index)
            }
            Decision::Put => {
                let value = decision_maker
                    .select_value(existing.as_ref(), candidate)
                    .ok_or_else(|| {
                        StoreError::Internal("decision maker selected no value for put".into())
                    })?;
                let mut old_pages = Vec::new();
                let mut added_memory = 0usize;
                let new_leaf = match search {
                    Ok(i) => leaf.copy_leaf_set(i, value, key_type, value_type),
                    Err(i) => {
                        leaf.copy_leaf_insert(i, key.clone(), value, key_type, value_type)
                    }
                };
                old_pages.push(leaf);
                added_memory += new_leaf.memory();
                let new_root = self.rebuild_path(
                    path,
                    Arc::new(new_leaf),
                    &mut old_pages,
                    &mut added_memory,
                )?;
                Ok(TryOutcome::Updated {
                    new_root,
                    existing,
                    old_pages,
                    added_memory,
                })
            }
        }
    }

    fn remove_from_leaf(
        &self,
        mut path: Vec<(Arc<Page<K, V>>, usize)>,
        leaf: Arc<Page<K, V>>,
        index: usize,
    ) -> Result<TryOutcome<K, V>> {
        let key_type = &self.inner.key_type;
        let value_type = &self.inner.value_type;
        let existing = Some(leaf.values()[index].clone());
        let mut old_pages = Vec::new();
        let mut added_memory = 0usize;

        let new_root = if leaf.key_count() == 1 && !path.is_empty() {
            // the leaf empties out: drop its reference instead of keeping
            // an empty page in the tree
            old_pages.push(leaf);
            let (parent, parent_index) = path.pop().expect("path is not empty");
            if parent.children().len() == 2 {
                // one sibling left: substitute it for the parent,
                // collapsing one level
                let sibling = parent.children()[1 - parent_index].clone();
                old_pages.push(parent);
                match path.pop() {
                    None => match &sibling.child {
                        Some(page) => page.clone(),
                        None => page_io::read_page(
                            self.inner.store.as_ref(),
                            sibling.position(),
                            self.inner.id,
                            key_type,
                            value_type,
                        )?,
                    },
                    Some((grandparent, grandparent_index)) => {
                        let replaced = grandparent.copy_replace_child(
                            grandparent_index,
                            sibling,
                            key_type,
                        );
                        old_pages.push(grandparent);
                        added_memory += replaced.memory();
                        self.rebuild_path(
                            path,
                            Arc::new(replaced),
                            &mut old_pages,
                            &mut added_memory,
                        )?
                    }
                }
            } else {
                let new_parent = parent.copy_remove_child(parent_index, key_type);
                old_pages.push(parent);
                added_memory += new_parent.memory();
                self.rebuild_path(path, Arc::new(new_parent), &mut old_pages, &mut added_memory)?
            }
        } else {
            let new_leaf = leaf.copy_leaf_remove(index, key_type, value_type);
            old_pages.push(leaf);
            added_memory += new_leaf.memory();
            self.rebuild_path(path, Arc::new(new_leaf), &mut old_pages, &mut added_memory)?
        };
        Ok(TryOutcome::Updated {
            new_root,
            existing,
            old_pages,
            added_memory,
        })
    }

    /// Substitute `carry` for the traversed child in each ancestor, bottom
    /// up, splitting pages that outgrew their limits on the way.
    fn rebuild_path(
        &self,
        path: Vec<(Arc<Page<K, V>>, usize)>,
        new_child: Arc<Page<K, V>>,
        old_pages: &mut Vec<Arc<Page<K, V>>>,
        added_memory: &mut usize,
    ) -> Result<Arc<Page<K, V>>> {
        let key_type = &self.inner.key_type;
        let value_type = &self.inner.value_type;
        let mut carry = new_child;
        for (parent, index) in path.into_iter().rev() {
            let replaced = if self.needs_split(&carry) {
                let (left, promoted, right) = carry.split(key_type, value_type);
                *added_memory += left.memory() + right.memory();
                parent.copy_split_child(
                    index,
                    promoted,
                    PageRef::of(Arc::new(left)),
                    PageRef::of(Arc::new(right)),
                    key_type,
                )
            } else {
                parent.copy_replace_child(index, PageRef::of(carry), key_type)
            };
            old_pages.push(parent);
            *added_memory += replaced.memory();
            carry = Arc::new(replaced);
        }
        if self.needs_split(&carry) {
            let (left, promoted, right) = carry.split(key_type, value_type);
            *added_memory += left.memory() + right.memory();
            let root = Page::node(
                self.inner.id,
                vec![promoted],
                vec![PageRef::of(Arc::new(left)), PageRef::of(Arc::new(right))],
                key_type,
            );
            *added_memory += root.memory();
            carry = Arc::new(root);
        }
        Ok(carry)
    }

    fn needs_split(&self, page: &Arc<Page<K, V>>) -> bool {
        let splittable = if page.is_leaf() {
            page.key_count() >= 2
        } else {
            page.key_count() >= 3
        };
        splittable
            && (page.key_count() > self.inner.keys_per_page
                || page.memory() > self.inner.page_split_size)
    }

    fn backoff(attempt: u32) {
        if attempt > SLEEP_AFTER_ATTEMPTS {
            let millis = ((attempt - SLEEP_AFTER_ATTEMPTS) as u64).min(10);
            std::thread::sleep(Duration::from_millis(millis));
        } else if attempt > YIELD_AFTER_ATTEMPTS {
            std::thread::yield_now();
        }
    }

    /// Take the exclusive update path: publish a lock-flagged copy of the
    /// root reference so contending writers wait instead of spinning.
    fn lock_root(&self) -> Result<Arc<RootReference<K, V>>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let root_ref = self.flushed_root()?;
            if !root_ref.locked
                && self
                    .inner
                    .root
                    .compare_and_set(&root_ref, root_ref.locked_copy())
            {
                return Ok(self.inner.root.get());
            }
            Self::backoff(attempt + YIELD_AFTER_ATTEMPTS);
        }
    }

    /// Mark replaced pages removed once the new root is live, retiring
    /// saved positions through the store accounting.
    fn retire_pages(&self, old_pages: Vec<Arc<Page<K, V>>>) {
        for page in old_pages {
            let pos = page.mark_removed();
            if pos != 0 {
                self.inner.store.register_removed_page(pos);
            }
        }
    }

    fn unlock_root(&self) {
        let root_ref = self.inner.root.get();
        debug_assert!(root_ref.locked);
        self.inner.root.set(root_ref.unlocked_copy());
    }

    pub(crate) fn read_child(
        &self,
        page: &Arc<Page<K, V>>,
        index: usize,
    ) -> Result<Arc<Page<K, V>>> {
        let child_ref = &page.children()[index];
        match &child_ref.child {
            Some(child) => Ok(child.clone()),
            None => page_io::read_page(
                self.inner.store.as_ref(),
                child_ref.position(),
                self.inner.id,
                &self.inner.key_type,
                &self.inner.value_type,
            ),
        }
    }

    fn bound_key(
        &self,
        key: Option<&K::Value>,
        forward: bool,
        inclusive: bool,
    ) -> Result<Option<K::Value>> {
        self.check_open()?;
        let root_ref = self.flushed_root()?;
        self.bound_in_page(&root_ref.root, key, forward, inclusive)
    }

    fn bound_in_page(
        &self,
        page: &Arc<Page<K, V>>,
        key: Option<&K::Value>,
        forward: bool,
        inclusive: bool,
    ) -> Result<Option<K::Value>> {
        let key_type = &self.inner.key_type;
        if page.is_leaf() {
            let len = page.key_count() as i64;
            if len == 0 {
                return Ok(None);
            }
            let index: i64 = match key {
                None => {
                    if forward {
                        0
                    } else {
                        len - 1
                    }
                }
                Some(k) => match page.binary_search(k, key_type) {
                    Ok(i) => {
                        let i = i as i64;
                        if inclusive {
                            i
                        } else if forward {
                            i + 1
                        } else {
                            i - 1
                        }
                    }
                    Err(i) => {
                        if forward {
                            i as i64
                        } else {
                            i as i64 - 1
                        }
                    }
                },
            };
            if index < 0 || index >= len {
                return Ok(None);
            }
            return Ok(Some(page.keys[index as usize].clone()));
        }

        let child_count = page.children().len();
        let start = match key {
            None => {
                if forward {
                    0
                } else {
                    child_count - 1
                }
            }
            Some(k) => page.child_index(page.binary_search(k, key_type)),
        };
        if forward {
            for i in start..child_count {
                let child = self.read_child(page, i)?;
                // the bound only constrains the subtree the key falls into
                let bound = if i == start { key } else { None };
                if let Some(found) = self.bound_in_page(&child, bound, forward, inclusive)? {
                    return Ok(Some(found));
                }
            }
        } else {
            for i in (0..=start).rev() {
                let child = self.read_child(page, i)?;
                let bound = if i == start { key } else { None };
                if let Some(found) = self.bound_in_page(&child, bound, forward, inclusive)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    // Append mode.

    /// Single-writer fast path: buffer an entry that sorts after the
    /// largest key. The buffer is flushed as ordinary tree inserts when it
    /// reaches `keys_per_page` entries, or when a reader needs a
    /// consistent tree.
    pub fn append(&self, key: K::Value, value: V::Value) -> Result<()> {
        self.check_writable()?;
        if !self.inner.single_writer {
            return Err(StoreError::UnsupportedOperation(
                "append requires a single-writer map".into(),
            ));
        }
        let key_type = &self.inner.key_type;
        loop {
            let root_ref = self.inner.root.get();
            if root_ref.locked {
                Self::backoff(SLEEP_AFTER_ATTEMPTS + 1);
                continue;
            }
            let last = match root_ref.append_buffer.last() {
                Some((k, _)) => Some(k.clone()),
                None => self.last_key_in_tree(&root_ref.root)?,
            };
            if let Some(last) = last {
                if key_type.compare(&key, &last) != std::cmp::Ordering::Greater {
                    return Err(StoreError::IllegalArgument(format!(
                        "append key does not sort after the existing keys in map {:?}",
                        self.inner.name
                    )));
                }
            }
            let mut buffer = root_ref.append_buffer.clone();
            buffer.push((key.clone(), value.clone()));
            let full = buffer.len() >= self.inner.keys_per_page;
            let new_ref = root_ref.with_append_buffer(buffer, 1);
            if self.inner.root.compare_and_set(&root_ref, new_ref) {
                if full {
                    self.flushed_root()?;
                }
                return Ok(());
            }
        }
    }

    fn last_key_in_tree(&self, root: &Arc<Page<K, V>>) -> Result<Option<K::Value>> {
        let mut page = root.clone();
        loop {
            if page.is_leaf() {
                return Ok(page.keys.last().cloned());
            }
            let index = page.children().len() - 1;
            page = self.read_child(&page, index)?;
        }
    }

    /// Current root reference with the append buffer folded into the tree.
    /// Readers that need a consistent tree flush on behalf of the writer.
    pub(crate) fn flushed_root(&self) -> Result<Arc<RootReference<K, V>>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let root_ref = self.inner.root.get();
            if root_ref.append_buffer.is_empty() {
                return Ok(root_ref);
            }
            if root_ref.locked {
                Self::backoff(attempt);
                continue;
            }
            let mut old_pages = Vec::new();
            let mut added_memory = 0usize;
            let mut root = root_ref.root.clone();
            for (key, value) in &root_ref.append_buffer {
                root = self.insert_for_flush(
                    root,
                    key.clone(),
                    value.clone(),
                    &mut old_pages,
                    &mut added_memory,
                )?;
            }
            let version = self.inner.store.next_write_version();
            let new_ref = RootReference::next(&root_ref, root, version, false, attempt as u64);
            if self.inner.root.compare_and_set(&root_ref, new_ref) {
                self.retire_pages(old_pages);
                self.inner.store.register_unsaved_memory(added_memory);
                return Ok(self.inner.root.get());
            }
            Self::backoff(attempt);
        }
    }

    /// One insert without publication, used to drain the append buffer.
    fn insert_for_flush(
        &self,
        root: Arc<Page<K, V>>,
        key: K::Value,
        value: V::Value,
        old_pages: &mut Vec<Arc<Page<K, V>>>,
        added_memory: &mut usize,
    ) -> Result<Arc<Page<K, V>>> {
        let key_type = &self.inner.key_type;
        let value_type = &self.inner.value_type;
        let mut path = Vec::new();
        let mut page = root;
        while !page.is_leaf() {
            let index = page.child_index(page.binary_search(&key, key_type));
            let child = self.read_child(&page, index)?;
            path.push((page, index));
            page = child;
        }
        let leaf = page;
        let new_leaf = match leaf.binary_search(&key, key_type) {
            Ok(i) => leaf.copy_leaf_set(i, value, key_type, value_type),
            Err(i) => leaf.copy_leaf_insert(i, key, value, key_type, value_type),
        };
        old_pages.push(leaf);
        *added_memory += new_leaf.memory();
        self.rebuild_path(path, Arc::new(new_leaf), old_pages, added_memory)
    }

    // Versions.

    /// Read-only view of the map at `version`. Served from the in-memory
    /// retention chain when possible, otherwise reconstructed from the
    /// persisted root position at that version.
    pub fn open_version(&self, version: u64) -> Result<MvMap<K, V>> {
        self.check_open()?;
        let guard = self.inner.store.pin_version(version);
        let root_ref = self.flushed_root()?;
        let root_page = match root_ref.at_version(version) {
            Some(reference) => reference.root.clone(),
            None => {
                let pos = self
                    .inner
                    .store
                    .root_pos_at_version(self.inner.id, version)?;
                if position::is_saved(pos) {
                    page_io::read_page(
                        self.inner.store.as_ref(),
                        pos,
                        self.inner.id,
                        &self.inner.key_type,
                        &self.inner.value_type,
                    )?
                } else {
                    Arc::new(Page::empty_leaf(self.inner.id))
                }
            }
        };
        Ok(MvMap {
            inner: Arc::new(MapInner {
                id: self.inner.id,
                name: self.inner.name.clone(),
                key_type: self.inner.key_type.clone(),
                value_type: self.inner.value_type.clone(),
                store: self.inner.store.clone(),
                root: RootHolder::new(RootReference::new(root_page, version)),
                keys_per_page: self.inner.keys_per_page,
                page_split_size: self.inner.page_split_size,
                single_writer: false,
                writable: false,
                snapshot_version: Some(version),
                _version_guard: Some(guard),
                closed: AtomicBool::new(false),
            }),
        })
    }

    // Maintenance.

    /// Re-put live entries whose pages sit in one of the given chunks, so
    /// the replacement pages land in a newer chunk and the old chunks can
    /// drain to zero live pages.
    pub fn rewrite(&self, chunks: &HashSet<u32>) -> Result<usize> {
        self.check_writable()?;
        let root_ref = self.flushed_root()?;
        let rewritten = self.rewrite_page(&root_ref.root, chunks)?;
        if rewritten > 0 {
            log::debug!(
                "rewrote {rewritten} pages of map {:?} out of {} chunks",
                self.inner.name,
                chunks.len()
            );
        }
        Ok(rewritten)
    }

    fn rewrite_page(&self, page: &Arc<Page<K, V>>, chunks: &HashSet<u32>) -> Result<usize> {
        let pos = page.pos();
        let in_set = position::is_saved(pos) && chunks.contains(&position::chunk_id(pos));
        if page.is_leaf() {
            if in_set && page.key_count() > 0 {
                let key = page.keys[0].clone();
                let value = page.values()[0].clone();
                self.put(key, value)?;
                return Ok(1);
            }
            return Ok(0);
        }
        let mut rewritten = 0usize;
        for i in 0..page.children().len() {
            let child = self.read_child(page, i)?;
            rewritten += self.rewrite_page(&child, chunks)?;
        }
        if rewritten == 0 && in_set {
            // nothing below moved, but the node itself must migrate:
            // re-put one representative entry beneath it
            let mut leaf = page.clone();
            while !leaf.is_leaf() {
                leaf = self.read_child(&leaf, 0)?;
            }
            if leaf.key_count() > 0 {
                let key = leaf.keys[0].clone();
                let value = leaf.values()[0].clone();
                self.put(key, value)?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    fn retire_subtree(&self, page: &Arc<Page<K, V>>) -> Result<()> {
        let pos = page.mark_removed();
        if pos != 0 {
            self.inner.store.register_removed_page(pos);
        }
        for child_ref in page.children() {
            match &child_ref.child {
                Some(child) => self.retire_subtree(child)?,
                None => {
                    let child_pos = child_ref.position();
                    if !position::is_saved(child_pos) {
                        continue;
                    }
                    if position::is_leaf(child_pos) {
                        self.inner.store.register_removed_page(child_pos);
                    } else {
                        let child = page_io::read_page(
                            self.inner.store.as_ref(),
                            child_pos,
                            self.inner.id,
                            &self.inner.key_type,
                            &self.inner.value_type,
                        )?;
                        self.retire_subtree(&child)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Type-erased commit hooks the store drives for every open map.
pub trait MapCommit: Send + Sync {
    fn map_id(&self) -> u32;

    fn map_name(&self) -> &str;

    /// Fold the append buffer into the tree before serialization.
    fn flush_append(&self) -> Result<()>;

    /// Whether the current root carries unsaved pages or buffered appends.
    fn has_unsaved(&self) -> bool;

    /// Serialize the current root into the chunk, returning its position.
    fn write_root(&self, ctx: &mut WriteContext) -> Result<u64>;

    /// Drop retention-chain entries no snapshot can reach anymore.
    fn truncate_history(&self, oldest: u64);

    /// Discard roots newer than `version`, restoring the persisted root.
    fn rollback_to(&self, version: u64, persisted_root: u64) -> Result<()>;

    fn close_map(&self);

    /// Clear the map and retire its pages, ahead of deleting the map.
    fn clear_for_removal(&self) -> Result<()>;

    fn rewrite_chunks(&self, chunks: &HashSet<u32>) -> Result<usize>;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: DataType, V: DataType> MapCommit for MvMap<K, V> {
    fn map_id(&self) -> u32 {
        self.inner.id
    }

    fn map_name(&self) -> &str {
        &self.inner.name
    }

    fn flush_append(&self) -> Result<()> {
        self.flushed_root()?;
        Ok(())
    }

    fn has_unsaved(&self) -> bool {
        let root_ref = self.inner.root.get();
        root_ref.root.pos() == position::POS_UNSAVED || !root_ref.append_buffer.is_empty()
    }

    fn write_root(&self, ctx: &mut WriteContext) -> Result<u64> {
        let root_ref = self.inner.root.get();
        page_io::write_page(
            &root_ref.root,
            &self.inner.key_type,
            &self.inner.value_type,
            ctx,
        )
    }

    fn truncate_history(&self, oldest: u64) {
        self.inner.root.get().truncate_history(oldest);
    }

    fn rollback_to(&self, version: u64, persisted_root: u64) -> Result<()> {
        let root_ref = self.inner.root.get();
        match root_ref.at_version(version) {
            Some(reference) => self.inner.root.set(reference.unlocked_copy()),
            None => {
                let root_page = if position::is_saved(persisted_root) {
                    page_io::read_page(
                        self.inner.store.as_ref(),
                        persisted_root,
                        self.inner.id,
                        &self.inner.key_type,
                        &self.inner.value_type,
                    )?
                } else {
                    Arc::new(Page::empty_leaf(self.inner.id))
                };
                self.inner
                    .root
                    .set(RootReference::new(root_page, version));
            }
        }
        Ok(())
    }

    fn close_map(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn clear_for_removal(&self) -> Result<()> {
        self.clear()
    }

    fn rewrite_chunks(&self, chunks: &HashSet<u32>) -> Result<usize> {
        self.rewrite(chunks)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
