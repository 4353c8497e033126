use std::sync::Arc;

use parking_lot::RwLock;

use crate::page::Page;
use crate::types::DataType;

/// Descriptor of a map's published state: the current root page, the
/// version it belongs to, the chain of older roots for snapshot access,
/// contention counters and the single-writer append buffer.
///
/// All updaters compete through compare-and-swap on the holder; readers
/// grab the reference once and traverse an immutable tree.
pub struct RootReference<K: DataType, V: DataType> {
    pub root: Arc<Page<K, V>>,
    pub version: u64,
    /// Older root references, one per retained version. Truncated past
    /// the oldest version to keep.
    previous: RwLock<Option<Arc<RootReference<K, V>>>>,
    /// Successful updates through this chain.
    pub updates: u64,
    /// Update attempts, successful or not; the gap measures contention.
    pub attempts: u64,
    /// Set while a writer holds the exclusive update path; other writers
    /// yield or sleep instead of spinning.
    pub locked: bool,
    /// Entries appended past the largest key, not yet in the tree.
    pub append_buffer: Vec<(K::Value, V::Value)>,
    /// Appends since the map was opened.
    pub append_count: u64,
}

impl<K: DataType, V: DataType> RootReference<K, V> {
    pub fn new(root: Arc<Page<K, V>>, version: u64) -> Self {
        RootReference {
            root,
            version,
            previous: RwLock::new(None),
            updates: 0,
            attempts: 0,
            locked: false,
            append_buffer: Vec::new(),
            append_count: 0,
        }
    }

    /// Successor reference after an update. Only one reference per version
    /// is kept: updating within the same version replaces the chain head,
    /// crossing a version boundary chains the old head.
    pub fn next(
        old: &Arc<RootReference<K, V>>,
        root: Arc<Page<K, V>>,
        version: u64,
        locked: bool,
        attempts: u64,
    ) -> Self {
        let previous = if old.version == version {
            old.previous.read().clone()
        } else {
            Some(old.clone())
        };
        RootReference {
            root,
            version,
            previous: RwLock::new(previous),
            updates: old.updates + 1,
            attempts: old.attempts + attempts,
            locked,
            append_buffer: Vec::new(),
            append_count: old.append_count,
        }
    }

    /// Copy with the lock flag set, same tree state.
    pub fn locked_copy(self: &Arc<Self>) -> RootReference<K, V> {
        RootReference {
            root: self.root.clone(),
            version: self.version,
            previous: RwLock::new(self.previous.read().clone()),
            updates: self.updates,
            attempts: self.attempts + 1,
            locked: true,
            append_buffer: self.append_buffer.clone(),
            append_count: self.append_count,
        }
    }

    /// Copy with the lock flag cleared, same tree state.
    pub fn unlocked_copy(self: &Arc<Self>) -> RootReference<K, V> {
        RootReference {
            root: self.root.clone(),
            version: self.version,
            previous: RwLock::new(self.previous.read().clone()),
            updates: self.updates,
            attempts: self.attempts,
            locked: false,
            append_buffer: self.append_buffer.clone(),
            append_count: self.append_count,
        }
    }

    /// Copy with a new append buffer, same tree state.
    pub fn with_append_buffer(
        self: &Arc<Self>,
        append_buffer: Vec<(K::Value, V::Value)>,
        appended: u64,
    ) -> RootReference<K, V> {
        RootReference {
            root: self.root.clone(),
            version: self.version,
            previous: RwLock::new(self.previous.read().clone()),
            updates: self.updates,
            attempts: self.attempts,
            locked: self.locked,
            append_buffer,
            append_count: self.append_count + appended,
        }
    }

    pub fn previous(&self) -> Option<Arc<RootReference<K, V>>> {
        self.previous.read().clone()
    }

    /// Newest reference in the chain with `version <= v`.
    pub fn at_version(self: &Arc<Self>, v: u64) -> Option<Arc<RootReference<K, V>>> {
        let mut current = self.clone();
        loop {
            if current.version <= v {
                return Some(current);
            }
            let previous = current.previous()?;
            current = previous;
        }
    }

    /// Drop chain entries older than `oldest`, keeping at least the last
    /// reference at or below it so snapshots at `oldest` stay readable.
    pub fn truncate_history(self: &Arc<Self>, oldest: u64) {
        let mut current = self.clone();
        loop {
            let Some(previous) = current.previous() else {
                return;
            };
            if current.version <= oldest {
                *current.previous.write() = None;
                return;
            }
            current = previous;
        }
    }
}

/// The atomically swappable slot holding a map's current root reference.
pub struct RootHolder<K: DataType, V: DataType> {
    slot: RwLock<Arc<RootReference<K, V>>>,
}

impl<K: DataType, V: DataType> RootHolder<K, V> {
    pub fn new(reference: RootReference<K, V>) -> Self {
        RootHolder {
            slot: RwLock::new(Arc::new(reference)),
        }
    }

    pub fn get(&self) -> Arc<RootReference<K, V>> {
        self.slot.read().clone()
    }

    /// Publish `new` only when the slot still holds `expected`.
    pub fn compare_and_set(
        &self,
        expected: &Arc<RootReference<K, V>>,
        new: RootReference<K, V>,
    ) -> bool {
        let mut slot = self.slot.write();
        if Arc::ptr_eq(&*slot, expected) {
            *slot = Arc::new(new);
            true
        } else {
            false
        }
    }

    /// Unconditional publish; only valid while holding the update lock or
    /// the store lock (rollback, commit bookkeeping).
    pub fn set(&self, new: RootReference<K, V>) {
        *self.slot.write() = Arc::new(new);
    }
}
