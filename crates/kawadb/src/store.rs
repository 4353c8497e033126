use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};

use btree::map::{MapCommit, MvMap};
use btree::page_io::{PageSource, WriteContext};
use btree::types::{DataType, StringType};
use storage::chunk::Chunk;
use storage::data_util::{format_hex_u64, parse_hex_u32, parse_hex_u64};
use storage::file_store::{FileStore, StoreHeader};
use storage::free_space::FreeSpaceBitSet;
use storage::position;
use storage::{BLOCK_SIZE, Result, StoreError};

use crate::cache::PageCache;
use crate::config::StoreConfig;

pub(crate) const LAYOUT_MAP_ID: u32 = 0;
pub(crate) const META_MAP_ID: u32 = 1;

/// Versions between forced store-header rewrites.
const HEADER_REWRITE_VERSION_GAP: u64 = 20;
/// Chunk headers verified on the clean-shutdown open path.
const VERIFY_CHUNKS_ON_OPEN: usize = 20;
/// Unsaved-memory multiple that forces a synchronous commit.
const SYNC_COMMIT_RATIO: usize = 4;

pub(crate) fn layout_root_key(map_id: u32) -> String {
    format!("root.{map_id:x}")
}

pub(crate) fn layout_chunk_key(chunk_id: u32) -> String {
    format!("chunk.{chunk_id:x}")
}

fn meta_name_key(name: &str) -> String {
    format!("name.{name}")
}

fn meta_map_key(map_id: u32) -> String {
    format!("map.{map_id:x}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RemovedPage {
    pos: u64,
    /// Version at which the page became unreachable.
    version: u64,
}

/// Shared page-level state: everything maps need to read pages and to
/// report removals, without touching the store lock.
pub(crate) struct StoreBase {
    pub(crate) file: FileStore,
    pub(crate) cache: PageCache,
    keys_per_page: usize,
    page_split_size: usize,
    auto_commit_memory: usize,
    /// Adjustable at runtime: explicit full compaction narrows it to
    /// reclaim space immediately. Pinned snapshots are honored regardless.
    pub(crate) versions_to_keep: AtomicU64,
    read_only: bool,
    pub(crate) chunks: RwLock<HashMap<u32, Chunk>>,
    /// Layout map handle for lazy chunk-metadata resolution during reads.
    layout_lookup: RwLock<Option<MvMap<StringType, StringType>>>,
    resolving: Mutex<HashSet<u32>>,
    removed_pages: Mutex<Vec<RemovedPage>>,
    pub(crate) unsaved_memory: AtomicUsize,
    current_version: AtomicU64,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    committing: AtomicBool,
    closed: AtomicBool,
    panicked: AtomicBool,
    panic_cause: Mutex<Option<String>>,
    created: AtomicU64,
    self_weak: Weak<StoreBase>,
    commit_hook: Mutex<Option<Weak<StoreShared>>>,
}

struct VersionGuard {
    base: Weak<StoreBase>,
    version: u64,
}

impl Drop for VersionGuard {
    fn drop(&mut self) {
        if let Some(base) = self.base.upgrade() {
            let mut snapshots = base.snapshots.lock();
            if let Some(count) = snapshots.get_mut(&self.version) {
                *count -= 1;
                if *count == 0 {
                    snapshots.remove(&self.version);
                }
            }
        }
    }
}

impl StoreBase {
    fn new(file: FileStore, config: &StoreConfig) -> Arc<StoreBase> {
        Arc::new_cyclic(|weak| StoreBase {
            file,
            cache: PageCache::new(config.cache_size, config.cache_concurrency),
            keys_per_page: config.keys_per_page,
            page_split_size: config.page_split_size,
            auto_commit_memory: config.auto_commit_memory(),
            versions_to_keep: AtomicU64::new(config.versions_to_keep),
            read_only: config.read_only,
            chunks: RwLock::new(HashMap::new()),
            layout_lookup: RwLock::new(None),
            resolving: Mutex::new(HashSet::new()),
            removed_pages: Mutex::new(Vec::new()),
            unsaved_memory: AtomicUsize::new(0),
            current_version: AtomicU64::new(0),
            snapshots: Mutex::new(BTreeMap::new()),
            committing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            panic_cause: Mutex::new(None),
            created: AtomicU64::new(0),
            self_weak: weak.clone(),
            commit_hook: Mutex::new(None),
        })
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.panicked.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if self.read_only {
            return Err(StoreError::UnsupportedOperation(
                "store is read-only".into(),
            ));
        }
        Ok(())
    }

    /// Chunk metadata by id, resolving lazily through the layout map for
    /// chunks not touched since open.
    fn chunk(&self, id: u32) -> Result<Chunk> {
        if let Some(chunk) = self.chunks.read().get(&id) {
            return Ok(chunk.clone());
        }
        let layout = self
            .layout_lookup
            .read()
            .clone()
            .ok_or_else(|| StoreError::FileCorrupt(format!("unknown chunk {id}")))?;
        let mut waited = 0u32;
        loop {
            if let Some(chunk) = self.chunks.read().get(&id) {
                return Ok(chunk.clone());
            }
            if self.resolving.lock().insert(id) {
                break;
            }
            // either another reader resolves the same chunk, or the
            // metadata is cyclic and this thread is re-entering itself
            waited += 1;
            if waited > 1000 {
                return Err(StoreError::FileCorrupt(format!(
                    "chunk {id} metadata is cyclic"
                )));
            }
            std::thread::yield_now();
        }
        let result = (|| match layout.get(&layout_chunk_key(id))? {
            Some(value) => {
                let chunk = Chunk::from_metadata(&value)?;
                if !chunk.is_allocated() {
                    return Err(StoreError::FileCorrupt(format!(
                        "chunk {id} metadata carries no block"
                    )));
                }
                self.chunks.write().insert(id, chunk.clone());
                Ok(chunk)
            }
            None => Err(StoreError::FileCorrupt(format!("unknown chunk {id}"))),
        })();
        self.resolving.lock().remove(&id);
        result
    }

    fn unsaved_memory_bytes(&self) -> usize {
        self.unsaved_memory.load(Ordering::Relaxed)
    }
}

impl PageSource for StoreBase {
    fn read_page_bytes(&self, pos: u64) -> Result<Bytes> {
        if !position::is_saved(pos) {
            return Err(StoreError::Internal(format!(
                "reading unsaved position {pos}"
            )));
        }
        let chunk = self.chunk(position::chunk_id(pos))?;
        let offset = position::offset(pos) as u64;
        let chunk_bytes = chunk.len * BLOCK_SIZE as u64;
        if offset + 7 > chunk_bytes {
            return Err(StoreError::FileCorrupt(format!(
                "page offset {offset} beyond chunk {}",
                chunk.id
            )));
        }
        let fetch = std::cmp::min(position::read_length(pos) as u64, chunk_bytes - offset);
        let bytes = self
            .file
            .read_fully(chunk.block * BLOCK_SIZE as u64 + offset, fetch as usize)?;
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as u64;
        if len < 7 || offset + len > chunk_bytes {
            return Err(StoreError::FileCorrupt(format!(
                "bad page length {len} in chunk {}",
                chunk.id
            )));
        }
        if len as usize <= bytes.len() {
            let mut bytes = bytes;
            bytes.truncate(len as usize);
            return Ok(Bytes::from(bytes));
        }
        // inline-length page larger than the first probe
        let bytes = self
            .file
            .read_fully(chunk.block * BLOCK_SIZE as u64 + offset, len as usize)?;
        Ok(Bytes::from(bytes))
    }

    fn cache_get(&self, pos: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cache.get(pos)
    }

    fn cache_put(&self, pos: u64, page: Arc<dyn Any + Send + Sync>, memory: usize) {
        self.cache.insert(pos, page, memory);
    }

    fn register_removed_page(&self, pos: u64) {
        let version = self.next_write_version();
        self.removed_pages.lock().push(RemovedPage { pos, version });
    }

    fn register_unsaved_memory(&self, memory: usize) {
        let total = self.unsaved_memory.fetch_add(memory, Ordering::Relaxed) + memory;
        if self.read_only || self.committing.load(Ordering::Acquire) {
            return;
        }
        if total > self.auto_commit_memory * SYNC_COMMIT_RATIO {
            // hard back-pressure: commit on the writer's own thread
            let hook = self.commit_hook.lock().clone();
            if let Some(shared) = hook.and_then(|weak| weak.upgrade()) {
                if let Err(e) = shared.commit_internal() {
                    warn!("back-pressure commit failed: {e}");
                }
            }
        } else if total > self.auto_commit_memory {
            let hook = self.commit_hook.lock().clone();
            if let Some(shared) = hook.and_then(|weak| weak.upgrade()) {
                shared.wake_background();
            }
        }
    }

    fn next_write_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire) + 1
    }

    fn oldest_version_to_keep(&self) -> u64 {
        let current = self.current_version.load(Ordering::Acquire);
        let keep = self.versions_to_keep.load(Ordering::Relaxed);
        let mut oldest = current.saturating_sub(keep.saturating_sub(1));
        if let Some((&pinned, _)) = self.snapshots.lock().first_key_value() {
            oldest = oldest.min(pinned);
        }
        oldest
    }

    fn pin_version(&self, version: u64) -> Arc<dyn Any + Send + Sync> {
        *self.snapshots.lock().entry(version).or_insert(0) += 1;
        Arc::new(VersionGuard {
            base: self.self_weak.clone(),
            version,
        })
    }

    fn root_pos_at_version(&self, map_id: u32, version: u64) -> Result<u64> {
        let chunk = {
            let chunks = self.chunks.read();
            chunks
                .values()
                .filter(|c| c.version <= version)
                .max_by_key(|c| c.version)
                .cloned()
        }
        .ok_or_else(|| {
            StoreError::IllegalArgument(format!("version {version} is no longer available"))
        })?;
        let base = self.self_weak.upgrade().ok_or(StoreError::Closed)?;
        let layout: MvMap<StringType, StringType> = MvMap::open(
            base,
            LAYOUT_MAP_ID,
            "layout",
            StringType,
            StringType,
            chunk.layout_root,
            false,
            false,
        )?;
        match layout.get(&layout_root_key(map_id))? {
            Some(hex) => parse_hex_u64(&hex),
            None => Ok(position::POS_UNSAVED),
        }
    }

    fn keys_per_page(&self) -> usize {
        self.keys_per_page
    }

    fn page_split_size(&self) -> usize {
        self.page_split_size
    }
}

/// File-level mutable state, guarded by the store lock.
pub(crate) struct StoreState {
    pub(crate) header: StoreHeader,
    pub(crate) free_space: FreeSpaceBitSet,
    pub(crate) last_chunk_id: u32,
    next_map_id: u32,
    deferred_removed: Vec<RemovedPage>,
    pub(crate) dirty_chunks: HashSet<u32>,
    last_predicted_next: u64,
    /// Block interval excluded from allocation while compaction moves
    /// chunks; `(low, high)`, high of `u64::MAX` meaning "to the end".
    pub(crate) reserved: Option<(u64, u64)>,
    pub(crate) freed_chunk_since_header: bool,
    clean_flag_pending_clear: bool,
}

impl StoreState {
    fn fresh(header: StoreHeader) -> StoreState {
        StoreState {
            header,
            free_space: FreeSpaceBitSet::new(),
            last_chunk_id: 0,
            next_map_id: META_MAP_ID + 1,
            deferred_removed: Vec::new(),
            dirty_chunks: HashSet::new(),
            last_predicted_next: 0,
            reserved: None,
            freed_chunk_since_header: false,
            clean_flag_pending_clear: false,
        }
    }
}

struct BackgroundTask {
    handle: std::thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

pub(crate) struct StoreShared {
    pub(crate) base: Arc<StoreBase>,
    pub(crate) config: StoreConfig,
    pub(crate) state: ReentrantMutex<RefCell<StoreState>>,
    pub(crate) layout: MvMap<StringType, StringType>,
    pub(crate) meta: MvMap<StringType, StringType>,
    pub(crate) maps: RwLock<HashMap<u32, Arc<dyn MapCommit>>>,
    background: Mutex<Option<BackgroundTask>>,
    pub(crate) housekeeping_active: AtomicBool,
    bg_wake: Arc<(Mutex<bool>, Condvar)>,
}

/// The store: many named maps persisted together in one append-structured
/// file. Cheap to clone; all clones are handles onto the same store.
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Arc<StoreShared>,
}

impl Store {
    /// Open or create a store as described by `config`.
    pub fn open(config: StoreConfig) -> Result<Store> {
        config.validate()?;
        let file = match &config.file_name {
            Some(path) => FileStore::open(path, config.read_only)?,
            None => FileStore::in_memory(),
        };
        let size = file.size()?;
        let base = StoreBase::new(file, &config);

        let (layout, meta, state) = if size == 0 {
            if config.read_only {
                return Err(StoreError::FileCorrupt("store file is empty".into()));
            }
            Self::init_empty(&base)?
        } else {
            Self::load_existing(&base, &config)?
        };

        let shared = Arc::new(StoreShared {
            base: base.clone(),
            config,
            state: ReentrantMutex::new(RefCell::new(state)),
            layout,
            meta,
            maps: RwLock::new(HashMap::new()),
            background: Mutex::new(None),
            housekeeping_active: AtomicBool::new(false),
            bg_wake: Arc::new((Mutex::new(false), Condvar::new())),
        });
        *base.commit_hook.lock() = Some(Arc::downgrade(&shared));
        let store = Store { shared };
        store.spawn_background();
        Ok(store)
    }

    fn init_empty(
        base: &Arc<StoreBase>,
    ) -> Result<(MvMap<StringType, StringType>, MvMap<StringType, StringType>, StoreState)> {
        let created = now_millis();
        base.created.store(created, Ordering::Relaxed);
        let header = StoreHeader::new(created);
        base.file.write_store_header(&header)?;
        base.file.sync()?;
        let layout = MvMap::open(
            base.clone(),
            LAYOUT_MAP_ID,
            "layout",
            StringType,
            StringType,
            0,
            false,
            true,
        )?;
        *base.layout_lookup.write() = Some(layout.clone());
        let meta = MvMap::open(
            base.clone(),
            META_MAP_ID,
            "meta",
            StringType,
            StringType,
            0,
            false,
            true,
        )?;
        Ok((layout, meta, StoreState::fresh(header)))
    }

    fn load_existing(
        base: &Arc<StoreBase>,
        config: &StoreConfig,
    ) -> Result<(MvMap<StringType, StringType>, MvMap<StringType, StringType>, StoreState)> {
        let (header, both_copies_ok) = base.file.read_store_header()?;
        base.created.store(header.created, Ordering::Relaxed);
        let assume_clean = both_copies_ok && header.clean;

        let mut candidates = Vec::new();
        if header.chunk != 0 {
            if let Ok(newest) = read_chunk_at(&base.file, header.block) {
                if newest.id == header.chunk {
                    candidates.push(chase_forward(&base.file, newest));
                }
            }
        }
        if candidates.is_empty() || !assume_clean {
            debug!("scanning file for chunks (clean={assume_clean})");
            for chunk in backward_scan(&base.file)? {
                if !candidates.iter().any(|c: &Chunk| c.id == chunk.id) {
                    candidates.push(chunk);
                }
            }
            candidates.sort_by_key(|c| std::cmp::Reverse(c.version));
        }

        if candidates.is_empty() && header.chunk == 0 {
            // header-only file: a store that never committed
            base.current_version
                .store(header.version, Ordering::Release);
            let layout = MvMap::open(
                base.clone(),
                LAYOUT_MAP_ID,
                "layout",
                StringType,
                StringType,
                0,
                false,
                !config.read_only,
            )?;
            *base.layout_lookup.write() = Some(layout.clone());
            let meta = MvMap::open(
                base.clone(),
                META_MAP_ID,
                "meta",
                StringType,
                StringType,
                0,
                false,
                !config.read_only,
            )?;
            let mut state = StoreState::fresh(header);
            state.clean_flag_pending_clear = state.header.clean;
            return Ok((layout, meta, state));
        }
        if candidates.is_empty() {
            return Err(StoreError::FileCorrupt(
                "no valid chunk found in the store file".into(),
            ));
        }

        let mut last_error = None;
        for newest in candidates {
            match Self::try_load(base, config, &header, newest) {
                Ok(loaded) => {
                    let (layout, meta, mut state) = loaded;
                    state.clean_flag_pending_clear = assume_clean;
                    return Ok((layout, meta, state));
                }
                Err(e) => {
                    warn!("chunk set rejected during open: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| StoreError::FileCorrupt("unreadable store".into())))
    }

    fn try_load(
        base: &Arc<StoreBase>,
        config: &StoreConfig,
        header: &StoreHeader,
        newest: Chunk,
    ) -> Result<(MvMap<StringType, StringType>, MvMap<StringType, StringType>, StoreState)> {
        base.cache.clear();
        base.chunks.write().clear();
        base.resolving.lock().clear();
        base.chunks.write().insert(newest.id, newest.clone());
        base.current_version.store(newest.version, Ordering::Release);

        let writable = !config.read_only;
        let layout = MvMap::open(
            base.clone(),
            LAYOUT_MAP_ID,
            "layout",
            StringType,
            StringType,
            newest.layout_root,
            false,
            writable,
        )?;
        *base.layout_lookup.write() = Some(layout.clone());

        // chunk table from the layout map
        let mut registry: HashMap<u32, Chunk> = HashMap::new();
        registry.insert(newest.id, newest.clone());
        let prefix = "chunk.".to_string();
        let mut cursor = layout.cursor(Some(&prefix))?;
        while let Some((key, value)) = cursor.next_entry()? {
            let Some(id_hex) = key.strip_prefix("chunk.") else {
                break;
            };
            let id = parse_hex_u32(id_hex)?;
            if id == newest.id {
                continue;
            }
            let chunk = Chunk::from_metadata(&value)?;
            if !chunk.is_allocated() {
                if config.recovery_mode {
                    warn!("dropping unallocated chunk {id} in recovery mode");
                    continue;
                }
                return Err(StoreError::FileCorrupt(format!(
                    "chunk {id} metadata carries no block"
                )));
            }
            registry.insert(id, chunk);
        }

        // verify the most recent chunk headers and footers on disk
        let mut recent: Vec<&Chunk> = registry.values().collect();
        recent.sort_by_key(|c| std::cmp::Reverse(c.version));
        for chunk in recent.iter().take(VERIFY_CHUNKS_ON_OPEN) {
            match read_chunk_at(&base.file, chunk.block) {
                Ok(on_disk) if on_disk.id == chunk.id && on_disk.version == chunk.version => {}
                Ok(on_disk) => {
                    return Err(StoreError::FileCorrupt(format!(
                        "chunk {} at block {} holds chunk {}",
                        chunk.id, chunk.block, on_disk.id
                    )));
                }
                Err(e) => {
                    if config.recovery_mode {
                        warn!("unverifiable chunk {} in recovery mode: {e}", chunk.id);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        let mut free_space = FreeSpaceBitSet::new();
        for chunk in registry.values() {
            free_space.mark_used(chunk.block, chunk.len);
        }

        let meta_pos = match layout.get(&layout_root_key(META_MAP_ID))? {
            Some(hex) => parse_hex_u64(&hex)?,
            None => 0,
        };
        let next_map_id = (newest.map_high_water + 1).max(META_MAP_ID + 1);
        let last_chunk_id = newest.id;
        *base.chunks.write() = registry;
        let meta = MvMap::open(
            base.clone(),
            META_MAP_ID,
            "meta",
            StringType,
            StringType,
            meta_pos,
            false,
            writable,
        )?;

        let mut state = StoreState::fresh(header.clone());
        state.free_space = free_space;
        state.last_chunk_id = last_chunk_id;
        state.next_map_id = next_map_id;
        debug!(
            "opened store at version {}, newest chunk {}",
            newest.version, newest.id
        );
        Ok((layout, meta, state))
    }

    // Public surface.

    /// Current committed version.
    pub fn version(&self) -> u64 {
        self.shared.base.current_version.load(Ordering::Acquire)
    }

    pub fn oldest_version_to_keep(&self) -> u64 {
        self.shared.base.oldest_version_to_keep()
    }

    pub fn unsaved_memory(&self) -> usize {
        self.shared.base.unsaved_memory_bytes()
    }

    /// Commit all pending changes, writing one new chunk. Returns the new
    /// version, or the unchanged current version if nothing was pending.
    pub fn commit(&self) -> Result<u64> {
        self.shared.commit_internal()
    }

    /// Open (creating on first use) the named map with the given key and
    /// value types. Reopening with different types is rejected.
    pub fn open_map<K: DataType, V: DataType>(
        &self,
        name: &str,
        key_type: K,
        value_type: V,
    ) -> Result<MvMap<K, V>> {
        self.shared.open_map(name, key_type, value_type, false)
    }

    /// Like [`Store::open_map`], with the single-writer append fast path
    /// enabled. Not safe against concurrent writers on the same map.
    pub fn open_single_writer_map<K: DataType, V: DataType>(
        &self,
        name: &str,
        key_type: K,
        value_type: V,
    ) -> Result<MvMap<K, V>> {
        self.shared.open_map(name, key_type, value_type, true)
    }

    /// Names of all maps in the store.
    pub fn map_names(&self) -> Result<Vec<String>> {
        let prefix = "name.".to_string();
        let mut cursor = self.shared.meta.cursor(Some(&prefix))?;
        let mut names = Vec::new();
        while let Some((key, _)) = cursor.next_entry()? {
            let Some(name) = key.strip_prefix("name.") else {
                break;
            };
            names.push(name.to_string());
        }
        Ok(names)
    }

    /// Remove a map and retire its pages. The map must be open.
    pub fn remove_map(&self, name: &str) -> Result<()> {
        self.shared.base.check_writable()?;
        let guard = self.shared.state.lock();
        let _state = guard.borrow_mut();
        let Some(id_hex) = self.shared.meta.get(&meta_name_key(name))? else {
            return Ok(());
        };
        let id = parse_hex_u32(&id_hex)?;
        let Some(map) = self.shared.maps.write().remove(&id) else {
            return Err(StoreError::UnsupportedOperation(format!(
                "map {name:?} must be open to be removed"
            )));
        };
        map.clear_for_removal()?;
        map.close_map();
        self.shared.meta.remove(&meta_name_key(name))?;
        self.shared.meta.remove(&meta_map_key(id))?;
        self.shared.layout.remove(&layout_root_key(id))?;
        Ok(())
    }

    /// User-settable store version, kept in the metadata map.
    pub fn set_store_version(&self, version: u32) -> Result<()> {
        self.shared
            .meta
            .put("setting.storeVersion".to_string(), format_hex_u64(version as u64))?;
        Ok(())
    }

    pub fn store_version(&self) -> Result<Option<u32>> {
        Ok(match self.shared.meta.get(&"setting.storeVersion".to_string())? {
            Some(hex) => Some(parse_hex_u32(&hex)?),
            None => None,
        })
    }

    /// Roll the store back to `version`: in-memory roots newer than the
    /// version are discarded, persisted roots are restored, chunks written
    /// after it are freed, and maps created later are closed.
    pub fn rollback_to(&self, version: u64) -> Result<()> {
        self.shared.base.check_writable()?;
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        let current = self.version();
        if version > current {
            return Err(StoreError::IllegalArgument(format!(
                "cannot roll back to future version {version}, current is {current}"
            )));
        }
        let oldest = self.shared.base.oldest_version_to_keep();
        if version < oldest {
            // chunks the target version relied on may already be reclaimed
            return Err(StoreError::IllegalArgument(format!(
                "version {version} is before the retention bound {oldest}"
            )));
        }

        let restore_chunk = {
            let chunks = self.shared.base.chunks.read();
            chunks
                .values()
                .filter(|c| c.version <= version)
                .max_by_key(|c| c.version)
                .cloned()
        };

        // drop chunks written after the target version
        let doomed: Vec<Chunk> = {
            let chunks = self.shared.base.chunks.read();
            chunks
                .values()
                .filter(|c| c.version > version)
                .cloned()
                .collect()
        };
        for chunk in &doomed {
            state.free_space.free(chunk.block, chunk.len);
            self.shared.base.chunks.write().remove(&chunk.id);
            state.dirty_chunks.remove(&chunk.id);
        }
        self.shared.base.cache.clear();
        state
            .deferred_removed
            .retain(|removed| removed.version <= version);
        self.shared
            .base
            .removed_pages
            .lock()
            .retain(|removed| removed.version <= version);
        self.shared.base.unsaved_memory.store(0, Ordering::Relaxed);

        let layout_root = restore_chunk.as_ref().map(|c| c.layout_root).unwrap_or(0);
        self.shared.layout.rollback_to(version, layout_root)?;
        let meta_root = match self.shared.layout.get(&layout_root_key(META_MAP_ID))? {
            Some(hex) => parse_hex_u64(&hex)?,
            None => 0,
        };
        self.shared.meta.rollback_to(version, meta_root)?;

        self.shared
            .base
            .current_version
            .store(version, Ordering::Release);

        // restore or close user maps
        let maps: Vec<(u32, Arc<dyn MapCommit>)> = self
            .shared
            .maps
            .read()
            .iter()
            .map(|(id, m)| (*id, m.clone()))
            .collect();
        for (id, map) in maps {
            if self.shared.meta.get(&meta_map_key(id))?.is_none() {
                map.close_map();
                self.shared.maps.write().remove(&id);
                continue;
            }
            let root = match self.shared.layout.get(&layout_root_key(id))? {
                Some(hex) => parse_hex_u64(&hex)?,
                None => 0,
            };
            map.rollback_to(version, root)?;
        }

        if let Some(chunk) = restore_chunk {
            state.last_chunk_id = chunk.id;
            state.header.chunk = chunk.id;
            state.header.block = chunk.block;
        } else {
            state.last_chunk_id = 0;
            state.header.chunk = 0;
            state.header.block = 0;
        }
        state.header.version = version;
        state.header.clean = false;
        state.last_predicted_next = 0;
        if !self.shared.config.read_only {
            self.shared.base.file.write_store_header(&state.header)?;
            self.shared.base.file.sync()?;
        }
        debug!("rolled back to version {version}");
        Ok(())
    }

    /// Commit pending changes, write a clean header and release the file.
    pub fn close(&self) -> Result<()> {
        self.stop_background();
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if self.shared.base.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut result = Ok(());
        if !self.shared.config.read_only && !self.shared.base.panicked.load(Ordering::Acquire) {
            result = self.shared.store_now(&mut state).map(|_| ());
            if result.is_ok() {
                state.header.clean = true;
                state.header.version = self.version();
                state.header.chunk = state.last_chunk_id;
                if let Some(last) = self.shared.base.chunks.read().get(&state.last_chunk_id) {
                    state.header.block = last.block;
                }
                result = self
                    .shared
                    .base
                    .file
                    .write_store_header(&state.header)
                    .and_then(|_| self.shared.base.file.sync());
            }
        }
        self.shared.base.closed.store(true, Ordering::Release);
        for map in self.shared.maps.read().values() {
            map.close_map();
        }
        self.shared.base.cache.clear();
        result
    }

    /// The cause retained after the store entered panic mode.
    pub fn panic_cause(&self) -> Option<String> {
        self.shared.base.panic_cause.lock().clone()
    }

    pub(crate) fn spawn_background(&self) {
        if self.shared.config.auto_commit_delay == 0 || self.shared.config.read_only {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&self.shared);
        let wake = self.shared.bg_wake.clone();
        let delay = self.shared.config.auto_commit_delay;
        let handler = self.shared.config.background_exception_handler.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("kawadb-background".into())
            .spawn(move || {
                loop {
                    {
                        let (lock, condvar) = &*wake;
                        let mut signaled = lock.lock();
                        if !*signaled {
                            condvar.wait_for(&mut signaled, Duration::from_millis(delay));
                        }
                        *signaled = false;
                    }
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = shared.background_pass() {
                        match &handler {
                            Some(handler) => handler(&e),
                            None => warn!("background pass failed: {e}"),
                        }
                    }
                }
            })
            .expect("spawning the background thread");
        *self.shared.background.lock() = Some(BackgroundTask { handle, stop });
    }

    fn stop_background(&self) {
        let task = self.shared.background.lock().take();
        if let Some(task) = task {
            task.stop.store(true, Ordering::Release);
            self.shared.wake_background();
            if task.handle.thread().id() != std::thread::current().id() {
                let _ = task.handle.join();
            }
        }
    }
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        if let Some(task) = self.background.lock().take() {
            task.stop.store(true, Ordering::Release);
            let (lock, condvar) = &*self.bg_wake;
            *lock.lock() = true;
            condvar.notify_all();
            // the last reference can die on the background thread itself
            if task.handle.thread().id() != std::thread::current().id() {
                let _ = task.handle.join();
            }
        }
        if self.base.closed.load(Ordering::Acquire)
            || self.config.read_only
            || self.base.panicked.load(Ordering::Acquire)
        {
            return;
        }
        // best-effort clean shutdown for stores dropped without close()
        let guard = self.state.lock();
        if let Ok(mut state) = guard.try_borrow_mut() {
            if self.store_now(&mut state).is_ok() {
                state.header.clean = true;
                state.header.version = self.base.current_version.load(Ordering::Acquire);
                let _ = self.base.file.write_store_header(&state.header);
                let _ = self.base.file.sync();
            }
        }
    }
}

impl StoreShared {
    pub(crate) fn wake_background(&self) {
        let (lock, condvar) = &*self.bg_wake;
        *lock.lock() = true;
        condvar.notify_all();
    }

    fn background_pass(self: &Arc<Self>) -> Result<()> {
        if self.has_unsaved_changes() {
            self.commit_internal()?;
        }
        if self.config.auto_compact_fill_rate > 0 {
            self.auto_compact()?;
        }
        Ok(())
    }

    pub(crate) fn has_unsaved_changes(&self) -> bool {
        self.layout.has_unsaved()
            || self.meta.has_unsaved()
            || self.maps.read().values().any(|m| m.has_unsaved())
    }

    fn open_map<K: DataType, V: DataType>(
        &self,
        name: &str,
        key_type: K,
        value_type: V,
        single_writer: bool,
    ) -> Result<MvMap<K, V>> {
        if self.base.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let writable = !self.config.read_only;
        let type_config = format!("key:{},value:{}", key_type.type_name(), value_type.type_name());

        if let Some(id_hex) = self.meta.get(&meta_name_key(name))? {
            let id = parse_hex_u32(&id_hex)?;
            let recorded = self.meta.get(&meta_map_key(id))?.unwrap_or_default();
            if recorded != type_config {
                return Err(StoreError::UnsupportedOperation(format!(
                    "map {name:?} was created as {recorded:?}, not {type_config:?}"
                )));
            }
            if let Some(existing) = self.maps.read().get(&id) {
                return match existing.clone().as_any_arc().downcast::<MvMap<K, V>>() {
                    Ok(map) => Ok((*map).clone()),
                    Err(_) => Err(StoreError::UnsupportedOperation(format!(
                        "map {name:?} is already open with different types"
                    ))),
                };
            }
            let root = match self.layout.get(&layout_root_key(id))? {
                Some(hex) => parse_hex_u64(&hex)?,
                None => 0,
            };
            let map = MvMap::open(
                self.base.clone(),
                id,
                name,
                key_type,
                value_type,
                root,
                single_writer,
                writable,
            )?;
            self.maps
                .write()
                .insert(id, Arc::new(map.clone()) as Arc<dyn MapCommit>);
            return Ok(map);
        }

        if !writable {
            return Err(StoreError::UnsupportedOperation(format!(
                "map {name:?} does not exist in a read-only store"
            )));
        }
        let id = state.next_map_id;
        state.next_map_id += 1;
        self.meta
            .put(meta_name_key(name), format_hex_u64(id as u64))?;
        self.meta.put(meta_map_key(id), type_config)?;
        let map = MvMap::open(
            self.base.clone(),
            id,
            name,
            key_type,
            value_type,
            0,
            single_writer,
            writable,
        )?;
        self.maps
            .write()
            .insert(id, Arc::new(map.clone()) as Arc<dyn MapCommit>);
        Ok(map)
    }

    pub(crate) fn commit_internal(&self) -> Result<u64> {
        self.commit_with(false)
    }

    /// A commit that writes a chunk even without map changes, so that
    /// deferred accounting and dead-chunk reclamation make progress.
    pub(crate) fn commit_force(&self) -> Result<u64> {
        self.commit_with(true)
    }

    fn commit_with(&self, force: bool) -> Result<u64> {
        let guard = self.state.lock();
        // a commit triggered from inside a commit (back-pressure while the
        // layout map is being updated) must not re-enter
        let Ok(mut state) = guard.try_borrow_mut() else {
            return Ok(self.base.current_version.load(Ordering::Acquire));
        };
        if force {
            self.store_forced(&mut state)
        } else {
            self.store_now(&mut state)
        }
    }

    /// Write one chunk with all pending changes; the heart of the store.
    pub(crate) fn store_now(&self, state: &mut StoreState) -> Result<u64> {
        self.store_guarded(state, false)
    }

    pub(crate) fn store_forced(&self, state: &mut StoreState) -> Result<u64> {
        self.store_guarded(state, true)
    }

    fn store_guarded(&self, state: &mut StoreState, force: bool) -> Result<u64> {
        self.base.check_writable()?;
        let result = self.store_now_inner(state, force);
        if let Err(e) = &result {
            if e.is_panic() {
                self.base.panicked.store(true, Ordering::Release);
                *self.base.panic_cause.lock() = Some(e.to_string());
            }
        }
        result
    }

    fn store_now_inner(&self, state: &mut StoreState, force: bool) -> Result<u64> {
        let current = self.base.current_version.load(Ordering::Acquire);

        // fold append buffers in before capturing roots
        for map in self.maps.read().values() {
            map.flush_append()?;
        }
        self.meta.flush_append()?;

        let changed: Vec<Arc<dyn MapCommit>> = self
            .maps
            .read()
            .values()
            .filter(|m| m.has_unsaved())
            .cloned()
            .collect();
        let meta_changed = self.meta.has_unsaved();
        if !force && changed.is_empty() && !meta_changed && !self.layout.has_unsaved() {
            return Ok(current);
        }

        self.base.committing.store(true, Ordering::Release);
        let result = self.write_new_chunk(state, current, changed, meta_changed);
        self.base.committing.store(false, Ordering::Release);
        result
    }

    fn write_new_chunk(
        &self,
        state: &mut StoreState,
        current: u64,
        changed: Vec<Arc<dyn MapCommit>>,
        meta_changed: bool,
    ) -> Result<u64> {
        let version = current + 1;
        let chunk_id = next_chunk_id(state, &self.base)?;
        let mut chunk = Chunk::new(chunk_id, version);
        chunk.time = now_millis().saturating_sub(self.base.created.load(Ordering::Relaxed));

        let mut ctx = WriteContext::new(chunk_id);

        // serialize the user maps and register their new roots
        for map in &changed {
            let pos = map.write_root(&mut ctx)?;
            self.layout
                .put(layout_root_key(map.map_id()), format_hex_u64(pos))?;
        }
        if meta_changed {
            let pos = self.meta.write_root(&mut ctx)?;
            self.layout
                .put(layout_root_key(META_MAP_ID), format_hex_u64(pos))?;
        }

        // retire pages whose removal version left the retention window
        {
            let mut removed = self.base.removed_pages.lock();
            state.deferred_removed.append(&mut removed);
        }
        let oldest = self.base.oldest_version_to_keep();
        self.apply_deferred_removals(state, oldest);
        let freed_any = self.free_dead_chunks(state, oldest, chunk_id)?;

        // refresh layout metadata of chunks whose counters changed, and of
        // the previous chunk, whose entry now learns its final block
        if state.last_chunk_id != 0 {
            state.dirty_chunks.insert(state.last_chunk_id);
        }
        let dirty: Vec<u32> = state.dirty_chunks.drain().collect();
        let dirty_metadata: Vec<(u32, String)> = {
            let chunks = self.base.chunks.read();
            dirty
                .into_iter()
                .filter_map(|id| chunks.get(&id).map(|c| (id, c.collect_metadata())))
                .collect()
        };
        for (id, metadata) in dirty_metadata {
            self.layout.put(layout_chunk_key(id), metadata)?;
        }
        // the new chunk's own entry; its block is only discovered from the
        // chunk header until the next commit refreshes it
        self.layout
            .put(layout_chunk_key(chunk_id), chunk.collect_metadata())?;

        let layout_pos = self.layout.write_root(&mut ctx)?;
        chunk.layout_root = layout_pos;

        // finalize occupancy counters
        chunk.page_count = ctx.page_count;
        chunk.max_len = ctx.accounted_len;
        let dead_on_arrival = ctx.removed_while_writing.len() as u32;
        chunk.live_pages = ctx.page_count - dead_on_arrival;
        let mut dead_len = 0u64;
        for pos in &ctx.removed_while_writing {
            dead_len += position::accounted_length(*pos);
        }
        chunk.live_max = ctx.accounted_len.saturating_sub(dead_len);
        for map_id in &ctx.map_ids {
            chunk.mark_map(*map_id);
        }
        chunk.map_high_water = state.next_map_id - 1;

        // allocate blocks: header block + payload + footer block
        let payload_blocks = ctx.buf.len().div_ceil(BLOCK_SIZE) as u64;
        let blocks = payload_blocks + 2;
        let (reserved_low, reserved_high) = state.reserved.unwrap_or((0, 0));
        let end_before = state.free_space.last_used_block();
        let block = state
            .free_space
            .allocate(blocks, reserved_low, reserved_high);
        let at_end_of_file = block >= end_before;
        let prediction_missed =
            state.last_predicted_next != 0 && state.last_predicted_next != block;
        chunk.block = block;
        chunk.len = blocks;
        chunk.next = state
            .free_space
            .predict_allocation(blocks, reserved_low, reserved_high);
        state.last_predicted_next = chunk.next;

        // assemble and write: header, payload, padding, footer
        let mut bytes = Vec::with_capacity((blocks as usize) * BLOCK_SIZE);
        bytes.extend_from_slice(&chunk.write_header());
        bytes.extend_from_slice(&ctx.buf);
        bytes.resize((blocks as usize - 1) * BLOCK_SIZE, 0);
        bytes.extend_from_slice(&chunk.write_footer());
        self.base
            .file
            .write_fully(block * BLOCK_SIZE as u64, &bytes)?;
        self.base.file.sync()?;

        self.base.chunks.write().insert(chunk_id, chunk.clone());
        state.last_chunk_id = chunk_id;
        self.base.current_version.store(version, Ordering::Release);
        self.base.unsaved_memory.store(0, Ordering::Relaxed);

        // store-header rewrite conditions
        let version_gap = version.saturating_sub(state.header.version);
        if state.header.chunk == 0
            || !at_end_of_file
            || prediction_missed
            || version_gap >= HEADER_REWRITE_VERSION_GAP
            || freed_any
            || state.freed_chunk_since_header
            || state.clean_flag_pending_clear
        {
            state.header.chunk = chunk_id;
            state.header.block = block;
            state.header.version = version;
            state.header.clean = false;
            self.base.file.write_store_header(&state.header)?;
            self.base.file.sync()?;
            state.freed_chunk_since_header = false;
            state.clean_flag_pending_clear = false;
        }

        // shrink the retention chains
        let oldest_after = self.base.oldest_version_to_keep();
        self.layout.truncate_history(oldest_after);
        self.meta.truncate_history(oldest_after);
        for map in self.maps.read().values() {
            map.truncate_history(oldest_after);
        }

        debug!(
            "stored chunk {chunk_id} at block {block} ({blocks} blocks), version {version}, \
             {} pages",
            chunk.page_count
        );
        Ok(version)
    }

    fn apply_deferred_removals(&self, state: &mut StoreState, oldest: u64) {
        let mut chunks = self.base.chunks.write();
        let deferred = std::mem::take(&mut state.deferred_removed);
        for removed in deferred {
            // a removal at version v leaves the page readable below v, so
            // the accounting may only land once nobody can read below it
            if removed.version > oldest {
                state.deferred_removed.push(removed);
                continue;
            }
            let chunk_id = position::chunk_id(removed.pos);
            if let Some(chunk) = chunks.get_mut(&chunk_id) {
                chunk.live_pages = chunk.live_pages.saturating_sub(1);
                chunk.live_max = chunk
                    .live_max
                    .saturating_sub(position::accounted_length(removed.pos));
                state.dirty_chunks.insert(chunk_id);
            }
            self.base.cache.remove(removed.pos);
        }
    }

    /// Free chunks with no live pages once the retention window has moved
    /// past their write version.
    fn free_dead_chunks(
        &self,
        state: &mut StoreState,
        oldest: u64,
        current_chunk: u32,
    ) -> Result<bool> {
        let dead: Vec<Chunk> = {
            let chunks = self.base.chunks.read();
            chunks
                .values()
                .filter(|c| {
                    c.id != current_chunk
                        && c.id != state.last_chunk_id
                        && c.is_saved()
                        && !c.is_live()
                        && c.version < oldest
                })
                .cloned()
                .collect()
        };
        if dead.is_empty() {
            return Ok(false);
        }
        for chunk in &dead {
            debug!("freeing dead chunk {} at block {}", chunk.id, chunk.block);
            state.free_space.free(chunk.block, chunk.len);
            self.base.chunks.write().remove(&chunk.id);
            state.dirty_chunks.remove(&chunk.id);
            self.layout.remove(&layout_chunk_key(chunk.id))?;
        }
        state.freed_chunk_since_header = true;
        Ok(true)
    }
}

fn next_chunk_id(state: &StoreState, base: &StoreBase) -> Result<u32> {
    let chunks = base.chunks.read();
    let mut candidate = Chunk::next_id(state.last_chunk_id);
    let mut steps = 0u32;
    while chunks.contains_key(&candidate) {
        candidate = Chunk::next_id(candidate);
        steps += 1;
        if steps > position::MAX_CHUNK_ID {
            return Err(StoreError::Internal("no free chunk id".into()));
        }
    }
    Ok(candidate)
}

/// Read and validate the chunk whose header block sits at `block`.
pub(crate) fn read_chunk_at(file: &FileStore, block: u64) -> Result<Chunk> {
    let header_bytes = file.read_fully(block * BLOCK_SIZE as u64, BLOCK_SIZE)?;
    let chunk = Chunk::read_header(&header_bytes)?;
    if chunk.block != block || chunk.len < 2 {
        return Err(StoreError::FileCorrupt(format!(
            "chunk {} header claims block {}, found at {}",
            chunk.id, chunk.block, block
        )));
    }
    let footer_bytes = file.read_fully(
        (block + chunk.len - 1) * BLOCK_SIZE as u64,
        BLOCK_SIZE,
    )?;
    let footer = Chunk::read_footer(&footer_bytes)?;
    if !chunk.matches_footer(&footer) {
        return Err(StoreError::FileCorrupt(format!(
            "chunk {} footer does not match its header",
            chunk.id
        )));
    }
    Ok(chunk)
}

/// Follow `next` predictions from a known chunk to the newest one.
fn chase_forward(file: &FileStore, mut chunk: Chunk) -> Chunk {
    loop {
        if chunk.next == 0 {
            return chunk;
        }
        match read_chunk_at(file, chunk.next) {
            Ok(next) if next.version > chunk.version && next.id == Chunk::next_id(chunk.id) => {
                chunk = next;
            }
            _ => return chunk,
        }
    }
}

/// Crash recovery: scan the file backwards reading footers, collecting
/// every chunk whose footer and header agree.
fn backward_scan(file: &FileStore) -> Result<Vec<Chunk>> {
    let blocks = file.size()? / BLOCK_SIZE as u64;
    let mut found: Vec<Chunk> = Vec::new();
    let mut block = blocks;
    while block > 2 {
        block -= 1;
        let Ok(bytes) = file.read_fully(block * BLOCK_SIZE as u64, BLOCK_SIZE) else {
            continue;
        };
        let Ok(footer) = Chunk::read_footer(&bytes) else {
            continue;
        };
        if footer.block < 2 || footer.block > block {
            continue;
        }
        let Ok(chunk) = read_chunk_at(file, footer.block) else {
            continue;
        };
        if chunk.id == footer.id && chunk.block + chunk.len - 1 == block {
            found.push(chunk.clone());
            block = chunk.block;
        }
    }
    found.sort_by_key(|c| std::cmp::Reverse(c.version));
    Ok(found)
}
