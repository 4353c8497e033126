use std::path::PathBuf;
use std::sync::Arc;

use storage::StoreError;

/// Callback for failures in background work (auto-commit, compaction).
pub type BackgroundExceptionHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Page compression codec selector. Codecs are external collaborators; the
/// setting is validated and recorded, and the page type byte reserves the
/// compression bits for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Fast,
    High,
}

/// Store configuration. Construct with [`StoreConfig::new`] and chain the
/// builder methods; unset keys keep their defaults.
#[derive(Clone)]
pub struct StoreConfig {
    /// Backing file path; `None` keeps the store in memory.
    pub file_name: Option<PathBuf>,
    /// Open shared read-only.
    pub read_only: bool,
    /// Maximum keys per page; at least 2.
    pub keys_per_page: usize,
    /// Maximum page memory before splitting, in bytes.
    pub page_split_size: usize,
    /// Unsaved memory in KB before a background commit is triggered.
    pub auto_commit_buffer_size: usize,
    /// Background commit interval in milliseconds; 0 disables the
    /// background task.
    pub auto_commit_delay: u64,
    /// Target chunk fill rate percentage for automatic compaction; 0
    /// disables it.
    pub auto_compact_fill_rate: u32,
    pub compress: Compression,
    /// Page cache size in MB.
    pub cache_size: usize,
    /// Page cache shard count.
    pub cache_concurrency: usize,
    /// Tolerate a partially recoverable file on open.
    pub recovery_mode: bool,
    /// Retained snapshot count.
    pub versions_to_keep: u64,
    pub background_exception_handler: Option<BackgroundExceptionHandler>,
}

impl StoreConfig {
    pub fn new() -> Self {
        StoreConfig {
            file_name: None,
            read_only: false,
            keys_per_page: 48,
            page_split_size: 16 * 1024,
            auto_commit_buffer_size: 1024,
            auto_commit_delay: 1000,
            auto_compact_fill_rate: 90,
            compress: Compression::None,
            cache_size: 16,
            cache_concurrency: 16,
            recovery_mode: false,
            versions_to_keep: 5,
            background_exception_handler: None,
        }
    }

    pub fn file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn keys_per_page(mut self, keys_per_page: usize) -> Self {
        self.keys_per_page = keys_per_page;
        self
    }

    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    pub fn auto_commit_buffer_size(mut self, kb: usize) -> Self {
        self.auto_commit_buffer_size = kb;
        self
    }

    pub fn auto_commit_delay(mut self, millis: u64) -> Self {
        self.auto_commit_delay = millis;
        self
    }

    pub fn auto_compact_fill_rate(mut self, percent: u32) -> Self {
        self.auto_compact_fill_rate = percent;
        self
    }

    pub fn compress(mut self, compress: Compression) -> Self {
        self.compress = compress;
        self
    }

    pub fn cache_size(mut self, megabytes: usize) -> Self {
        self.cache_size = megabytes;
        self
    }

    pub fn cache_concurrency(mut self, shards: usize) -> Self {
        self.cache_concurrency = shards;
        self
    }

    pub fn recovery_mode(mut self, recovery_mode: bool) -> Self {
        self.recovery_mode = recovery_mode;
        self
    }

    pub fn versions_to_keep(mut self, versions: u64) -> Self {
        self.versions_to_keep = versions;
        self
    }

    pub fn background_exception_handler(mut self, handler: BackgroundExceptionHandler) -> Self {
        self.background_exception_handler = Some(handler);
        self
    }

    pub(crate) fn validate(&self) -> storage::Result<()> {
        if self.keys_per_page < 2 {
            return Err(StoreError::IllegalArgument(format!(
                "keys_per_page must be at least 2, got {}",
                self.keys_per_page
            )));
        }
        if self.cache_concurrency == 0 {
            return Err(StoreError::IllegalArgument(
                "cache_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Unsaved bytes that trigger a background commit.
    pub(crate) fn auto_commit_memory(&self) -> usize {
        self.auto_commit_buffer_size * 1024
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
