use thiserror::Error;

/// Error taxonomy of the store. Each variant carries a stable integer code
/// so callers can match on the class of failure without parsing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Checksum mismatch, bad page length, or wrong map id on read.
    #[error("file corrupt: {0}")]
    FileCorrupt(String),

    /// Another process holds the file lock.
    #[error("file locked: {0}")]
    FileLocked(String),

    #[error("reading failed: {context}")]
    ReadingFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("writing failed: {context}")]
    WritingFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Header write/read format out of the supported range.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Operation on a closed store or map.
    #[error("store or map is closed")]
    Closed,

    /// Caller contract violation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Write to a read-only store, type mismatch on reopen, and similar.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invariant violation. Raising this puts the store into panic mode.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn code(&self) -> u32 {
        match self {
            StoreError::FileCorrupt(_) => 1,
            StoreError::FileLocked(_) => 2,
            StoreError::ReadingFailed { .. } => 3,
            StoreError::WritingFailed { .. } => 4,
            StoreError::UnsupportedFormat(_) => 5,
            StoreError::Closed => 6,
            StoreError::IllegalArgument(_) => 7,
            StoreError::UnsupportedOperation(_) => 8,
            StoreError::Internal(_) => 9,
        }
    }

    /// Errors that must block further writes once observed.
    pub fn is_panic(&self) -> bool {
        matches!(
            self,
            StoreError::WritingFailed { .. } | StoreError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
