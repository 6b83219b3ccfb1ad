use thiserror::Error;

/// Primary error type for Coffer storage operations.
///
/// Structured variants for the conditions the storage layer can actually
/// surface, plus an `Internal` catch-all for invariant breaks that should
/// never be observed by callers.
#[derive(Error, Debug)]
pub enum CofferError {
    /// The database file is corrupt. Callers are expected to abort the
    /// current transaction and mark the database non-writable.
    #[error("corrupt database: {detail}")]
    Corrupt { detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk I/O error while reading a page.
    #[error("disk I/O error reading page {page}")]
    IoRead { page: u64 },

    /// Disk I/O error while writing a page.
    #[error("disk I/O error writing page {page}")]
    IoWrite { page: u64 },

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The database is full (page allocation failed).
    #[error("database is full")]
    DatabaseFull,

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CofferError {
    /// Create a corrupt-database error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error indicates a corrupt database image.
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result type alias using `CofferError`.
pub type Result<T> = std::result::Result<T, CofferError>;
