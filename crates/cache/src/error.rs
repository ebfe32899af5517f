//! Cache Error Types
//!
//! Cache misses are never errors: lookups return `Option` or empty
//! collections. These kinds only cover storage failures and corrupt data.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("could not prepare database schema")]
    Schema,
    /// A write referenced a dex file row that does not exist (or was evicted).
    #[display("unknown dex file index: {_0}")]
    UnknownDexFile(#[error(not(source))] i64),
    /// An archive has more dex files than the store may hold at once.
    #[display("archive of {_0} dex files exceeds the capacity of {_1}")]
    ArchiveTooLarge(#[error(not(source))] usize, #[error(not(source))] usize),
    /// The work queue consumer has stopped; no further updates can be applied.
    #[display("database work queue closed")]
    QueueClosed,
    #[display("could not access cache file: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // SQLITE_BUSY surfaces as a database error.
        matches!(self, Self::Database | Self::Io(_))
    }
}
