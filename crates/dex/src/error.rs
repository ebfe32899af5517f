//! Dex Error Types

use derive_more::{Display, Error};

/// A dex error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for dex operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The dex file structure is broken or uses a layout we do not read.
    #[display("malformed dex file: {_0}")]
    Malformed(#[error(not(source))] String),
    /// The APK could not be opened as a zip archive.
    #[display("could not read dex files from archive")]
    Archive,
    /// Bytecode was requested from a dex file that only exists as cache rows.
    #[display("bytecode of {_0} is not available from the cache")]
    CodeUnavailable(#[error(not(source))] String),
    #[display("dex archive cache error")]
    Cache,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cache)
    }
}
