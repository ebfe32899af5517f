//! APK Error Types
//!
//! Parse failures carry the offending path or a short description of the
//! broken structure. Missing entries in a lookup are never errors here; they
//! are reported as `None` or an empty map by the callers.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An APK parsing or diffing error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for APK operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The archive or dump file does not exist.
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The file exists but could not be read into memory.
    #[display("could not read file: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// The bytes do not form a central directory we understand.
    #[display("malformed zip central directory: {_0}")]
    Malformed(#[error(not(source))] String),
    /// The APK has no local file backing it (it was read from a device dump).
    #[display("no local file for APK: {_0}")]
    MissingPath(#[error(not(source))] String),
    #[display("different number of APKs: installed {installed}, local {local}")]
    DifferentNumberOfApks { installed: usize, local: usize },
    #[display("APK names do not match installed APKs: {_0}")]
    DifferentApkNames(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
