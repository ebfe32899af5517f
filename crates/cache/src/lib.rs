//! Caches backing incremental deployment.
//!
//! Neither store is a source of truth. Deleting either one only costs the
//! next deployment some extra work: a full dump of the device, or a fresh
//! class-by-class comparison of a dex file.
//!
//! # Architecture
//! - **Dex archives** ([`DexArchiveDatabase`]): a SQLite store mapping the
//!   checksum of a package's dex payload to its ordered dex files, and each
//!   dex file to the checksums of the classes it defines. Bounded, evicting
//!   the oldest dex file first. [`WorkQueueDatabase`] serializes writes to it.
//! - **Deployments** ([`DeploymentCache`]): the APKs most recently deployed to
//!   each (device, application) pair, with the [`OverlayId`] describing what
//!   has been swapped on top of the last full install.

mod db;
mod deployment;
pub mod error;
mod models;
mod overlay;
mod queue;
mod repo;

use async_trait::async_trait;
use derive_more::Display;
use std::collections::HashMap;
use std::sync::Arc;

pub use crate::db::{Database, SCHEMA_VERSION};
pub use crate::deployment::{DEPLOYMENT_CACHE_VERSION, DeploymentCache, Entry};
use crate::error::Result;
pub use crate::overlay::OverlayId;
pub use crate::queue::WorkQueueDatabase;
pub use crate::repo::Repository;

/// Shared, type-erased handle to a dex archive store.
pub type DatabaseHandle = Arc<dyn DexArchiveDatabase>;

/// Class name (`com.example.Foo`) to class checksum.
pub type ClassChecksums = HashMap<String, u64>;

/// Row identifier of a dex file. Allocated from 1 upwards and never reused.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct DexFileIndex(pub(crate) i64);

impl DexFileIndex {
    pub fn get(self) -> i64 {
        self.0
    }
}

/// A dex file as recorded in an archive's ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexFileEntry {
    pub index: DexFileIndex,
    pub checksum: u64,
    pub name: String,
}

/// Checksum-indexed storage of dex archives and their class checksums.
///
/// Misses are reported as `None` or empty collections, never as errors.
/// Implementations are not required to serialize concurrent writers
/// themselves; wrap them in a [`WorkQueueDatabase`] when several tasks write
/// at once.
#[async_trait]
pub trait DexArchiveDatabase: Send + Sync + std::fmt::Debug {
    /// Registers a dex file, returning the existing index when the same
    /// checksum and name are already known. May evict the oldest dex file.
    async fn add_dex_file(&self, checksum: u64, name: &str) -> Result<DexFileIndex>;

    /// Most recently registered dex file with this checksum.
    async fn dex_file_index(&self, checksum: u64) -> Result<Option<DexFileIndex>>;

    /// Atomically replaces the ordered dex file list of an archive.
    async fn fill_dex_file_list(&self, archive_checksum: u64, indices: &[DexFileIndex]) -> Result<()>;

    /// Registers every dex file of an archive and records their order, in one
    /// step. Eviction never removes a dex file of this archive, so the list is
    /// complete when this returns. Fails when the archive alone would exceed
    /// the store's capacity.
    async fn add_archive(&self, archive_checksum: u64, files: &[(u64, String)]) -> Result<Vec<DexFileIndex>>;

    /// The archive's dex files in the order they were recorded. Empty when the
    /// archive is unknown or one of its dex files has been evicted.
    async fn dex_files(&self, archive_checksum: u64) -> Result<Vec<DexFileEntry>>;

    /// Replaces the class checksums of a dex file.
    async fn fill_class_checksums(&self, index: DexFileIndex, classes: &ClassChecksums) -> Result<()>;

    /// Class checksums of a dex file; empty when the index is unknown.
    async fn class_checksums(&self, index: DexFileIndex) -> Result<ClassChecksums>;
}
