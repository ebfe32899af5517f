//! Dex archives: the dex payload of an APK, as built on the host or as
//! remembered by the cache.
//!
//! A [`DexArchive`] is an ordered list of [`DexFile`]s. Host-resident files
//! carry their bytecode and derive per-class checksums from it on first use.
//! Cache-resident files carry only a [`DexFileIndex`](apkswap_cache::DexFileIndex)
//! and read their class checksums back from a
//! [`DexArchiveDatabase`](apkswap_cache::DexArchiveDatabase).
//!
//! Comparing the class checksums of the installed and the freshly built dex
//! file of the same name yields the classes a code swap has to redefine.

mod archive;
pub mod error;
mod file;
mod reader;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::archive::{DexArchive, archive_checksum, checksum_of};
pub use crate::file::{CachedDex, DexFile, HostDex};
pub use crate::reader::{class_checksums, class_name};
