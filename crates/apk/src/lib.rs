//! APK inspection for incremental deployment.
//!
//! Everything here works from zip central directories: the CRC32 of each
//! entry is enough to tell which parts of a package changed between the copy
//! installed on a device and a fresh build on the host.

mod apk;
mod central;
mod diff;
pub mod error;

pub use crate::apk::{Apk, DUMP_EXTENSION};
pub use crate::central::{
    CENTRAL_DIRECTORY_SIGNATURE, CentralDirectory, END_OF_CENTRAL_DIRECTORY_SIGNATURE, locate_central_directory,
    parse_central_directory, read_central_directory,
};
pub use crate::diff::{FileDiff, PackageDiff, Status, diff, diff_apks, is_dex_entry};
