use derive_more::Display;
use std::collections::{BTreeSet, HashMap};

use crate::apk::Apk;
use crate::error::{ErrorKind, Result};

/// How an entry changed between two versions of a package.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[display("created")]
    Created,
    #[display("modified")]
    Modified,
    #[display("deleted")]
    Deleted,
}

/// Entry name to change status. Iteration order is unspecified.
pub type PackageDiff = HashMap<String, Status>;

/// Compares two CRC mappings of the same package.
///
/// - `Deleted`: present in `before` only.
/// - `Created`: present in `after` only.
/// - `Modified`: present in both with different CRCs.
///
/// An empty `before` means every entry of `after` is `Created`. Callers that
/// dump a device must treat "nothing installed" as its own condition rather
/// than diffing against an empty map.
pub fn diff(before: &HashMap<String, u32>, after: &HashMap<String, u32>) -> PackageDiff {
    let mut changes = PackageDiff::new();
    for (name, crc) in before {
        match after.get(name) {
            None => {
                changes.insert(name.clone(), Status::Deleted);
            }
            Some(other) if other != crc => {
                changes.insert(name.clone(), Status::Modified);
            }
            Some(_) => {}
        }
    }
    for name in after.keys().filter(|name| !before.contains_key(*name)) {
        changes.insert(name.clone(), Status::Created);
    }
    changes
}

/// A single changed entry within one APK of a split package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub apk: String,
    pub entry: String,
    pub status: Status,
    pub old_crc: Option<u32>,
    pub new_crc: Option<u32>,
}

impl FileDiff {
    pub fn is_dex(&self) -> bool {
        is_dex_entry(&self.entry)
    }
}

/// Diffs every installed APK against the local APK of the same name.
///
/// Both sides must contain the same set of APK names; a package whose split
/// layout changed cannot be compared entry by entry. The result is ordered by
/// APK name, then entry name.
pub fn diff_apks(installed: &[Apk], local: &[Apk]) -> Result<Vec<FileDiff>> {
    if installed.len() != local.len() {
        exn::bail!(ErrorKind::DifferentNumberOfApks {
            installed: installed.len(),
            local: local.len(),
        });
    }
    let installed_names: BTreeSet<&str> = installed.iter().map(|apk| apk.name.as_str()).collect();
    let local_names: BTreeSet<&str> = local.iter().map(|apk| apk.name.as_str()).collect();
    if installed_names != local_names {
        let mismatched: Vec<&str> = installed_names.symmetric_difference(&local_names).copied().collect();
        exn::bail!(ErrorKind::DifferentApkNames(mismatched.join(", ")));
    }

    let mut diffs = Vec::new();
    for new in local {
        let Some(old) = installed.iter().find(|apk| apk.name == new.name) else {
            continue;
        };
        if old.checksum == new.checksum {
            continue;
        }
        for (entry, status) in diff(&old.entries, &new.entries) {
            diffs.push(FileDiff {
                apk: new.name.clone(),
                old_crc: old.entries.get(&entry).copied(),
                new_crc: new.entries.get(&entry).copied(),
                entry,
                status,
            });
        }
    }
    diffs.sort_by(|a, b| (&a.apk, &a.entry).cmp(&(&b.apk, &b.entry)));
    tracing::debug!(apks = local.len(), changes = diffs.len(), "Compared installed and local APKs");
    Ok(diffs)
}

/// `true` for dex files at the root of an archive (`classes.dex`, `classes2.dex`, ...).
pub fn is_dex_entry(name: &str) -> bool {
    !name.contains('/') && name.ends_with(".dex")
}
