//! Works out which classes a code swap has to redefine.

use apkswap_apk::{Apk, FileDiff};
use apkswap_cache::{ClassChecksums, DatabaseHandle};
use apkswap_dex::{DexArchive, checksum_of};
use exn::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// A dex file with classes to redefine, and the bytecode that defines them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedDex {
    pub apk: String,
    pub name: String,
    pub code: Arc<[u8]>,
    /// Modified and added classes, sorted.
    pub classes: Vec<String>,
}

/// Compares installed dex files, as remembered by the dex archive cache,
/// with freshly built ones.
#[derive(Debug, Clone)]
pub struct DexComparator {
    db: DatabaseHandle,
}

impl DexComparator {
    pub fn new(db: DatabaseHandle) -> Self {
        Self { db }
    }

    /// Class changes behind every modified dex file in `dex_diffs`.
    ///
    /// The installed side is read from the cached archive of the installed
    /// APK, or failing that from the dex file registered under the installed
    /// CRC. When neither is known the device holds code this host never
    /// built, which is a [`ErrorKind::RemoteApkNotFoundInDb`] error.
    ///
    /// Classes that disappeared are left alone: nothing references them once
    /// the new code is in place. Dex files whose classes are all unchanged
    /// are left out of the result.
    #[instrument(level = "debug", skip_all, fields(dex_files = dex_diffs.len()))]
    pub async fn compare(&self, installed: &[Apk], local: &[Apk], dex_diffs: &[FileDiff]) -> Result<Vec<ChangedDex>> {
        let mut archives: HashMap<&str, (Option<DexArchive>, DexArchive)> = HashMap::new();
        let mut changed = Vec::new();
        for diff in dex_diffs {
            if !archives.contains_key(diff.apk.as_str()) {
                let archives_for_apk = self.archives(installed, local, &diff.apk).await?;
                archives.insert(diff.apk.as_str(), archives_for_apk);
            }
            let Some((cached, built)) = archives.get(diff.apk.as_str()) else {
                continue;
            };

            let before = self.installed_classes(cached.as_ref(), diff).await?;
            let file = built.file(&diff.entry).ok_or_raise(|| ErrorKind::Parse(format!("{}/{}", diff.apk, diff.entry)))?;
            let after = file.class_checksums().await.or_raise(|| ErrorKind::Parse(file.name().to_string()))?;

            let mut classes: Vec<String> = after
                .iter()
                .filter(|(name, checksum)| before.get(*name) != Some(*checksum))
                .map(|(name, _)| name.clone())
                .collect();
            if classes.is_empty() {
                tracing::debug!(apk = %diff.apk, dex = %diff.entry, "No class changes");
                continue;
            }
            classes.sort_unstable();
            let code = file.code().or_raise(|| ErrorKind::Internal(file.name().to_string()))?;
            changed.push(ChangedDex { apk: diff.apk.clone(), name: diff.entry.clone(), code: Arc::from(code), classes });
        }
        Ok(changed)
    }

    /// The cached archive of the installed APK, if any, and the archive of the
    /// local build.
    async fn archives(&self, installed: &[Apk], local: &[Apk], apk: &str) -> Result<(Option<DexArchive>, DexArchive)> {
        let built = local.iter().find(|candidate| candidate.name == apk);
        let built = built.ok_or_raise(|| ErrorKind::Internal(format!("no local APK named {apk}")))?;
        let built = DexArchive::from_apk(built).or_raise(|| ErrorKind::Parse(apk.to_string()))?;

        let cached = match installed.iter().find(|candidate| candidate.name == apk) {
            Some(apk) => DexArchive::from_cache(&self.db, checksum_of(apk)).await.or_raise(|| ErrorKind::Cache)?,
            None => None,
        };
        Ok((cached, built))
    }

    async fn installed_classes(&self, cached: Option<&DexArchive>, diff: &FileDiff) -> Result<Arc<ClassChecksums>> {
        let not_found = || ErrorKind::RemoteApkNotFoundInDb(format!("{}/{}", diff.apk, diff.entry));
        let crc = diff.old_crc.ok_or_raise(not_found)?;
        if let Some(file) = cached.and_then(|archive| archive.file(&diff.entry))
            && file.checksum() == u64::from(crc)
        {
            let classes = file.class_checksums().await.or_raise(|| ErrorKind::Cache)?;
            if !classes.is_empty() {
                return Ok(classes);
            }
        }
        let index = self.db.dex_file_index(u64::from(crc)).await.or_raise(|| ErrorKind::Cache)?;
        let index = index.ok_or_raise(not_found)?;
        let classes = self.db.class_checksums(index).await.or_raise(|| ErrorKind::Cache)?;
        if classes.is_empty() {
            exn::bail!(not_found());
        }
        Ok(Arc::new(classes))
    }
}
