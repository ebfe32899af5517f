use apkswap_apk::{Apk, is_dex_entry};
use apkswap_cache::error::ErrorKind as CacheErrorKind;
use apkswap_cache::{DatabaseHandle, DexArchiveDatabase};
use exn::ResultExt;
use std::io::{Cursor, Read};
use tracing::instrument;

use crate::DexFile;
use crate::error::{ErrorKind, Result};
use crate::reader::truncate;

/// The dex payload of one APK: its dex files in build order, identified as a
/// whole by [`archive_checksum`].
#[derive(Debug, Clone)]
pub struct DexArchive {
    checksum: u64,
    files: Vec<DexFile>,
}

impl DexArchive {
    /// Reads every dex file at the root of the zip `archive` into memory.
    ///
    /// Each file is keyed by its name and its CRC32 from the zip entry.
    #[instrument(level = "debug", skip_all, fields(checksum = %format_args!("{checksum:016x}")))]
    pub fn from_host(archive: &[u8], checksum: u64) -> Result<Self> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).or_raise(|| ErrorKind::Archive)?;
        let mut files = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).or_raise(|| ErrorKind::Archive)?;
            if !entry.is_file() || !is_dex_entry(entry.name()) {
                continue;
            }
            let name = entry.name().to_string();
            let crc = entry.crc32();
            let mut code = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
            entry.read_to_end(&mut code).or_raise(|| ErrorKind::Archive)?;
            files.push(DexFile::host(name, u64::from(crc), code));
        }
        files.sort_by(|a, b| build_order(a.name()).cmp(&build_order(b.name())));
        tracing::debug!(dex_files = files.len(), "Read dex archive from host");
        Ok(Self { checksum, files })
    }

    /// Reads the dex payload of a local APK.
    pub fn from_apk(apk: &Apk) -> Result<Self> {
        let bytes = apk.read().or_raise(|| ErrorKind::Archive)?;
        Self::from_host(&bytes, checksum_of(apk))
    }

    /// Materializes the cached archive with this checksum, if the cache still
    /// holds every one of its dex files.
    pub async fn from_cache(db: &DatabaseHandle, checksum: u64) -> Result<Option<Self>> {
        let entries = db.dex_files(checksum).await.or_raise(|| ErrorKind::Cache)?;
        if entries.is_empty() {
            return Ok(None);
        }
        let files = entries.into_iter().map(|entry| DexFile::cached(entry, db.clone())).collect();
        Ok(Some(Self { checksum, files }))
    }

    /// Records every dex file together with the ordered list under the archive
    /// checksum.
    ///
    /// Caching the same archive again reuses the existing dex file rows and
    /// rewrites an identical list. Class checksums of host-resident files are
    /// only computed when the cache has none for that dex file yet.
    #[instrument(level = "debug", skip_all, fields(checksum = %format_args!("{:016x}", self.checksum)))]
    pub async fn cache(&self, db: &dyn DexArchiveDatabase) -> Result<()> {
        let files: Vec<(u64, String)> = self.files.iter().map(|file| (file.checksum(), file.name().to_string())).collect();
        let indices = db.add_archive(self.checksum, &files).await.or_raise(|| ErrorKind::Cache)?;
        for (file, index) in self.files.iter().zip(&indices) {
            if !file.is_host_resident() || !db.class_checksums(*index).await.or_raise(|| ErrorKind::Cache)?.is_empty() {
                continue;
            }
            let classes = file.class_checksums().await?;
            match db.fill_class_checksums(*index, &classes).await {
                Ok(()) => {}
                // A concurrent write evicted the row; the archive is gone with it.
                Err(e) if matches!(&*e, CacheErrorKind::UnknownDexFile(_)) => {
                    tracing::debug!(%index, "Dex file evicted before its classes were recorded");
                    return Ok(());
                }
                Err(e) => return Err(e.raise(ErrorKind::Cache)),
            }
        }
        tracing::debug!(dex_files = indices.len(), "Cached dex archive");
        Ok(())
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn files(&self) -> &[DexFile] {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&DexFile> {
        self.files.iter().find(|file| file.name() == name)
    }
}

/// Identifies a dex payload by its dex file names and checksums.
///
/// The result does not depend on the order of `files`; they are hashed in
/// build order. Any change to a dex file's content changes its CRC and so
/// the archive checksum.
pub fn archive_checksum<'a>(files: impl IntoIterator<Item = (&'a str, u64)>) -> u64 {
    let mut files: Vec<(&str, u64)> = files.into_iter().collect();
    files.sort_by(|a, b| build_order(a.0).cmp(&build_order(b.0)));
    let mut hasher = blake3::Hasher::new();
    for (name, checksum) in files {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&checksum.to_le_bytes());
    }
    truncate(hasher.finalize())
}

/// Archive checksum of an APK, from its central directory alone. A device
/// dump and the local build of the same APK agree on it.
pub fn checksum_of(apk: &Apk) -> u64 {
    archive_checksum(apk.dex_entries().into_iter().map(|(name, crc)| (name, u64::from(crc))))
}

/// `classes.dex`, `classes2.dex`, `classes3.dex`, ... then anything else by name.
fn build_order(name: &str) -> (u32, &str) {
    let position = name.strip_prefix("classes").and_then(|rest| rest.strip_suffix(".dex")).and_then(|n| {
        if n.is_empty() { Some(1) } else { n.parse::<u32>().ok().filter(|n| *n > 1) }
    });
    (position.unwrap_or(u32::MAX), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DexBuilder, zip};
    use apkswap_cache::{Database, Repository, WorkQueueDatabase};
    use rstest::rstest;
    use std::sync::Arc;

    fn sample() -> Vec<u8> {
        let main = DexBuilder::new().class("com.example.Main", &[("onCreate", &[0x0e00])]).build();
        let second = DexBuilder::new()
            .class("com.example.Util", &[("help", &[0x0e00])])
            .class("com.example.Other", &[("other", &[0x1200, 0x0e00])])
            .build();
        let third = DexBuilder::new().class("com.example.Late", &[]).build();
        zip(&[
            ("AndroidManifest.xml", &b"<manifest/>"[..]),
            ("classes10.dex", &third[..]),
            ("classes2.dex", &second[..]),
            ("res/raw/classes.dex", &b"not code"[..]),
            ("classes.dex", &main[..]),
        ])
        .unwrap()
    }

    async fn repository() -> DatabaseHandle {
        let db = Database::connect_in_memory().await.unwrap();
        Arc::new(Repository::new(&db, 100))
    }

    #[test]
    fn host_archive_holds_root_dex_files_in_build_order() {
        let archive = DexArchive::from_host(&sample(), 9).unwrap();
        let names: Vec<&str> = archive.files().iter().map(DexFile::name).collect();
        assert_eq!(names, ["classes.dex", "classes2.dex", "classes10.dex"]);
        assert!(archive.files().iter().all(DexFile::is_host_resident));
        assert_eq!(archive.checksum(), 9);
    }

    #[test]
    fn dex_file_checksum_is_the_entry_crc() {
        let archive = DexArchive::from_host(&sample(), 9).unwrap();
        let file = archive.file("classes2.dex").unwrap();
        assert_eq!(file.checksum(), u64::from(crc32fast::hash(file.code().unwrap())));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let err = DexArchive::from_host(b"definitely not a zip", 1).unwrap_err();
        assert_eq!(*err, ErrorKind::Archive);
    }

    #[rstest]
    #[case("classes.dex", "classes2.dex")]
    #[case("classes2.dex", "classes10.dex")]
    #[case("classes99.dex", "extra.dex")]
    #[case("classes1.dex", "classesX.dex")]
    fn build_order_ranks(#[case] earlier: &str, #[case] later: &str) {
        assert!(build_order(earlier) < build_order(later));
    }

    #[test]
    fn archive_checksum_ignores_input_order_but_not_content() {
        let a = archive_checksum([("classes.dex", 1), ("classes2.dex", 2)]);
        assert_eq!(a, archive_checksum([("classes2.dex", 2), ("classes.dex", 1)]));
        assert_ne!(a, archive_checksum([("classes.dex", 1), ("classes2.dex", 3)]));
        assert_ne!(a, archive_checksum([("classes.dex", 2), ("classes2.dex", 1)]));
    }

    #[tokio::test]
    async fn unknown_checksum_is_not_cached() {
        let db = repository().await;
        assert!(DexArchive::from_cache(&db, 1234).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cached_archive_matches_host_archive() {
        let db = repository().await;
        let host = DexArchive::from_host(&sample(), 77).unwrap();
        host.cache(&*db).await.unwrap();

        let cached = DexArchive::from_cache(&db, 77).await.unwrap().unwrap();
        assert_eq!(cached.files().len(), host.files().len());
        for (cached, host) in cached.files().iter().zip(host.files()) {
            assert!(!cached.is_host_resident());
            assert_eq!(cached.name(), host.name());
            assert_eq!(cached.checksum(), host.checksum());
            assert_eq!(cached.class_checksums().await.unwrap(), host.class_checksums().await.unwrap());
        }
    }

    #[tokio::test]
    async fn caching_twice_changes_nothing() {
        let db = repository().await;
        let archive = DexArchive::from_host(&sample(), 77).unwrap();
        archive.cache(&*db).await.unwrap();
        let files = db.dex_files(77).await.unwrap();
        let mut classes = Vec::new();
        for file in &files {
            classes.push(db.class_checksums(file.index).await.unwrap());
        }

        archive.cache(&*db).await.unwrap();
        DexArchive::from_host(&sample(), 77).unwrap().cache(&*db).await.unwrap();
        assert_eq!(db.dex_files(77).await.unwrap(), files);
        for (file, expected) in files.iter().zip(&classes) {
            assert_eq!(&db.class_checksums(file.index).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn recaching_from_the_cache_keeps_class_checksums() {
        let db = repository().await;
        DexArchive::from_host(&sample(), 77).unwrap().cache(&*db).await.unwrap();
        let files = db.dex_files(77).await.unwrap();
        let expected = db.class_checksums(files[0].index).await.unwrap();
        assert!(!expected.is_empty());

        let cached = DexArchive::from_cache(&db, 77).await.unwrap().unwrap();
        cached.cache(&*db).await.unwrap();
        assert_eq!(db.dex_files(77).await.unwrap(), files);
        assert_eq!(db.class_checksums(files[0].index).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn rebuilt_archive_survives_a_full_cache() {
        let db = Database::connect_in_memory().await.unwrap();
        let db: DatabaseHandle = Arc::new(Repository::new(&db, 2));
        let stable = DexBuilder::new().class("com.example.Main", &[("onCreate", &[0x0e00])]).build();
        let build = |body: u16| {
            let changing = DexBuilder::new().class("com.example.Util", &[("help", &[body, 0x0e00])]).build();
            zip(&[("classes.dex", &stable[..]), ("classes2.dex", &changing[..])]).unwrap()
        };
        DexArchive::from_host(&build(0x1200), 1).unwrap().cache(&*db).await.unwrap();
        DexArchive::from_host(&build(0x1210), 2).unwrap().cache(&*db).await.unwrap();

        let cached = DexArchive::from_cache(&db, 2).await.unwrap().unwrap();
        assert_eq!(cached.files().len(), 2);
        let util = cached.file("classes2.dex").unwrap().class_checksums().await.unwrap();
        assert!(util.contains_key("com.example.Util"));
        assert!(DexArchive::from_cache(&db, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn caches_through_the_work_queue() {
        let queue = Arc::new(WorkQueueDatabase::new(repository().await));
        let archive = DexArchive::from_host(&sample(), 5).unwrap();
        let pending = queue.enqueue(move |db| async move { archive.cache(&*db).await });
        pending.await.unwrap().unwrap();

        let db: DatabaseHandle = queue;
        let cached = DexArchive::from_cache(&db, 5).await.unwrap().unwrap();
        let main = cached.file("classes.dex").unwrap().class_checksums().await.unwrap();
        assert!(main.contains_key("com.example.Main"));
    }
}
