use apkswap_cache::{ClassChecksums, DatabaseHandle, DexFileEntry, DexFileIndex};
use exn::ResultExt;
use std::sync::{Arc, OnceLock};

use crate::error::{ErrorKind, Result};
use crate::reader;

/// A dex file, either built on this host or known only through the cache.
///
/// Both variants expose a name, a checksum and the class checksums. Only a
/// host-resident file has bytecode.
#[derive(Debug, Clone)]
pub enum DexFile {
    HostResident(HostDex),
    CacheResident(CachedDex),
}

#[derive(Debug, Clone)]
pub struct HostDex {
    name: String,
    checksum: u64,
    code: Arc<[u8]>,
    // Shared between clones so the dex file is parsed at most once.
    classes: Arc<OnceLock<Arc<ClassChecksums>>>,
}

#[derive(Debug, Clone)]
pub struct CachedDex {
    name: String,
    checksum: u64,
    index: DexFileIndex,
    db: DatabaseHandle,
}

impl DexFile {
    pub fn host(name: impl Into<String>, checksum: u64, code: impl Into<Arc<[u8]>>) -> Self {
        Self::HostResident(HostDex {
            name: name.into(),
            checksum,
            code: code.into(),
            classes: Arc::default(),
        })
    }

    pub fn cached(entry: DexFileEntry, db: DatabaseHandle) -> Self {
        Self::CacheResident(CachedDex { name: entry.name, checksum: entry.checksum, index: entry.index, db })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::HostResident(dex) => &dex.name,
            Self::CacheResident(dex) => &dex.name,
        }
    }

    pub fn checksum(&self) -> u64 {
        match self {
            Self::HostResident(dex) => dex.checksum,
            Self::CacheResident(dex) => dex.checksum,
        }
    }

    /// The raw dex bytes.
    ///
    /// Cache-resident files never held their bytecode, so asking for it is an
    /// [`ErrorKind::CodeUnavailable`] error.
    pub fn code(&self) -> Result<&[u8]> {
        match self {
            Self::HostResident(dex) => Ok(&dex.code[..]),
            Self::CacheResident(dex) => exn::bail!(ErrorKind::CodeUnavailable(dex.name.clone())),
        }
    }

    /// Checksums of every class in this dex file.
    ///
    /// For a host-resident file the first call parses the whole file and later
    /// calls return the memoized result. For a cache-resident file this reads
    /// the cache, and an evicted file yields an empty map.
    pub async fn class_checksums(&self) -> Result<Arc<ClassChecksums>> {
        match self {
            Self::HostResident(dex) => dex.class_checksums(),
            Self::CacheResident(dex) => {
                let classes = dex.db.class_checksums(dex.index).await.or_raise(|| ErrorKind::Cache)?;
                Ok(Arc::new(classes))
            }
        }
    }

    pub fn is_host_resident(&self) -> bool {
        matches!(self, Self::HostResident(_))
    }
}

impl HostDex {
    fn class_checksums(&self) -> Result<Arc<ClassChecksums>> {
        if let Some(classes) = self.classes.get() {
            return Ok(classes.clone());
        }
        let computed = Arc::new(reader::class_checksums(&self.code)?);
        // A concurrent caller may have won the race; both results are identical.
        Ok(self.classes.get_or_init(|| computed).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DexBuilder;
    use apkswap_cache::{Database, DexArchiveDatabase, Repository};

    fn host(dex: Vec<u8>) -> DexFile {
        DexFile::host("classes.dex", 42, dex)
    }

    #[tokio::test]
    async fn host_class_checksums_are_computed_once() {
        let file = host(DexBuilder::new().class("a.A", &[("run", &[0x0e00])]).build());
        let DexFile::HostResident(dex) = &file else { unreachable!() };
        assert!(dex.classes.get().is_none());

        let first = file.class_checksums().await.unwrap();
        assert!(dex.classes.get().is_some());
        let second = file.clone().class_checksums().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.contains_key("a.A"));
    }

    #[tokio::test]
    async fn malformed_host_file_fails_on_first_access() {
        let file = host(b"not a dex file".to_vec());
        let err = file.class_checksums().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
        assert_eq!(file.code().unwrap(), b"not a dex file");
    }

    #[tokio::test]
    async fn cached_file_reads_classes_but_has_no_code() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo: DatabaseHandle = Arc::new(Repository::new(&db, 10));
        let index = repo.add_dex_file(7, "classes2.dex").await.unwrap();
        repo.fill_class_checksums(index, &[("a.A".to_string(), 1)].into_iter().collect()).await.unwrap();

        let file = DexFile::cached(DexFileEntry { index, checksum: 7, name: "classes2.dex".into() }, repo);
        assert_eq!(file.name(), "classes2.dex");
        assert_eq!(file.checksum(), 7);
        assert!(!file.is_host_resident());
        assert_eq!(file.class_checksums().await.unwrap()["a.A"], 1);

        let err = file.code().unwrap_err();
        assert_eq!(*err, ErrorKind::CodeUnavailable("classes2.dex".into()));
    }
}
