//! Last deployed state per (device, application).

use apkswap_apk::Apk;
use exn::{ErrorExt, ResultExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::OverlayId;
use crate::error::{ErrorKind, Result};

/// Format version of the persisted file. Files with any other version are
/// ignored on load.
pub const DEPLOYMENT_CACHE_VERSION: u32 = 1;

/// What was last deployed to one application on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub apks: Vec<Apk>,
    pub overlay_id: OverlayId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    serial: String,
    application_id: String,
    #[serde(flatten)]
    entry: Entry,
}

impl Record {
    fn is(&self, serial: &str, application_id: &str) -> bool {
        self.serial == serial && self.application_id == application_id
    }
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

#[derive(Deserialize)]
struct Persisted {
    entries: VecDeque<Record>,
}

/// Bounded cache of deployment state, optionally persisted to a JSON file.
///
/// Entries are evicted least-recently-stored first. Reads do not refresh an
/// entry: only a new deployment does. Every mutation is written through to
/// the backing file before returning.
#[derive(Debug)]
pub struct DeploymentCache {
    capacity: usize,
    file: Option<PathBuf>,
    // Oldest first.
    records: Mutex<VecDeque<Record>>,
}

impl DeploymentCache {
    pub fn in_memory(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), file: None, records: Mutex::new(VecDeque::new()) }
    }

    /// Opens (or creates on first write) a cache persisted at `file`.
    ///
    /// A file written with another [`DEPLOYMENT_CACHE_VERSION`] loads as
    /// empty. A file that is not a deployment cache at all is an
    /// [`ErrorKind::InvalidData`] error.
    #[instrument(level = "debug", skip(file), fields(file = %file.as_ref().display()))]
    pub fn open(file: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let file = file.as_ref().to_path_buf();
        let mut cache = Self::in_memory(capacity);
        let mut records = Self::load(&file)?;
        while records.len() > cache.capacity {
            records.pop_front();
        }
        tracing::debug!(entries = records.len(), "Loaded deployment cache");
        cache.records = Mutex::new(records);
        cache.file = Some(file);
        Ok(cache)
    }

    fn load(file: &Path) -> Result<VecDeque<Record>> {
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
            Err(e) => return Err(e.raise().raise(ErrorKind::Io(file.to_path_buf()))),
        };
        let header: Header = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData("deployment cache"))?;
        if header.version != DEPLOYMENT_CACHE_VERSION {
            tracing::warn!(
                found = header.version,
                expected = DEPLOYMENT_CACHE_VERSION,
                "Deployment cache version mismatch; starting empty"
            );
            return Ok(VecDeque::new());
        }
        let persisted: Persisted =
            serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData("deployment cache"))?;
        Ok(persisted.entries)
    }

    /// Records the deployment, replacing any previous entry for the pair.
    pub fn store(&self, serial: &str, application_id: &str, apks: Vec<Apk>, overlay_id: OverlayId) -> Result<()> {
        let mut records = self.records.lock();
        records.retain(|record| !record.is(serial, application_id));
        records.push_back(Record {
            serial: serial.to_string(),
            application_id: application_id.to_string(),
            entry: Entry { apks, overlay_id },
        });
        while records.len() > self.capacity {
            if let Some(evicted) = records.pop_front() {
                tracing::debug!(serial = %evicted.serial, application_id = %evicted.application_id, "Evicted deployment");
            }
        }
        self.flush(&records)
    }

    pub fn get(&self, serial: &str, application_id: &str) -> Option<Entry> {
        let records = self.records.lock();
        records.iter().find(|record| record.is(serial, application_id)).map(|record| record.entry.clone())
    }

    /// Forgets the pair. Returns whether an entry existed.
    pub fn invalidate(&self, serial: &str, application_id: &str) -> Result<bool> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| !record.is(serial, application_id));
        if records.len() == before {
            return Ok(false);
        }
        self.flush(&records)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Atomically replaces the backing file; called with the lock held so
    /// writes land in mutation order.
    fn flush(&self, records: &VecDeque<Record>) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let dir = file.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).or_raise(|| ErrorKind::Io(dir.to_path_buf()))?;
        let temp = tempfile::NamedTempFile::new_in(dir).or_raise(|| ErrorKind::Io(dir.to_path_buf()))?;
        let mut writer = BufWriter::new(temp);
        serde_json::to_writer(&mut writer, &PersistedRef { version: DEPLOYMENT_CACHE_VERSION, entries: records })
            .or_raise(|| ErrorKind::InvalidData("deployment cache"))?;
        writer.flush().or_raise(|| ErrorKind::Io(file.clone()))?;
        let temp = writer.into_inner().map_err(|e| e.into_error().raise().raise(ErrorKind::Io(file.clone())))?;
        temp.persist(file).map_err(|e| e.error.raise().raise(ErrorKind::Io(file.clone())))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    entries: &'a VecDeque<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn apk(name: &str, checksum: &str) -> Apk {
        Apk {
            name: name.into(),
            checksum: checksum.into(),
            path: None,
            entries: [("classes.dex".to_string(), 7)].into_iter().collect(),
        }
    }

    fn store(cache: &DeploymentCache, serial: &str, app: &str, checksum: &str) {
        let apks = vec![apk("base.apk", checksum)];
        let overlay = OverlayId::base_install(&apks);
        cache.store(serial, app, apks, overlay).unwrap();
    }

    fn checksum(cache: &DeploymentCache, serial: &str, app: &str) -> Option<String> {
        cache.get(serial, app).map(|entry| entry.apks[0].checksum.clone())
    }

    #[test]
    fn least_recently_stored_pair_is_evicted() {
        let cache = DeploymentCache::in_memory(3);
        store(&cache, "emulator-5554", "com.a", "1");
        store(&cache, "emulator-5554", "com.b", "2");
        store(&cache, "emulator-5556", "com.a", "3");
        store(&cache, "emulator-5556", "com.b", "4");
        assert_eq!(cache.len(), 3);
        assert_eq!(checksum(&cache, "emulator-5554", "com.a"), None);
        assert_eq!(checksum(&cache, "emulator-5554", "com.b").as_deref(), Some("2"));
        assert_eq!(checksum(&cache, "emulator-5556", "com.a").as_deref(), Some("3"));
        assert_eq!(checksum(&cache, "emulator-5556", "com.b").as_deref(), Some("4"));
    }

    #[test]
    fn restoring_a_pair_refreshes_it() {
        let cache = DeploymentCache::in_memory(2);
        store(&cache, "d", "com.a", "1");
        store(&cache, "d", "com.b", "2");
        store(&cache, "d", "com.a", "3");
        store(&cache, "d", "com.c", "4");
        assert_eq!(checksum(&cache, "d", "com.a").as_deref(), Some("3"));
        assert_eq!(checksum(&cache, "d", "com.b"), None);
    }

    #[rstest]
    #[case::same_app_other_device("other-device", "com.app")]
    #[case::same_device_other_app("device", "com.other")]
    fn pairs_are_independent(#[case] serial: &str, #[case] app: &str) {
        let cache = DeploymentCache::in_memory(10);
        store(&cache, "device", "com.app", "1");
        store(&cache, serial, app, "2");
        assert_eq!(checksum(&cache, "device", "com.app").as_deref(), Some("1"));
        assert_eq!(checksum(&cache, serial, app).as_deref(), Some("2"));
    }

    #[test]
    fn invalidate_removes_only_that_pair() {
        let cache = DeploymentCache::in_memory(10);
        store(&cache, "d", "com.a", "1");
        store(&cache, "d", "com.b", "2");
        assert!(cache.invalidate("d", "com.a").unwrap());
        assert!(!cache.invalidate("d", "com.a").unwrap());
        assert_eq!(cache.get("d", "com.a"), None);
        assert!(cache.get("d", "com.b").is_some());
    }

    #[test]
    fn persisted_entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("deployments.json");
        let cache = DeploymentCache::open(&file, 10).unwrap();
        store(&cache, "d", "com.a", "1");
        store(&cache, "d", "com.b", "2");
        let expected = cache.get("d", "com.a");
        drop(cache);

        let reopened = DeploymentCache::open(&file, 10).unwrap();
        assert_eq!(reopened.get("d", "com.a"), expected);
        assert_eq!(checksum(&reopened, "d", "com.b").as_deref(), Some("2"));
    }

    #[test]
    fn reopening_with_smaller_capacity_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("deployments.json");
        let cache = DeploymentCache::open(&file, 10).unwrap();
        store(&cache, "d", "com.a", "1");
        store(&cache, "d", "com.b", "2");
        drop(cache);

        let reopened = DeploymentCache::open(&file, 1).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("d", "com.b").is_some());
    }

    #[test]
    fn other_version_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("deployments.json");
        std::fs::write(&file, r#"{"version": 0, "entries": [{"whatever": true}]}"#).unwrap();
        let cache = DeploymentCache::open(&file, 10).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn corrupt_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("deployments.json");
        std::fs::write(&file, b"not json at all").unwrap();
        let err = DeploymentCache::open(&file, 10).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }
}
