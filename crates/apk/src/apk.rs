use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::central::{self, CentralDirectory};
use crate::diff::is_dex_entry;
use crate::error::{ErrorKind, Result};

/// File extension of the central directory dumps written by the device installer.
pub const DUMP_EXTENSION: &str = "remotecd";

/// One APK of a (possibly split) package, reduced to its central directory.
///
/// The checksum is the blake3 hash of the raw central directory bytes, so an
/// APK on the host and the dump of the same APK on a device always agree.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Apk {
    pub name: String,
    pub checksum: String,
    /// Only set for APKs that exist on the host.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub path: Option<PathBuf>,
    pub entries: CentralDirectory,
}

impl Apk {
    /// Reads a complete APK from the host.
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let archive = central::read_file(path)?;
        let directory = central::locate_central_directory(&archive)?;
        let mut apk = Self::from_central_directory(file_name(path), directory)?;
        apk.path = Some(path.to_path_buf());
        Ok(apk)
    }

    /// Reads a `<apk name>.remotecd` dump pulled from a device.
    pub fn from_dump(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = central::read_file(path)?;
        let name = file_name(path);
        let name = name
            .strip_suffix(DUMP_EXTENSION)
            .and_then(|name| name.strip_suffix('.'))
            .unwrap_or(name.as_str())
            .to_string();
        Self::from_central_directory(name, &bytes)
    }

    pub fn from_central_directory(name: impl Into<String>, directory: &[u8]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            checksum: blake3::hash(directory).to_string(),
            path: None,
            entries: central::parse_central_directory(directory)?,
        })
    }

    /// Root-level dex entries and their CRCs, in name order.
    pub fn dex_entries(&self) -> Vec<(&str, u32)> {
        let mut dexes: Vec<(&str, u32)> = self
            .entries
            .iter()
            .filter(|(name, _)| is_dex_entry(name))
            .map(|(name, crc)| (name.as_str(), *crc))
            .collect();
        dexes.sort_unstable();
        dexes
    }

    /// Reads the whole APK back from its host path.
    pub fn read(&self) -> Result<Vec<u8>> {
        let Some(path) = &self.path else {
            exn::bail!(ErrorKind::MissingPath(self.name.clone()));
        };
        central::read_file(path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::tests::dump;
    use std::io::Write;

    fn build_apk(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (entry, content) in files {
            writer.start_file(*entry, zip::write::SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn open_reads_entries_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_apk(
            dir.path(),
            "base.apk",
            &[("AndroidManifest.xml", b"manifest"), ("classes2.dex", b"two"), ("classes.dex", b"one")],
        );
        let apk = Apk::open(&path).unwrap();
        assert_eq!(apk.name, "base.apk");
        assert_eq!(apk.path.as_deref(), Some(path.as_path()));
        assert_eq!(apk.entries.len(), 3);
        assert_eq!(
            apk.dex_entries(),
            vec![("classes.dex", crc32fast::hash(b"one")), ("classes2.dex", crc32fast::hash(b"two"))]
        );
        assert_eq!(apk.read().unwrap(), std::fs::read(&path).unwrap());
    }

    #[test]
    fn host_and_dump_checksums_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_apk(dir.path(), "base.apk", &[("classes.dex", b"code")]);
        let archive = std::fs::read(&path).unwrap();
        let directory = central::locate_central_directory(&archive).unwrap();
        let dump_path = dir.path().join("base.apk.remotecd");
        std::fs::write(&dump_path, directory).unwrap();

        let local = Apk::open(&path).unwrap();
        let remote = Apk::from_dump(&dump_path).unwrap();
        assert_eq!(remote.name, "base.apk");
        assert_eq!(remote.checksum, local.checksum);
        assert_eq!(remote.entries, local.entries);
        assert!(remote.path.is_none());
    }

    #[test]
    fn dumped_apk_cannot_be_read_back() {
        let apk = Apk::from_central_directory("split.apk", &dump(&[("classes.dex", 1)])).unwrap();
        let err = apk.read().unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingPath(name) if name == "split.apk"));
    }

    #[test]
    fn missing_apk_is_not_found() {
        let err = Apk::open("/nonexistent/base.apk").unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }
}
