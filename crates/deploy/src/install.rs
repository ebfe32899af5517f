use apkswap_apk::{Apk, diff_apks};
use derive_more::Display;
use exn::OptionExt;
use std::path::PathBuf;
use tracing::instrument;

use crate::device::{Device, InstallOptions};
use crate::dump::dump;
use crate::error::{ErrorKind, Result};
use crate::installer::Installer;

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InstallMode {
    /// Dump the device first and skip the install when it already holds
    /// identical APKs.
    #[default]
    #[display("delta")]
    Delta,
    /// Always install, even over identical APKs.
    #[display("delta-no-skip")]
    DeltaNoSkip,
    /// Install without looking at the device at all.
    #[display("full")]
    Full,
}

/// Installs the local `apks` of `application_id`.
///
/// Returns `true` when the install was skipped because the device already
/// runs the same APKs.
#[instrument(level = "info", skip_all, fields(serial = device.serial(), application_id = %application_id, mode = %mode))]
pub fn install(
    device: &dyn Device,
    installer: &Installer,
    application_id: &str,
    apks: &[Apk],
    mode: InstallMode,
    options: &InstallOptions,
) -> Result<bool> {
    if mode == InstallMode::Delta && is_installed(device, installer, application_id, apks)? {
        tracing::info!("Device already holds these APKs; skipping install");
        return Ok(true);
    }
    let paths = apks
        .iter()
        .map(|apk| apk.path.clone().ok_or_raise(|| ErrorKind::Parse(format!("{} has no local file", apk.name))))
        .collect::<Result<Vec<PathBuf>>>()?;
    device.install_multiple(&paths, options)?;
    tracing::info!(apks = paths.len(), "Installed");
    Ok(false)
}

fn is_installed(device: &dyn Device, installer: &Installer, application_id: &str, apks: &[Apk]) -> Result<bool> {
    let installed = dump(device, installer, application_id)?;
    if installed.is_empty() {
        return Ok(false);
    }
    // A changed split layout cannot match; install over it.
    Ok(diff_apks(&installed, apks).is_ok_and(|diffs| diffs.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeDevice;
    use apkswap_dex::testing::zip;
    use rstest::rstest;
    use std::path::Path;

    const APP: &str = "com.example.app";

    fn installer() -> Installer {
        Installer::new(apkswap_config::DEFAULT_INSTALLER)
    }

    fn write_apk(dir: &Path, name: &str, contents: &[u8]) -> Apk {
        let path = dir.join(name);
        std::fs::write(&path, zip(&[("classes.dex", contents)]).unwrap()).unwrap();
        Apk::open(&path).unwrap()
    }

    #[rstest]
    #[case::delta(InstallMode::Delta, true, 1)]
    #[case::delta_no_skip(InstallMode::DeltaNoSkip, false, 0)]
    #[case::full(InstallMode::Full, false, 0)]
    fn reinstalling_identical_apks(#[case] mode: InstallMode, #[case] skipped: bool, #[case] dumps: usize) {
        let dir = tempfile::tempdir().unwrap();
        let apks = [write_apk(dir.path(), "base.apk", b"dex")];
        let device = FakeDevice::new("serial", 30).with_package(APP);
        let options = InstallOptions::default();

        // Dumping a device without the application counts for nothing.
        let first_mode = if mode == InstallMode::Full { InstallMode::Full } else { InstallMode::Delta };
        assert!(!install(&device, &installer(), APP, &apks, first_mode, &options).unwrap());
        assert_eq!(install(&device, &installer(), APP, &apks, mode, &options).unwrap(), skipped);
        assert_eq!(device.install_count(), if skipped { 1 } else { 2 });
        assert_eq!(device.dump_count(), dumps);
    }

    #[test]
    fn changed_apks_are_installed() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("serial", 30).with_package(APP);
        let options = InstallOptions::default();
        std::fs::create_dir_all(dir.path().join("v2")).unwrap();
        let v1 = [write_apk(dir.path(), "base.apk", b"one")];
        let v2 = [write_apk(&dir.path().join("v2"), "base.apk", b"two")];

        assert!(!install(&device, &installer(), APP, &v1, InstallMode::Delta, &options).unwrap());
        assert!(!install(&device, &installer(), APP, &v2, InstallMode::Delta, &options).unwrap());
        assert_eq!(device.install_count(), 2);
        assert_eq!(device.installed(APP).unwrap(), ["base.apk"]);
    }

    #[test]
    fn changed_split_layout_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("serial", 30).with_package(APP);
        let options = InstallOptions::default();
        let base = write_apk(dir.path(), "base.apk", b"one");
        let split = write_apk(dir.path(), "split.apk", b"two");

        install(&device, &installer(), APP, &[base.clone()], InstallMode::Full, &options).unwrap();
        assert!(!install(&device, &installer(), APP, &[base, split], InstallMode::Delta, &options).unwrap());
        assert_eq!(device.installed(APP).unwrap(), ["base.apk", "split.apk"]);
    }

    #[test]
    fn rejected_install_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("serial", 30).with_package(APP);
        device.fail_installs(Some("INSTALL_FAILED_VERSION_DOWNGRADE"));
        let apks = [write_apk(dir.path(), "base.apk", b"dex")];
        let err = install(&device, &installer(), APP, &apks, InstallMode::Full, &InstallOptions::default()).unwrap_err();
        assert_eq!(*err, ErrorKind::InstallFailed("INSTALL_FAILED_VERSION_DOWNGRADE".into()));
    }

    #[test]
    fn dumped_apks_cannot_be_installed() {
        let device = FakeDevice::new("serial", 30).with_package(APP);
        let apk = Apk::from_central_directory("base.apk", &[]).unwrap();
        let err = install(&device, &installer(), APP, &[apk], InstallMode::Full, &InstallOptions::default()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Parse(_)));
    }
}
