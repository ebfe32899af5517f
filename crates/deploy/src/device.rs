//! The narrow view of a device the deployer needs.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Lowest API level that can redefine classes in a running process (Android O).
pub const MIN_SWAP_API_LEVEL: u32 = 26;

/// A connected device.
///
/// Implementations wrap whatever transport reaches the device. Calls block
/// until the device answered. Every failure is reported as
/// [`ErrorKind::DeviceCommunication`](crate::error::ErrorKind::DeviceCommunication),
/// except for a rejected package in [`install_multiple`](Device::install_multiple),
/// which is [`ErrorKind::InstallFailed`](crate::error::ErrorKind::InstallFailed).
pub trait Device: Send + Sync + fmt::Debug {
    fn serial(&self) -> &str;

    fn api_level(&self) -> u32;

    /// Runs `argv` in a device shell and returns its standard output, line by line.
    fn shell(&self, argv: &[&str]) -> Result<Vec<String>>;

    /// Copies the contents of the directory `remote_dir` into `local_dir`.
    fn pull(&self, remote_dir: &str, local_dir: &Path) -> Result<()>;

    /// Copies one local file to `remote_path`, replacing whatever was there.
    fn push(&self, local_file: &Path, remote_path: &str) -> Result<()>;

    /// Installs every APK of a split package in one session.
    fn install_multiple(&self, apks: &[PathBuf], options: &InstallOptions) -> Result<()>;
}

/// Flags handed to the package manager on install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Allow packages marked `testOnly`.
    pub allow_test_packages: bool,
    /// Grant every runtime permission listed in the manifest.
    pub grant_permissions: bool,
    /// Passed through as given.
    pub extra_flags: Vec<String>,
}

impl InstallOptions {
    /// Package manager command line flags.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.allow_test_packages {
            flags.push("-t".to_string());
        }
        if self.grant_permissions {
            flags.push("-g".to_string());
        }
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_flags() {
        assert!(InstallOptions::default().flags().is_empty());
        let options = InstallOptions {
            allow_test_packages: true,
            grant_permissions: true,
            extra_flags: vec!["--user".into(), "0".into()],
        };
        assert_eq!(options.flags(), ["-t", "-g", "--user", "0"]);
    }
}
