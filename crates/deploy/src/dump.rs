use apkswap_apk::{Apk, DUMP_EXTENSION};
use exn::ResultExt;
use tracing::instrument;

use crate::device::Device;
use crate::error::{ErrorKind, Result, from_apk};
use crate::installer::{DUMPS_DIRECTORY, Installer, Response};

/// Reads the central directories of every APK installed for `application_id`.
///
/// Returns an empty list when the application is not installed; callers
/// decide whether that is an error. The APKs are ordered by name.
#[instrument(level = "debug", skip(device, installer), fields(serial = device.serial()))]
pub fn dump(device: &dyn Device, installer: &Installer, application_id: &str) -> Result<Vec<Apk>> {
    match installer.dump(device, application_id)? {
        Response::Ok => {}
        Response::NotInstalled => {
            tracing::debug!(application_id, "Application is not installed");
            return Ok(Vec::new());
        }
        Response::Error { code, message } => exn::bail!(ErrorKind::DumpFailed(format!("{code} {message}"))),
        Response::RestartRequired => exn::bail!(ErrorKind::DumpFailed("unexpected installer response".into())),
    }

    let local = tempfile::tempdir().or_raise(|| ErrorKind::DumpFailed("could not create temporary directory".into()))?;
    device.pull(&format!("{DUMPS_DIRECTORY}/{application_id}"), local.path())?;

    let listing = std::fs::read_dir(local.path()).or_raise(|| ErrorKind::DumpFailed("could not list dumps".into()))?;
    let mut apks = Vec::new();
    for entry in listing {
        let path = entry.or_raise(|| ErrorKind::DumpFailed("could not list dumps".into()))?.path();
        if path.extension().is_none_or(|ext| ext != DUMP_EXTENSION) {
            continue;
        }
        apks.push(Apk::from_dump(&path).map_err(from_apk)?);
    }
    if apks.is_empty() {
        exn::bail!(ErrorKind::DumpFailed(format!("no dumps were written for {application_id}")));
    }
    apks.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!(apks = apks.len(), "Dumped installed APKs");
    Ok(apks)
}
