//! In-memory device for testing.

use exn::ResultExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::device::{Device, InstallOptions};
use crate::error::{ErrorKind, Result};
use crate::installer::{DUMPS_DIRECTORY, Response, SwapRequest};

/// In-memory device that speaks the installer protocol.
///
/// Installed APKs, the remote file system and the overlay of each application
/// live behind a [`Mutex`], so the device can be shared between the threads
/// of a task runner. Every installed application records the overlay of the
/// last swap; a plain install clears it.
///
/// `install_multiple` registers the APKs under the package id given to
/// [`with_package`](FakeDevice::with_package), since the fake does not read
/// manifests.
#[derive(Debug)]
pub struct FakeDevice {
    serial: String,
    api_level: u32,
    package: String,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    apps: HashMap<String, InstalledApp>,
    files: BTreeMap<String, Vec<u8>>,
    installs: usize,
    dumps: usize,
    swaps: Vec<SwapRequest>,
    install_failure: Option<String>,
    swap_response: Option<Response>,
}

#[derive(Debug, Clone)]
struct InstalledApp {
    // Name and full contents, in install order.
    apks: Vec<(String, Vec<u8>)>,
    overlay: Option<String>,
}

impl FakeDevice {
    pub fn new(serial: impl Into<String>, api_level: u32) -> Self {
        Self {
            serial: serial.into(),
            api_level,
            package: "com.example.app".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Change the package id that `install_multiple` installs as.
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    /// Makes every following install fail with `message`, or succeed again with `None`.
    pub fn fail_installs(&self, message: Option<&str>) {
        self.state.lock().install_failure = message.map(String::from);
    }

    /// Overrides the answer to every following swap, or restores normal
    /// behaviour with `None`.
    ///
    /// An `ERROR` answer leaves the device untouched. `OK RESTART_REQUIRED`
    /// still applies the overlay.
    pub fn answer_swaps(&self, response: Option<Response>) {
        self.state.lock().swap_response = response;
    }

    /// Names of the APKs installed for `package`, in install order.
    pub fn installed(&self, package: &str) -> Option<Vec<String>> {
        let state = self.state.lock();
        state.apps.get(package).map(|app| app.apks.iter().map(|(name, _)| name.clone()).collect())
    }

    /// Overlay of the last swap applied to `package` since it was installed.
    pub fn overlay(&self, package: &str) -> Option<String> {
        self.state.lock().apps.get(package).and_then(|app| app.overlay.clone())
    }

    pub fn install_count(&self) -> usize {
        self.state.lock().installs
    }

    pub fn dump_count(&self) -> usize {
        self.state.lock().dumps
    }

    /// Every swap the device accepted, oldest first.
    pub fn swaps(&self) -> Vec<SwapRequest> {
        self.state.lock().swaps.clone()
    }

    pub fn file(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(remote_path).cloned()
    }

    fn dump(&self, state: &mut State, package: &str) -> Response {
        let prefix = format!("{DUMPS_DIRECTORY}/{package}/");
        state.files.retain(|path, _| !path.starts_with(&prefix));
        let Some(app) = state.apps.get(package) else {
            return Response::NotInstalled;
        };
        let mut dumps = Vec::with_capacity(app.apks.len());
        for (name, bytes) in &app.apks {
            match apkswap_apk::locate_central_directory(bytes) {
                Ok(directory) => dumps.push((format!("{prefix}{name}.remotecd"), directory.to_vec())),
                Err(e) => return Response::Error { code: "DUMP".into(), message: format!("{name}: {e}") },
            }
        }
        state.files.extend(dumps);
        state.dumps += 1;
        Response::Ok
    }

    fn swap(&self, state: &mut State, args: &[&str]) -> Response {
        let Some(request) = SwapRequest::parse(args) else {
            return Response::Error { code: "ARGUMENTS".into(), message: args.join(" ") };
        };
        if let Some(response @ Response::Error { .. }) = &state.swap_response {
            return response.clone();
        }
        let missing = request.dex.iter().chain(&request.resources).find(|path| !state.files.contains_key(*path));
        if let Some(path) = missing {
            return Response::Error { code: "MISSING_FILE".into(), message: path.clone() };
        }
        let Some(app) = state.apps.get_mut(&request.package) else {
            return Response::Error { code: "NOT_INSTALLED".into(), message: request.package };
        };
        if let Some(expected) = &request.expected_overlay
            && app.overlay.as_ref() != Some(expected)
        {
            let found = app.overlay.as_deref().unwrap_or("none");
            return Response::Error {
                code: "OVERLAY_MISMATCH".into(),
                message: format!("expected {expected}, found {found}"),
            };
        }
        app.overlay = Some(request.overlay.clone());
        state.swaps.push(request);
        state.swap_response.clone().unwrap_or(Response::Ok)
    }
}

impl Device for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn api_level(&self) -> u32 {
        self.api_level
    }

    fn shell(&self, argv: &[&str]) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let response = match argv {
            [_, "dump", package] => self.dump(&mut state, package),
            [_, "swap", args @ ..] => self.swap(&mut state, args),
            _ => exn::bail!(ErrorKind::DeviceCommunication(format!("unknown command: {}", argv.join(" ")))),
        };
        Ok(vec![response.render()])
    }

    fn pull(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let state = self.state.lock();
        let files: Vec<(&str, &Vec<u8>)> =
            state.files.iter().filter_map(|(path, data)| Some((path.strip_prefix(&prefix)?, data))).collect();
        if files.is_empty() {
            exn::bail!(ErrorKind::DeviceCommunication(format!("remote directory does not exist: {remote_dir}")));
        }
        for (relative, data) in files {
            let local = local_dir.join(relative);
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)
                    .or_raise(|| ErrorKind::DeviceCommunication(format!("pull {remote_dir}")))?;
            }
            std::fs::write(&local, data).or_raise(|| ErrorKind::DeviceCommunication(format!("pull {remote_dir}")))?;
        }
        Ok(())
    }

    fn push(&self, local_file: &Path, remote_path: &str) -> Result<()> {
        let data = std::fs::read(local_file)
            .or_raise(|| ErrorKind::DeviceCommunication(format!("push {}", local_file.display())))?;
        self.state.lock().files.insert(remote_path.to_string(), data);
        Ok(())
    }

    fn install_multiple(&self, apks: &[PathBuf], _options: &InstallOptions) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(message) = &state.install_failure {
            exn::bail!(ErrorKind::InstallFailed(message.clone()));
        }
        let mut installed = Vec::with_capacity(apks.len());
        for path in apks {
            let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
            let data =
                std::fs::read(path).or_raise(|| ErrorKind::DeviceCommunication(format!("push {}", path.display())))?;
            installed.push((name, data));
        }
        state.apps.insert(self.package.clone(), InstalledApp { apks: installed, overlay: None });
        state.installs += 1;
        Ok(())
    }
}
