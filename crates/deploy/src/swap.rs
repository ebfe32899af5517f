//! Stages changed files on the device and asks the installer to swap them in.

use apkswap_apk::{Apk, FileDiff};
use apkswap_cache::OverlayId;
use exn::{OptionExt, ResultExt};
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::instrument;

use crate::compare::ChangedDex;
use crate::device::Device;
use crate::error::{ErrorKind, Result, from_apk};
use crate::installer::{Installer, Response, STAGING_DIRECTORY, SwapRequest};
use crate::verify::SwapPlan;

/// Installer error code for a component that could not be restarted after the swap.
const ACTIVATION_FAILED: &str = "ACTIVATION_FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapResult {
    /// Overlay the device holds from now on.
    pub overlay_id: OverlayId,
    /// `false` when the overlay was written but the running process kept the
    /// old code until its next start.
    pub hotswap_succeeded: bool,
}

#[derive(Debug)]
pub struct Swapper<'a> {
    pub device: &'a dyn Device,
    pub installer: &'a Installer,
    pub application_id: &'a str,
    /// Restart the application as part of the swap.
    pub restart: bool,
    /// Accept a swap the running process could not apply, leaving the
    /// restart to the caller.
    pub fast_restart_on_swap_fail: bool,
}

impl Swapper<'_> {
    /// Layers `changed` and the resources of `plan` on top of the `previous` overlay.
    #[instrument(level = "info", skip_all, fields(serial = self.device.serial(), application_id = self.application_id))]
    pub fn swap(&self, previous: &OverlayId, local: &[Apk], plan: &SwapPlan, changed: &[ChangedDex]) -> Result<SwapResult> {
        if changed.is_empty() && plan.resources.is_empty() {
            tracing::info!("Nothing to swap");
            return Ok(SwapResult { overlay_id: previous.clone(), hotswap_succeeded: true });
        }

        let staging =
            tempfile::tempdir().or_raise(|| ErrorKind::Internal("could not create temporary directory".into()))?;
        let mut request = SwapRequest {
            package: self.application_id.to_string(),
            expected_overlay: (!previous.is_base_install()).then(|| previous.checksum().to_string()),
            restart: self.restart,
            ..SwapRequest::default()
        };
        for dex in changed {
            request.dex.push(self.stage(staging.path(), &dex.apk, &dex.name, &dex.code)?);
            request.classes.extend(dex.classes.iter().cloned());
        }
        for resource in &plan.resources {
            let contents = read_entry(local, resource)?;
            request.resources.push(self.stage(staging.path(), &resource.apk, &resource.entry, &contents)?);
        }
        let overlay_id = previous.next(local, &request.classes);
        request.overlay = overlay_id.checksum().to_string();

        let hotswap_succeeded = match self.installer.swap(self.device, &request)? {
            Response::Ok => true,
            Response::RestartRequired if self.fast_restart_on_swap_fail => {
                tracing::warn!("Classes could not be redefined in place; the application needs a restart");
                false
            }
            Response::RestartRequired => {
                exn::bail!(ErrorKind::SwapFailed("classes could not be redefined without a restart".into()))
            }
            Response::NotInstalled => exn::bail!(ErrorKind::NotInstalled(self.application_id.to_string())),
            Response::Error { code, message } if code == ACTIVATION_FAILED => {
                exn::bail!(ErrorKind::ComponentActivationFailed(message))
            }
            Response::Error { code, message } => exn::bail!(ErrorKind::SwapFailed(format!("{code} {message}"))),
        };
        tracing::info!(
            classes = request.classes.len(),
            resources = request.resources.len(),
            overlay = %overlay_id,
            hotswap_succeeded,
            "Swapped"
        );
        Ok(SwapResult { overlay_id, hotswap_succeeded })
    }

    /// Pushes `contents` to the staging area and returns its remote path.
    fn stage(&self, local_dir: &Path, apk: &str, entry: &str, contents: &[u8]) -> Result<String> {
        let local = local_dir.join(format!("{apk}-{}", entry.replace('/', "_")));
        std::fs::write(&local, contents).or_raise(|| ErrorKind::Internal(format!("could not stage {entry}")))?;
        let remote = format!("{STAGING_DIRECTORY}/{}/{apk}/{entry}", self.application_id);
        self.device.push(&local, &remote)?;
        Ok(remote)
    }
}

fn read_entry(local: &[Apk], diff: &FileDiff) -> Result<Vec<u8>> {
    let apk = local.iter().find(|apk| apk.name == diff.apk);
    let apk = apk.ok_or_raise(|| ErrorKind::Internal(format!("no local APK named {}", diff.apk)))?;
    let bytes = apk.read().map_err(from_apk)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).or_raise(|| ErrorKind::Parse(apk.name.clone()))?;
    let mut entry = archive.by_name(&diff.entry).or_raise(|| ErrorKind::Parse(format!("{}/{}", apk.name, diff.entry)))?;
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).or_raise(|| ErrorKind::Parse(format!("{}/{}", apk.name, diff.entry)))?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeDevice;
    use crate::device::InstallOptions;
    use apkswap_apk::Status;
    use apkswap_dex::testing::zip;
    use std::sync::Arc;

    const APP: &str = "com.example.app";

    struct Fixture {
        _dir: tempfile::TempDir,
        device: FakeDevice,
        installer: Installer,
        apks: Vec<Apk>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.apk");
        std::fs::write(&path, zip(&[("classes.dex", b"dex"), ("res/values/strings.xml", b"<resources/>")]).unwrap())
            .unwrap();
        let device = FakeDevice::new("serial", 30).with_package(APP);
        device.install_multiple(&[path.clone()], &InstallOptions::default()).unwrap();
        let apks = vec![Apk::open(&path).unwrap()];
        Fixture { _dir: dir, device, installer: Installer::new(apkswap_config::DEFAULT_INSTALLER), apks }
    }

    fn swapper(fixture: &Fixture) -> Swapper<'_> {
        Swapper {
            device: &fixture.device,
            installer: &fixture.installer,
            application_id: APP,
            restart: false,
            fast_restart_on_swap_fail: false,
        }
    }

    fn changed_dex() -> Vec<ChangedDex> {
        vec![ChangedDex {
            apk: "base.apk".into(),
            name: "classes.dex".into(),
            code: Arc::from(&b"new code"[..]),
            classes: vec!["com.example.Main".into()],
        }]
    }

    #[test]
    fn stages_dex_files_and_swaps() {
        let fixture = fixture();
        let base = OverlayId::base_install(&fixture.apks);
        let result = swapper(&fixture).swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap();

        assert!(result.hotswap_succeeded);
        assert!(!result.overlay_id.is_base_install());
        assert_eq!(result.overlay_id, base.next(&fixture.apks, &["com.example.Main".to_string()]));
        assert_eq!(fixture.device.overlay(APP).as_deref(), Some(result.overlay_id.checksum()));

        let swaps = fixture.device.swaps();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].expected_overlay, None);
        assert_eq!(swaps[0].classes, ["com.example.Main"]);
        let staged = format!("{STAGING_DIRECTORY}/{APP}/base.apk/classes.dex");
        assert_eq!(swaps[0].dex, [staged.clone()]);
        assert_eq!(fixture.device.file(&staged).unwrap(), b"new code");
    }

    #[test]
    fn swaps_chain_on_the_previous_overlay() {
        let fixture = fixture();
        let swapper = swapper(&fixture);
        let base = OverlayId::base_install(&fixture.apks);
        let first = swapper.swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap();
        let second = swapper.swap(&first.overlay_id, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap();

        assert_ne!(first.overlay_id, second.overlay_id);
        assert_eq!(fixture.device.swaps()[1].expected_overlay.as_deref(), Some(first.overlay_id.checksum()));

        // The device no longer holds the first overlay.
        let err = swapper.swap(&first.overlay_id, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::SwapFailed(message) if message.starts_with("OVERLAY_MISMATCH")));
    }

    #[test]
    fn resources_are_read_from_the_local_apk() {
        let fixture = fixture();
        let plan = SwapPlan {
            dex: Vec::new(),
            resources: vec![FileDiff {
                apk: "base.apk".into(),
                entry: "res/values/strings.xml".into(),
                status: Status::Modified,
                old_crc: Some(1),
                new_crc: Some(2),
            }],
        };
        let swapper = Swapper { restart: true, ..swapper(&fixture) };
        let base = OverlayId::base_install(&fixture.apks);
        swapper.swap(&base, &fixture.apks, &plan, &[]).unwrap();

        let swaps = fixture.device.swaps();
        assert!(swaps[0].restart);
        assert!(swaps[0].classes.is_empty());
        assert_eq!(fixture.device.file(&swaps[0].resources[0]).unwrap(), b"<resources/>");
    }

    #[test]
    fn nothing_to_swap_keeps_the_overlay() {
        let fixture = fixture();
        let base = OverlayId::base_install(&fixture.apks);
        let result = swapper(&fixture).swap(&base, &fixture.apks, &SwapPlan::default(), &[]).unwrap();
        assert_eq!(result.overlay_id, base);
        assert!(fixture.device.swaps().is_empty());
    }

    #[test]
    fn restart_required_fails_without_fast_restart() {
        let fixture = fixture();
        fixture.device.answer_swaps(Some(Response::RestartRequired));
        let base = OverlayId::base_install(&fixture.apks);

        let err = swapper(&fixture).swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::SwapFailed(_)));

        let swapper = Swapper { fast_restart_on_swap_fail: true, ..swapper(&fixture) };
        let result = swapper.swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap();
        assert!(!result.hotswap_succeeded);
    }

    #[test]
    fn installer_errors_keep_their_code() {
        let fixture = fixture();
        let base = OverlayId::base_install(&fixture.apks);
        fixture.device.answer_swaps(Some(Response::Error { code: ACTIVATION_FAILED.into(), message: "MainActivity".into() }));
        let err = swapper(&fixture).swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap_err();
        assert_eq!(*err, ErrorKind::ComponentActivationFailed("MainActivity".into()));

        fixture.device.answer_swaps(Some(Response::Error { code: "AGENT".into(), message: "not attached".into() }));
        let err = swapper(&fixture).swap(&base, &fixture.apks, &SwapPlan::default(), &changed_dex()).unwrap_err();
        assert_eq!(*err, ErrorKind::SwapFailed("AGENT not attached".into()));
        assert_eq!(fixture.device.overlay(APP), None);
    }
}
