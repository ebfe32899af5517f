use apkswap_apk::{Apk, FileDiff, diff_apks};
use apkswap_cache::{DeploymentCache, Entry, OverlayId, WorkQueueDatabase};
use apkswap_dex::DexArchive;
use apkswap_tasks::Task;
use derive_more::Display;
use exn::ResultExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::instrument;

use crate::compare::{ChangedDex, DexComparator};
use crate::context::DeployContext;
use crate::device::{Device, InstallOptions, MIN_SWAP_API_LEVEL};
use crate::dump::dump;
use crate::error::{ErrorKind, Result, from_apk};
use crate::install::{InstallMode, install};
use crate::installer::Installer;
use crate::swap::Swapper;
use crate::verify::{SwapPlan, verify};

/// Names of the tasks a deployment is made of.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    #[display("parse-paths")]
    ParsePaths,
    #[display("dump")]
    Dump,
    #[display("diff")]
    Diff,
    #[display("verify")]
    Verify,
    #[display("compare")]
    Compare,
    #[display("install")]
    Install,
    #[display("swap")]
    Swap,
    #[display("cache")]
    Cache,
    #[display("deploy-cache-store")]
    DeployCacheStore,
}

/// Outcome of a successful install or swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub application_id: String,
    /// The local APKs that are now on the device.
    pub apks: Vec<Apk>,
    pub skipped_install: bool,
    /// The swap landed in the overlay, but the application has to be
    /// restarted to run the new code.
    pub needs_restart: bool,
}

/// Deploys local builds to one device.
///
/// Each operation is a graph of [`Stage`] tasks on the context's task runner.
/// Once the device holds the new APKs, their dex archives are cached and the
/// deployment is recorded in the background; the next operation on the same
/// device and application waits for that to finish first.
#[derive(Debug)]
pub struct Deployer<'a> {
    context: &'a DeployContext,
    device: Arc<dyn Device>,
    installer: Installer,
    options: InstallOptions,
}

impl<'a> Deployer<'a> {
    pub fn new(context: &'a DeployContext, device: Arc<dyn Device>) -> Self {
        let installer = Installer::new(context.config.installer.clone());
        Self { context, device, installer, options: InstallOptions::default() }
    }

    pub fn with_install_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    /// Installs the APKs at `paths`.
    #[instrument(level = "info", skip(self, paths), fields(serial = self.device.serial()))]
    pub fn install(&self, application_id: &str, paths: &[PathBuf], mode: InstallMode) -> Result<Deployment> {
        self.context.settle_background(self.device.serial(), application_id);
        let runner = &self.context.runner;

        let paths = runner.submit_value(paths.to_vec());
        let apks = runner.submit(Stage::ParsePaths, &paths, |paths: Vec<PathBuf>| parse_paths(&paths));
        let installed = runner.submit(Stage::Install, &apks, {
            let (device, installer, options) = (self.device.clone(), self.installer.clone(), self.options.clone());
            let application_id = application_id.to_string();
            move |apks: Vec<Apk>| install(&*device, &installer, &application_id, &apks, mode, &options)
        });

        let skipped_install = match installed.get() {
            Ok(skipped) => skipped,
            Err(e) => {
                // A failed install leaves the device in an unknown state; a
                // failure before reaching it leaves the entry valid.
                if e.invalidates_deployment() {
                    self.forget(application_id);
                }
                return Err(e);
            }
        };

        // A skipped install left the device, and so its cache entry, as it was.
        let mut background = vec![self.cache_dex_archives(&apks)];
        if !skipped_install {
            background.push(self.store(application_id, &apks, None));
        }
        self.context.track_background(self.device.serial(), application_id, background);

        Ok(Deployment { application_id: application_id.to_string(), apks: apks.get()?, skipped_install, needs_restart: false })
    }

    /// Redefines changed classes in the running application.
    pub fn code_swap(&self, application_id: &str, paths: &[PathBuf]) -> Result<Deployment> {
        self.swap(application_id, paths, false)
    }

    /// Swaps code and resources, restarting the application.
    pub fn full_swap(&self, application_id: &str, paths: &[PathBuf]) -> Result<Deployment> {
        self.swap(application_id, paths, true)
    }

    #[instrument(level = "info", skip(self, paths), fields(serial = self.device.serial()))]
    fn swap(&self, application_id: &str, paths: &[PathBuf], restart: bool) -> Result<Deployment> {
        let api_level = self.device.api_level();
        if api_level < MIN_SWAP_API_LEVEL {
            exn::bail!(ErrorKind::OperationNotSupported(format!(
                "swapping requires API level {MIN_SWAP_API_LEVEL}, device runs {api_level}"
            )));
        }
        self.context.settle_background(self.device.serial(), application_id);
        let runner = &self.context.runner;
        let config = &self.context.config.swap;

        let paths = runner.submit_value(paths.to_vec());
        let local = runner.submit(Stage::ParsePaths, &paths, |paths: Vec<PathBuf>| parse_paths(&paths));
        let installed = runner.submit(Stage::Dump, (), {
            let (device, installer) = (self.device.clone(), self.installer.clone());
            let deployments = self.context.deployments.clone();
            let application_id = application_id.to_string();
            let optimistic = config.optimistic;
            move |()| dump_with_cache(&*device, &installer, &deployments, &application_id, optimistic)
        });
        let diffs = runner.submit(Stage::Diff, (&installed, &local), |(installed, local): (Entry, Vec<Apk>)| {
            diff_apks(&installed.apks, &local).map_err(from_apk)
        });
        let plan = runner.submit(Stage::Verify, &diffs, move |diffs: Vec<FileDiff>| verify(&diffs, restart));
        let changed = runner.submit(Stage::Compare, (&installed, &local, &plan), {
            let comparator = DexComparator::new(self.context.queue.clone());
            let runtime = self.context.runtime.handle().clone();
            move |(installed, local, plan): (Entry, Vec<Apk>, SwapPlan)| {
                runtime.block_on(comparator.compare(&installed.apks, &local, &plan.dex))
            }
        });
        let swapped = runner.submit(Stage::Swap, (&installed, &local, &plan, &changed), {
            let (device, installer) = (self.device.clone(), self.installer.clone());
            let application_id = application_id.to_string();
            let fast_restart_on_swap_fail = config.fast_restart_on_swap_fail;
            move |(installed, local, plan, changed): (Entry, Vec<Apk>, SwapPlan, Vec<ChangedDex>)| {
                let swapper = Swapper {
                    device: &*device,
                    installer: &installer,
                    application_id: &application_id,
                    restart,
                    fast_restart_on_swap_fail,
                };
                swapper.swap(&installed.overlay_id, &local, &plan, &changed)
            }
        });

        let result = match swapped.get() {
            Ok(result) => result,
            Err(e) => {
                if e.invalidates_deployment() {
                    self.forget(application_id);
                }
                return Err(e);
            }
        };

        let background =
            vec![self.cache_dex_archives(&local), self.store(application_id, &local, Some(result.overlay_id.clone()))];
        self.context.track_background(self.device.serial(), application_id, background);

        Ok(Deployment {
            application_id: application_id.to_string(),
            apks: local.get()?,
            skipped_install: false,
            needs_restart: config.fast_restart_on_swap_fail && !result.hotswap_succeeded,
        })
    }

    /// Caches the dex archive of every APK so later swaps can compare against it.
    fn cache_dex_archives(&self, apks: &Task<Vec<Apk>, ErrorKind>) -> Task<(), ErrorKind> {
        let queue = self.context.queue.clone();
        let runtime = self.context.runtime.handle().clone();
        self.context.runner.submit(Stage::Cache, apks, move |apks: Vec<Apk>| cache_archives(&queue, &runtime, &apks))
    }

    /// Records `apks` as deployed, under `overlay` or as a plain install.
    fn store(
        &self,
        application_id: &str,
        apks: &Task<Vec<Apk>, ErrorKind>,
        overlay: Option<OverlayId>,
    ) -> Task<(), ErrorKind> {
        let deployments = self.context.deployments.clone();
        let serial = self.device.serial().to_string();
        let application_id = application_id.to_string();
        self.context.runner.submit(Stage::DeployCacheStore, apks, move |apks: Vec<Apk>| {
            let overlay = overlay.unwrap_or_else(|| OverlayId::base_install(&apks));
            deployments.store(&serial, &application_id, apks, overlay).or_raise(|| ErrorKind::Cache)
        })
    }

    fn forget(&self, application_id: &str) {
        match self.context.deployments.invalidate(self.device.serial(), application_id) {
            Ok(true) => tracing::debug!(application_id, "Invalidated deployment cache entry"),
            Ok(false) => {}
            Err(e) => tracing::warn!(application_id, error = ?e, "Could not invalidate deployment cache entry"),
        }
    }
}

fn parse_paths(paths: &[PathBuf]) -> Result<Vec<Apk>> {
    if paths.is_empty() {
        exn::bail!(ErrorKind::Parse("no APKs given".into()));
    }
    paths.iter().map(|path| Apk::open(path).map_err(from_apk)).collect()
}

/// The deployment the device is assumed to hold.
///
/// With `optimistic`, a cached swap deployment is trusted as is. A cached
/// plain install is not: the device may have been reinstalled since, and a
/// dump is cheap compared with a swap against the wrong base. Dumps are
/// recorded as plain installs.
fn dump_with_cache(
    device: &dyn Device,
    installer: &Installer,
    deployments: &DeploymentCache,
    application_id: &str,
    optimistic: bool,
) -> Result<Entry> {
    if optimistic
        && let Some(entry) = deployments.get(device.serial(), application_id)
        && !entry.overlay_id.is_base_install()
    {
        tracing::debug!(application_id, overlay = %entry.overlay_id, "Using cached deployment");
        return Ok(entry);
    }
    let apks = dump(device, installer, application_id)?;
    if apks.is_empty() {
        exn::bail!(ErrorKind::NotInstalled(application_id.to_string()));
    }
    let overlay_id = OverlayId::base_install(&apks);
    deployments
        .store(device.serial(), application_id, apks.clone(), overlay_id.clone())
        .or_raise(|| ErrorKind::Cache)?;
    Ok(Entry { apks, overlay_id })
}

fn cache_archives(queue: &WorkQueueDatabase, runtime: &Handle, apks: &[Apk]) -> Result<()> {
    for apk in apks {
        let archive = DexArchive::from_apk(apk).or_raise(|| ErrorKind::Parse(apk.name.clone()))?;
        let pending = queue.enqueue(move |db| async move { archive.cache(&*db).await });
        runtime.block_on(pending).or_raise(|| ErrorKind::Cache)?.or_raise(|| ErrorKind::Cache)?;
    }
    tracing::debug!(apks = apks.len(), "Cached dex archives");
    Ok(())
}
