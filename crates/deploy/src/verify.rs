//! Decides whether a set of changes can be applied without reinstalling.

use apkswap_apk::{FileDiff, Status};

use crate::error::{ErrorKind, Result};

/// The changes a swap has to transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapPlan {
    /// Modified dex files.
    pub dex: Vec<FileDiff>,
    /// Created or modified non-code files, only ever set for a restart swap.
    pub resources: Vec<FileDiff>,
}

impl SwapPlan {
    pub fn is_empty(&self) -> bool {
        self.dex.is_empty() && self.resources.is_empty()
    }
}

/// Checks every change against what the installer can swap.
///
/// With `restart`, the application is restarted after the swap, so resource
/// and asset changes can be swapped too. Manifest changes, native libraries
/// and added or removed dex files always need a full install. Signature files
/// under `META-INF/` are ignored.
pub fn verify(diffs: &[FileDiff], restart: bool) -> Result<SwapPlan> {
    let mut plan = SwapPlan::default();
    for diff in diffs {
        let entry = diff.entry.as_str();
        if entry.starts_with("META-INF/") {
            continue;
        }
        if entry == "AndroidManifest.xml" {
            exn::bail!(ErrorKind::CannotSwapManifest);
        }
        if entry.starts_with("lib/") {
            exn::bail!(ErrorKind::CannotSwapStaticLib(entry.to_string()));
        }
        if diff.is_dex() {
            if diff.status != Status::Modified {
                exn::bail!(ErrorKind::CannotSwapDexChange(format!("{} {}", diff.status, entry)));
            }
            plan.dex.push(diff.clone());
            continue;
        }
        if !restart {
            exn::bail!(ErrorKind::CannotSwapResource(entry.to_string()));
        }
        // Nothing references a removed resource once the new code is in
        // place, so the copy left in the installed APK is harmless.
        if diff.status != Status::Deleted {
            plan.resources.push(diff.clone());
        }
    }
    Ok(plan)
}
