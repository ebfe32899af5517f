//! Incremental deployment of APKs to a device.
//!
//! A [`Deployer`] either installs a build or swaps the changed classes of a
//! build into the running application:
//!
//! - **install**: parse the local APKs, skip the install when the device
//!   already holds them ([`InstallMode::Delta`]), otherwise install them.
//! - **swap**: dump what the device holds (or trust the deployment cache),
//!   diff it against the local APKs, [`verify`] that every change can be
//!   swapped, [`compare`](DexComparator::compare) the changed dex files class
//!   by class, then stage the new code on the device and ask its installer
//!   helper to apply it.
//!
//! After either, the dex archives of the new build are cached so that the
//! next swap can tell which classes changed, and the deployment is recorded
//! in the [`DeploymentCache`](apkswap_cache::DeploymentCache).
//!
//! Devices are reached through the [`Device`] trait. With the `mock` feature,
//! [`FakeDevice`] implements it in memory.

mod compare;
mod context;
mod deployer;
mod device;
mod dump;
pub mod error;
mod install;
pub mod installer;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod swap;
mod verify;

pub use crate::compare::{ChangedDex, DexComparator};
pub use crate::context::DeployContext;
pub use crate::deployer::{Deployer, Deployment, Stage};
pub use crate::device::{Device, InstallOptions, MIN_SWAP_API_LEVEL};
pub use crate::dump::dump;
pub use crate::install::{InstallMode, install};
#[cfg(any(test, feature = "mock"))]
pub use crate::mock::FakeDevice;
pub use crate::swap::{SwapResult, Swapper};
pub use crate::verify::{SwapPlan, verify};
