//! Deploy Error Types
//!
//! Every kind here can cross a task boundary: the task runner clones the kind
//! a failing task raised into each dependent task, so the caller of
//! [`Deployer`](crate::Deployer) always sees the originating kind and message.

use apkswap_tasks::FailureKind;
use derive_more::{Display, Error};

/// A deployment error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A local APK, a device dump or an installer response could not be parsed.
    #[display("could not parse {_0}")]
    Parse(#[error(not(source))] String),
    #[display("device communication failed: {_0}")]
    DeviceCommunication(#[error(not(source))] String),
    #[display("installation failed: {_0}")]
    InstallFailed(#[error(not(source))] String),
    #[display("could not activate component: {_0}")]
    ComponentActivationFailed(#[error(not(source))] String),
    #[display("operation not supported: {_0}")]
    OperationNotSupported(#[error(not(source))] String),
    #[display("different number of APKs: installed {installed}, local {local}")]
    DifferentNumberOfApks { installed: usize, local: usize },
    #[display("APK names do not match installed APKs: {_0}")]
    DifferentApkNames(#[error(not(source))] String),
    #[display("changes to AndroidManifest.xml cannot be swapped")]
    CannotSwapManifest,
    #[display("changes to native libraries cannot be swapped: {_0}")]
    CannotSwapStaticLib(#[error(not(source))] String),
    #[display("resource changes require an application restart: {_0}")]
    CannotSwapResource(#[error(not(source))] String),
    /// A dex file was added to or removed from an APK.
    #[display("dex files were added or removed: {_0}")]
    CannotSwapDexChange(#[error(not(source))] String),
    /// The dex file installed on the device is not known to the dex archive cache.
    #[display("installed dex file not found in the cache: {_0}")]
    RemoteApkNotFoundInDb(#[error(not(source))] String),
    #[display("application is not installed: {_0}")]
    NotInstalled(#[error(not(source))] String),
    #[display("could not dump installed APKs: {_0}")]
    DumpFailed(#[error(not(source))] String),
    #[display("swap failed: {_0}")]
    SwapFailed(#[error(not(source))] String),
    #[display("cache error")]
    Cache,
    #[display("invalid configuration")]
    Config,
    #[display("internal error: {_0}")]
    Internal(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Device failures are final for the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cache)
    }

    /// Whether the deployment cache entry for the application can no longer
    /// be trusted after this failure.
    pub(crate) fn invalidates_deployment(&self) -> bool {
        matches!(
            self,
            Self::InstallFailed(_)
                | Self::SwapFailed(_)
                | Self::RemoteApkNotFoundInDb(_)
                | Self::NotInstalled(_)
                | Self::DifferentNumberOfApks { .. }
                | Self::DifferentApkNames(_)
        )
    }
}

impl From<&apkswap_apk::error::ErrorKind> for ErrorKind {
    fn from(kind: &apkswap_apk::error::ErrorKind) -> Self {
        use apkswap_apk::error::ErrorKind as Apk;
        match kind {
            Apk::DifferentNumberOfApks { installed, local } => {
                Self::DifferentNumberOfApks { installed: *installed, local: *local }
            }
            Apk::DifferentApkNames(names) => Self::DifferentApkNames(names.clone()),
            other => Self::Parse(other.to_string()),
        }
    }
}

/// Re-raises an APK error under the deploy kind it corresponds to.
pub(crate) fn from_apk(err: apkswap_apk::error::Error) -> Error {
    let kind = ErrorKind::from(&*err);
    err.raise(kind)
}

impl FailureKind for ErrorKind {
    fn panicked() -> Self {
        Self::Internal("task panicked".into())
    }
}
