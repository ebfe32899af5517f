//! Layered configuration for the deployer.
//!
//! Values are merged, last one wins, from:
//! 1. built-in defaults,
//! 2. an optional TOML, YAML or JSON file (picked by extension),
//! 3. environment variables prefixed with `APKSWAP_`, nesting on `__`
//!    (`APKSWAP_SWAP__OPTIMISTIC=false`).

pub mod error;

use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};

pub const ENV_PREFIX: &str = "APKSWAP_";
pub const DEFAULT_INSTALLER: &str = "/data/local/tmp/.studio/bin/installer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads of the task runner.
    pub workers: usize,
    /// Base directory for relative cache file paths.
    pub cache_dir: PathBuf,
    /// Path of the installer helper on the device.
    pub installer: String,
    pub dex_database: DexDatabaseConfig,
    pub deployment_cache: DeploymentCacheConfig,
    pub swap: SwapConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DexDatabaseConfig {
    pub file: PathBuf,
    /// Maximum number of dex files remembered.
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentCacheConfig {
    pub file: PathBuf,
    /// Maximum number of (device, application) pairs remembered.
    pub capacity: usize,
    /// Keep the cache in memory only when `false`.
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Trust the deployment cache instead of dumping the device before a swap.
    pub optimistic: bool,
    /// Restart the application instead of failing when a swap cannot be
    /// applied to the running process.
    pub fast_restart_on_swap_fail: bool,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get()).clamp(1, 8);
        let cache_dir = ProjectDirs::from("", "", "apkswap")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("apkswap"));
        Self {
            workers,
            cache_dir,
            installer: DEFAULT_INSTALLER.to_string(),
            dex_database: DexDatabaseConfig::default(),
            deployment_cache: DeploymentCacheConfig::default(),
            swap: SwapConfig::default(),
        }
    }
}

impl Default for DexDatabaseConfig {
    fn default() -> Self {
        Self { file: PathBuf::from("dex-archives.db"), capacity: 400 }
    }
}

impl Default for DeploymentCacheConfig {
    fn default() -> Self {
        Self { file: PathBuf::from("deployments.json"), capacity: 100, persist: true }
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self { optimistic: true, fast_restart_on_swap_fail: false }
    }
}

impl Config {
    /// Loads defaults, then `file` (when given), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let figment = Self::figment(file)?.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(&figment)
    }

    /// Defaults and `file` only, without the environment.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let Some(file) = file else {
            return Ok(figment);
        };
        if !file.is_file() {
            exn::bail!(ErrorKind::NotFound(file.to_path_buf()));
        }
        let extension = file.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        Ok(match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(file)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
            Some("json") => figment.merge(Json::file(file)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
        })
    }

    /// Extracts and validates a configuration from any figment.
    pub fn extract(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(workers = config.workers, cache_dir = %config.cache_dir.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            exn::bail!(ErrorKind::Invalid("workers must be at least 1".into()));
        }
        if self.dex_database.capacity == 0 {
            exn::bail!(ErrorKind::Invalid("dex_database.capacity must be at least 1".into()));
        }
        if self.deployment_cache.capacity == 0 {
            exn::bail!(ErrorKind::Invalid("deployment_cache.capacity must be at least 1".into()));
        }
        if self.installer.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("installer path is empty".into()));
        }
        Ok(())
    }

    /// The dex archive database file, relative paths resolved against `cache_dir`.
    pub fn dex_database_path(&self) -> PathBuf {
        self.cache_dir.join(&self.dex_database.file)
    }

    /// The deployment cache file, or `None` when it is kept in memory.
    pub fn deployment_cache_path(&self) -> Option<PathBuf> {
        self.deployment_cache.persist.then(|| self.cache_dir.join(&self.deployment_cache.file))
    }
}
