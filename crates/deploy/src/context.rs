use apkswap_cache::{Database, DatabaseHandle, DeploymentCache, Repository, WorkQueueDatabase};
use apkswap_config::Config;
use apkswap_tasks::{Task, TaskRunner};
use exn::ResultExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::instrument;

use crate::Deployer;
use crate::device::Device;
use crate::error::{ErrorKind, Result};

/// Everything a deployment needs that outlives a single deployment: the
/// task runner, the dex archive cache and the deployment cache.
///
/// Create one per process with [`init`](DeployContext::init), hand out
/// [`Deployer`]s with [`deployer`](DeployContext::deployer), and end with
/// [`shutdown`](DeployContext::shutdown) so queued cache writes are not lost.
///
/// The context owns a Tokio runtime for the database; do not call into it
/// from async code.
#[derive(Debug)]
pub struct DeployContext {
    pub(crate) config: Config,
    pub(crate) runner: TaskRunner<ErrorKind>,
    pub(crate) queue: Arc<WorkQueueDatabase>,
    pub(crate) deployments: Arc<DeploymentCache>,
    // Caching and bookkeeping still running per (serial, application id).
    background: Mutex<HashMap<(String, String), Vec<Task<(), ErrorKind>>>>,
    database: Database,
    // Dropped last: the queue consumer and the pool live on it.
    pub(crate) runtime: Runtime,
}

impl DeployContext {
    #[instrument(level = "debug", skip_all, fields(cache_dir = %config.cache_dir.display()))]
    pub fn init(config: &Config) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        std::fs::create_dir_all(&config.cache_dir).or_raise(|| ErrorKind::Cache)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("apkswap-cache")
            .enable_all()
            .build()
            .or_raise(|| ErrorKind::Internal("could not start the cache runtime".into()))?;
        let database = runtime.block_on(Database::connect(config.dex_database_path())).or_raise(|| ErrorKind::Cache)?;
        let repository: DatabaseHandle = Arc::new(Repository::new(&database, config.dex_database.capacity));
        let queue = {
            let _guard = runtime.enter();
            Arc::new(WorkQueueDatabase::new(repository))
        };

        let deployments = match config.deployment_cache_path() {
            Some(file) => open_deployments(&file, config.deployment_cache.capacity)?,
            None => DeploymentCache::in_memory(config.deployment_cache.capacity),
        };

        tracing::debug!(workers = config.workers, "Deploy context ready");
        Ok(Self {
            config: config.clone(),
            runner: TaskRunner::new(config.workers),
            queue,
            deployments: Arc::new(deployments),
            background: Mutex::default(),
            database,
            runtime,
        })
    }

    pub fn deployer<'a>(&'a self, device: Arc<dyn Device>) -> Deployer<'a> {
        Deployer::new(self, device)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn deployments(&self) -> &DeploymentCache {
        &self.deployments
    }

    /// The dex archive cache. Reads go straight to the store; writes are
    /// serialized behind the work queue.
    pub fn dex_database(&self) -> DatabaseHandle {
        self.queue.clone()
    }

    pub(crate) fn track_background(&self, serial: &str, application_id: &str, tasks: Vec<Task<(), ErrorKind>>) {
        let key = (serial.to_string(), application_id.to_string());
        self.background.lock().entry(key).or_default().extend(tasks);
    }

    /// Waits for the background tasks of the last deployment to this pair.
    /// Their failures were already logged by the runner and only cost a
    /// slower next deployment, so they are not returned.
    pub(crate) fn settle_background(&self, serial: &str, application_id: &str) {
        let key = (serial.to_string(), application_id.to_string());
        let Some(tasks) = self.background.lock().remove(&key) else {
            return;
        };
        for task in tasks {
            if let Err(e) = task.get() {
                tracing::debug!(task = task.name(), error = %e, "Background task failed");
            }
        }
    }

    /// Blocks until every background task has settled.
    pub fn wait_for_background_tasks(&self) -> Result<()> {
        self.runner.join();
        self.background.lock().clear();
        self.runtime.block_on(self.queue.flush()).or_raise(|| ErrorKind::Cache)
    }

    /// Waits for background caching, then closes the database.
    #[instrument(level = "debug", skip_all)]
    pub fn shutdown(self) -> Result<()> {
        let flushed = self.wait_for_background_tasks();
        for metric in self.runner.metrics() {
            tracing::trace!(task = %metric.name, status = %metric.status, elapsed_ms = metric.duration.as_millis() as u64, "Task metric");
        }
        self.runtime.block_on(self.database.close());
        flushed
    }
}

/// Opens the persisted deployment cache, starting over when the file is corrupt.
fn open_deployments(file: &Path, capacity: usize) -> Result<DeploymentCache> {
    match DeploymentCache::open(file, capacity) {
        Ok(cache) => Ok(cache),
        Err(e) if matches!(&*e, apkswap_cache::error::ErrorKind::InvalidData(_)) => {
            tracing::warn!(file = %file.display(), error = ?e, "Discarding corrupt deployment cache");
            std::fs::remove_file(file).or_raise(|| ErrorKind::Cache)?;
            DeploymentCache::open(file, capacity).or_raise(|| ErrorKind::Cache)
        }
        Err(e) => Err(e.raise(ErrorKind::Cache)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apkswap_cache::OverlayId;

    fn config(dir: &Path) -> Config {
        Config { cache_dir: dir.join("cache"), workers: 2, ..Config::default() }
    }

    #[test]
    fn creates_the_cache_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let context = DeployContext::init(&config).unwrap();
        assert!(config.dex_database_path().is_file());
        assert!(context.deployments().is_empty());
        context.shutdown().unwrap();
    }

    #[test]
    fn deployments_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let overlay = OverlayId::base_install(&[]);

        let context = DeployContext::init(&config).unwrap();
        context.deployments().store("serial", "com.example.app", Vec::new(), overlay.clone()).unwrap();
        context.shutdown().unwrap();

        let context = DeployContext::init(&config).unwrap();
        assert_eq!(context.deployments().get("serial", "com.example.app").unwrap().overlay_id, overlay);
        context.shutdown().unwrap();
    }

    #[test]
    fn corrupt_deployment_cache_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let file = config.deployment_cache_path().unwrap();
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"{ not json").unwrap();

        let context = DeployContext::init(&config).unwrap();
        assert!(context.deployments().is_empty());
        assert!(!file.exists());
        context.shutdown().unwrap();
    }

    #[test]
    fn in_memory_deployment_cache_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.deployment_cache.persist = false;
        let context = DeployContext::init(&config).unwrap();
        context.deployments().store("serial", "app", Vec::new(), OverlayId::base_install(&[])).unwrap();
        context.shutdown().unwrap();
        assert!(!config.cache_dir.join(&config.deployment_cache.file).exists());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { workers: 0, ..config(dir.path()) };
        let err = DeployContext::init(&config).unwrap_err();
        assert_eq!(*err, ErrorKind::Config);
    }
}
