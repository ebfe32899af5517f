//! Serialized writes to a dex archive store.

use async_trait::async_trait;
use exn::ResultExt;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ErrorKind, Result};
use crate::{ClassChecksums, DatabaseHandle, DexArchiveDatabase, DexFileEntry, DexFileIndex};

type Job = Box<dyn FnOnce(DatabaseHandle) -> BoxFuture<'static, ()> + Send>;

/// Wraps a store so that every mutation runs on one consumer, one at a time,
/// in the order it was submitted.
///
/// An update enqueued with [`enqueue`](Self::enqueue) may perform several
/// reads and writes; no other queued update interleaves with it. Reads made
/// through the [`DexArchiveDatabase`] methods go straight to the inner store
/// and are only eventually consistent with submission order: they may or may
/// not observe an update that is queued but has not run yet, but never a
/// partially applied one.
///
/// The consumer is spawned on the current Tokio runtime, so construct this
/// from within one.
#[derive(Debug)]
pub struct WorkQueueDatabase {
    inner: DatabaseHandle,
    sender: mpsc::UnboundedSender<Job>,
}

impl WorkQueueDatabase {
    pub fn new(inner: DatabaseHandle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drain(inner.clone(), receiver));
        Self { inner, sender }
    }

    /// Queues `update` to run against the inner store.
    ///
    /// The update is queued immediately, not when the returned future is
    /// first polled. Dropping the future does not cancel the update.
    pub fn enqueue<F, Fut, R>(&self, update: F) -> impl Future<Output = Result<R>> + Send + 'static
    where
        F: FnOnce(DatabaseHandle) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let job: Job = Box::new(move |db| {
            Box::pin(async move {
                _ = done.send(update(db).await);
            })
        });
        let queued = self.sender.send(job).is_ok();
        async move {
            if !queued {
                exn::bail!(ErrorKind::QueueClosed);
            }
            result.await.or_raise(|| ErrorKind::QueueClosed)
        }
    }

    /// Waits until every update queued before this call has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.enqueue(|_| async {}).await
    }

    /// The wrapped store, for callers that need to bypass the queue.
    pub fn inner(&self) -> &DatabaseHandle {
        &self.inner
    }
}

async fn drain(db: DatabaseHandle, mut receiver: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = receiver.recv().await {
        // A panicking update loses its own result (the caller sees
        // QueueClosed) but must not take the rest of the queue down with it.
        if AssertUnwindSafe(job(db.clone())).catch_unwind().await.is_err() {
            tracing::error!("Dex archive database update panicked");
        }
    }
    tracing::trace!("Dex archive work queue drained");
}

#[async_trait]
impl DexArchiveDatabase for WorkQueueDatabase {
    async fn add_dex_file(&self, checksum: u64, name: &str) -> Result<DexFileIndex> {
        let name = name.to_string();
        self.enqueue(move |db| async move { db.add_dex_file(checksum, &name).await }).await?
    }

    async fn dex_file_index(&self, checksum: u64) -> Result<Option<DexFileIndex>> {
        self.inner.dex_file_index(checksum).await
    }

    async fn fill_dex_file_list(&self, archive_checksum: u64, indices: &[DexFileIndex]) -> Result<()> {
        let indices = indices.to_vec();
        self.enqueue(move |db| async move { db.fill_dex_file_list(archive_checksum, &indices).await })
            .await?
    }

    async fn add_archive(&self, archive_checksum: u64, files: &[(u64, String)]) -> Result<Vec<DexFileIndex>> {
        let files = files.to_vec();
        self.enqueue(move |db| async move { db.add_archive(archive_checksum, &files).await }).await?
    }

    async fn dex_files(&self, archive_checksum: u64) -> Result<Vec<DexFileEntry>> {
        self.inner.dex_files(archive_checksum).await
    }

    async fn fill_class_checksums(&self, index: DexFileIndex, classes: &ClassChecksums) -> Result<()> {
        let classes = classes.clone();
        self.enqueue(move |db| async move { db.fill_class_checksums(index, &classes).await }).await?
    }

    async fn class_checksums(&self, index: DexFileIndex) -> Result<ClassChecksums> {
        self.inner.class_checksums(index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Repository};
    use std::sync::Arc;
    use std::time::Duration;

    async fn queue() -> WorkQueueDatabase {
        let db = Database::connect_in_memory().await.unwrap();
        WorkQueueDatabase::new(Arc::new(Repository::new(&db, 100)))
    }

    #[tokio::test]
    async fn updates_run_in_submission_order() {
        let queue = queue().await;
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pending = Vec::new();
        for step in 0..10u64 {
            let order = order.clone();
            pending.push(queue.enqueue(move |db| async move {
                // Later submissions sleep less; only serialization keeps them in order.
                tokio::time::sleep(Duration::from_millis(10 - step)).await;
                db.add_dex_file(step, "classes.dex").await.unwrap();
                order.lock().push(step);
            }));
        }
        for result in futures::future::join_all(pending).await {
            result.unwrap();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn read_then_write_updates_are_atomic() {
        let queue = queue().await;
        let index = queue.add_dex_file(1, "classes.dex").await.unwrap();
        let mut pending = Vec::new();
        for _ in 0..20 {
            pending.push(queue.enqueue(move |db| async move {
                let mut classes = db.class_checksums(index).await.unwrap();
                tokio::task::yield_now().await;
                let next = classes.len() as u64;
                classes.insert(format!("a.C{next}"), next);
                db.fill_class_checksums(index, &classes).await.unwrap();
            }));
        }
        futures::future::join_all(pending).await;
        assert_eq!(queue.class_checksums(index).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn trait_writes_are_visible_after_they_resolve() {
        let queue = queue().await;
        let a = queue.add_dex_file(10, "classes.dex").await.unwrap();
        let b = queue.add_dex_file(20, "classes2.dex").await.unwrap();
        queue.fill_dex_file_list(99, &[a, b]).await.unwrap();
        queue.flush().await.unwrap();
        let names: Vec<String> = queue.dex_files(99).await.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["classes.dex", "classes2.dex"]);
    }

    #[tokio::test]
    async fn archives_are_recorded_through_the_queue() {
        let queue = queue().await;
        let files = vec![(10, "classes.dex".to_string()), (20, "classes2.dex".to_string())];
        let indices = queue.add_archive(99, &files).await.unwrap();
        assert_eq!(indices.len(), 2);
        let recorded: Vec<DexFileIndex> = queue.dex_files(99).await.unwrap().into_iter().map(|f| f.index).collect();
        assert_eq!(recorded, indices);
    }

    fn broken_update() {
        panic!("broken update");
    }

    #[tokio::test]
    async fn panicking_update_does_not_stop_the_queue() {
        let queue = queue().await;
        let err = queue.enqueue(|_| async { broken_update() }).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::QueueClosed));
        assert!(queue.add_dex_file(1, "classes.dex").await.is_ok());
    }
}
