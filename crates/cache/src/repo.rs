//! SQLite implementation of [`DexArchiveDatabase`].

use async_trait::async_trait;
use exn::ResultExt;
use sqlx::SqlitePool;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::{ClassRow, DexFileRow, from_sql, to_sql};
use crate::{ClassChecksums, Database, DexArchiveDatabase, DexFileEntry, DexFileIndex};

/// Default bound on the number of live dex file rows.
pub const DEFAULT_CAPACITY: usize = 400;

/// Repository for dex files, archive lists and class checksums.
///
/// # Relationships
///
/// - An archive is an ordered list of dex files, keyed by the archive checksum.
/// - The same dex file may belong to many archives (unchanged between builds).
/// - Deleting a dex file cascades to its class checksums, and every archive
///   list containing it is deleted outright rather than left with a gap.
///
/// Each operation runs in its own transaction. Concurrent writers should go
/// through a [`WorkQueueDatabase`](crate::WorkQueueDatabase).
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    capacity: usize,
}

impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self::new(db, DEFAULT_CAPACITY)
    }
}

impl Repository {
    /// Create a repository holding at most `capacity` dex files.
    pub fn new(db: &Database, capacity: usize) -> Self {
        Self { pool: db.pool().clone(), capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Evicts the oldest dex files until at most `capacity` remain.
    ///
    /// Members of the `keep` archive go last, so an archive that fits within
    /// the capacity never loses one of its own dex files.
    async fn evict(&self, tx: &mut sqlx::SqliteConnection, keep: Option<u64>) -> Result<()> {
        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dex_files")
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let capacity = i64::try_from(self.capacity).or_raise(|| ErrorKind::InvalidData("capacity"))?;
        if live <= capacity {
            return Ok(());
        }
        let oldest: Vec<i64> = sqlx::query_scalar(include_str!("../queries/oldest_dex_files.sql"))
            .bind(keep.map(to_sql))
            .bind(live - capacity)
            .fetch_all(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for idx in &oldest {
            sqlx::query(include_str!("../queries/evict_archives.sql"))
                .bind(idx)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            sqlx::query(include_str!("../queries/delete_dex_file.sql"))
                .bind(idx)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tracing::debug!(evicted = ?oldest, capacity = self.capacity, "Evicted oldest dex files");
        Ok(())
    }

    /// Finds or inserts a dex file row. The flag is `true` for a new row.
    async fn upsert_dex_file(&self, tx: &mut sqlx::SqliteConnection, checksum: u64, name: &str) -> Result<(i64, bool)> {
        let existing: Option<i64> = sqlx::query_scalar(include_str!("../queries/find_dex_file.sql"))
            .bind(to_sql(checksum))
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some(idx) = existing {
            return Ok((idx, false));
        }
        let idx: i64 = sqlx::query_scalar(include_str!("../queries/insert_dex_file.sql"))
            .bind(to_sql(checksum))
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok((idx, true))
    }

    async fn write_dex_file_list(
        &self,
        tx: &mut sqlx::SqliteConnection,
        archive_checksum: u64,
        indices: &[DexFileIndex],
    ) -> Result<()> {
        sqlx::query(include_str!("../queries/delete_archive.sql"))
            .bind(to_sql(archive_checksum))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for (position, index) in indices.iter().enumerate() {
            let position = i64::try_from(position).or_raise(|| ErrorKind::InvalidData("position"))?;
            let inserted = sqlx::query(include_str!("../queries/insert_archive_entry.sql"))
                .bind(to_sql(archive_checksum))
                .bind(position)
                .bind(index.0)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            if inserted.rows_affected() == 0 {
                exn::bail!(ErrorKind::UnknownDexFile(index.0));
            }
        }
        Ok(())
    }

    async fn dex_file_exists(&self, tx: &mut sqlx::SqliteConnection, index: DexFileIndex) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT idx FROM dex_files WHERE idx = ?")
            .bind(index.0)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl DexArchiveDatabase for Repository {
    // =========================================================================
    // Dex files
    // =========================================================================

    #[instrument(level = "debug", skip(self))]
    async fn add_dex_file(&self, checksum: u64, name: &str) -> Result<DexFileIndex> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let (idx, inserted) = self.upsert_dex_file(&mut *tx, checksum, name).await?;
        if inserted {
            self.evict(&mut *tx, None).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(DexFileIndex(idx))
    }

    async fn dex_file_index(&self, checksum: u64) -> Result<Option<DexFileIndex>> {
        let idx: Option<i64> = sqlx::query_scalar(include_str!("../queries/get_dex_file_index.sql"))
            .bind(to_sql(checksum))
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(idx.map(DexFileIndex))
    }

    // =========================================================================
    // Archives
    // =========================================================================

    async fn fill_dex_file_list(&self, archive_checksum: u64, indices: &[DexFileIndex]) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        // Dropping the transaction on error rolls back the delete.
        self.write_dex_file_list(&mut *tx, archive_checksum, indices).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    #[instrument(level = "debug", skip(self, files), fields(files = files.len()))]
    async fn add_archive(&self, archive_checksum: u64, files: &[(u64, String)]) -> Result<Vec<DexFileIndex>> {
        if files.len() > self.capacity {
            exn::bail!(ErrorKind::ArchiveTooLarge(files.len(), self.capacity));
        }
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut indices = Vec::with_capacity(files.len());
        for (checksum, name) in files {
            let (idx, _) = self.upsert_dex_file(&mut *tx, *checksum, name).await?;
            indices.push(DexFileIndex(idx));
        }
        self.write_dex_file_list(&mut *tx, archive_checksum, &indices).await?;
        self.evict(&mut *tx, Some(archive_checksum)).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(indices)
    }

    async fn dex_files(&self, archive_checksum: u64) -> Result<Vec<DexFileEntry>> {
        let rows: Vec<DexFileRow> = sqlx::query_as(include_str!("../queries/get_dex_files.sql"))
            .bind(to_sql(archive_checksum))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(DexFileEntry::from).collect())
    }

    // =========================================================================
    // Classes
    // =========================================================================

    async fn fill_class_checksums(&self, index: DexFileIndex, classes: &ClassChecksums) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        if !self.dex_file_exists(&mut *tx, index).await? {
            exn::bail!(ErrorKind::UnknownDexFile(index.0));
        }
        sqlx::query(include_str!("../queries/delete_classes.sql"))
            .bind(index.0)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for (name, checksum) in classes {
            sqlx::query(include_str!("../queries/insert_class.sql"))
                .bind(index.0)
                .bind(name)
                .bind(to_sql(*checksum))
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    async fn class_checksums(&self, index: DexFileIndex) -> Result<ClassChecksums> {
        let rows: Vec<ClassRow> = sqlx::query_as(include_str!("../queries/get_classes.sql"))
            .bind(index.0)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(|row| (row.name, from_sql(row.checksum))).collect())
    }
}
