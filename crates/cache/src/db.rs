//! SQLite store behind the dex archive cache.

use exn::ResultExt;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Identifies the layout of the tables in `queries/schema.sql`. Bump it
/// whenever that layout changes: stores tagged with any other value are wiped.
pub const SCHEMA_VERSION: &str = "dex-archives/2";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
// Writes are serialized by the work queue; the rest are lookups.
const POOL_SIZE: u32 = 4;

/// Pooled connections to one dex archive store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store at `path`, creating the file when missing.
    ///
    /// A store tagged with another [`SCHEMA_VERSION`] is emptied first.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = options().filename(path.as_ref()).create_if_missing(true);
        Self::open(options, POOL_SIZE).await
    }

    /// Opens a private in-memory store. Not gated behind `cfg(test)`, since
    /// dependent crates build their test fixtures on it.
    pub async fn connect_in_memory() -> Result<Self> {
        // Every connection to ":memory:" gets a database of its own.
        Self::open(options().filename(":memory:"), 1).await
    }

    async fn open(options: SqliteConnectOptions, connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(connections)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.prepare_schema().await?;
        Ok(db)
    }

    /// Creates the tables, first dropping everything if the store was written
    /// under another schema version. There are no migrations: the contents
    /// are a cache and can always be rebuilt from the next deployment.
    #[instrument("preparing dex archive schema", skip(self))]
    async fn prepare_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/create_metadata.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        let found: Option<String> = sqlx::query_scalar(include_str!("../queries/get_metadata.sql"))
            .bind(META_KEY_SCHEMA_VERSION)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        if found.as_deref() != Some(SCHEMA_VERSION) {
            if let Some(found) = &found {
                tracing::warn!(found = %found, expected = SCHEMA_VERSION, "Dex archive schema mismatch; discarding cache");
            }
            Self::drop_tables(&mut tx).await?;
        }
        sqlx::raw_sql(include_str!("../queries/schema.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        sqlx::query(include_str!("../queries/set_metadata.sql"))
            .bind(META_KEY_SCHEMA_VERSION)
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    async fn drop_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
        let tables: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_tables.sql"))
            .fetch_all(&mut **tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        // Tables from an older layout may reference each other in any order.
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut **tx)
            .await
            .or_raise(|| ErrorKind::Schema)?;
        for table in tables {
            tracing::debug!(table = %table, "Dropping table");
            let statement = format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\""));
            sqlx::query(&statement)
                .execute(&mut **tx)
                .await
                .or_raise(|| ErrorKind::Schema)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for every connection to come back to the pool, then closes them.
    /// The store must not be used afterwards.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

/// Connection settings shared by file and in-memory stores. Applied to
/// every connection the pool opens.
fn options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        // Eviction relies on ON DELETE CASCADE.
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(1500))
        .auto_vacuum(SqliteAutoVacuum::None)
        .pragma("wal_autocheckpoint", "800")
        .pragma("cache_size", "-4096")
        .pragma("temp_store", "MEMORY")
}
