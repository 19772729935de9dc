//! SQLite backend implementation using sqlx.

use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool, SqlitePoolOptions,
    SqliteSynchronous,
};

use crate::storage::StoreError;
use crate::storage::db::StoreTarget;
use crate::storage::schema::init_schema;

/// SQLite connection pool wrapper.
///
/// Wraps sqlx's SqlitePool with WAL mode and the target's pool settings.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool")
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Connect to the target database and ensure the schema exists.
    ///
    /// # Configuration
    ///
    /// - WAL journal mode for concurrent readers
    /// - Normal synchronous mode for performance with durability
    /// - Create database if not exists
    /// - In-memory targets are pinned to one never-recycled connection, since
    ///   every SQLite memory connection is its own database
    pub async fn connect(target: &StoreTarget) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&target.url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(target.connect_timeout);
        pool_options = if target.is_in_memory() {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(target.pool_size.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        init_schema(&pool).await?;

        Ok(Self { inner: pool })
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Close the connection pool gracefully.
    ///
    /// Waits for checked-out connections to be returned.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Run a passive WAL checkpoint.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.inner)
            .await?;
        Ok(())
    }
}
