//! Database transport layer.
//!
//! - [`SqlitePool`]: connection pool wrapper for SQLite
//! - [`Connector`]: how a client's pool is constructed; the default
//!   [`SqliteConnector`] opens a real pool, tests substitute their own
//! - [`StoreTarget`]: resolved connection parameters
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect(&target).await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::storage::StoreError;

pub use sqlite::SqlitePool;

/// Resolved connection parameters for one store target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    /// Store target identifier.
    pub project: String,
    /// sqlx connection URL.
    pub url: String,
    /// Directory to create before connecting (None for emulator URLs).
    pub data_dir: Option<PathBuf>,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// Pool acquire timeout.
    pub connect_timeout: Duration,
    /// WAL checkpoint interval for the client's background task.
    pub checkpoint_interval: Duration,
}

impl StoreTarget {
    /// Whether the URL names a private in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Constructs the transport behind a client.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a pool for `target`. Called once per client construction.
    async fn connect(&self, target: &StoreTarget) -> Result<SqlitePool, StoreError>;
}

/// Default connector: opens a SQLite pool and prepares its directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, target: &StoreTarget) -> Result<SqlitePool, StoreError> {
        if let Some(dir) = &target.data_dir
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        SqlitePool::connect(target).await
    }
}
