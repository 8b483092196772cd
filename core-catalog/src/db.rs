//! # Catalog Database
//!
//! Connection pool for the catalog's SQLite file.
//!
//! File databases run in WAL mode so listing queries never wait for a
//! reconciliation transaction. An in-memory database exists only as long as
//! its connection, so [`DatabaseConfig::in_memory`] pins the pool to one
//! connection that is never recycled.

use crate::error::{CatalogError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Page cache per connection, in KiB (negative `cache_size` pragma)
const CACHE_SIZE_KIB: i64 = 16_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

/// Pool settings for the catalog database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub location: DatabaseLocation,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a writer waits on a locked database before failing
    pub busy_timeout: Duration,
    /// Recycle connections after this long; `None` keeps them forever
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub statement_cache_capacity: usize,
}

impl DatabaseConfig {
    /// Catalog stored at `path`, created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            statement_cache_capacity: 64,
        }
    }

    /// Private catalog discarded when the pool closes.
    pub fn in_memory() -> Self {
        Self {
            location: DatabaseLocation::Memory,
            max_connections: 1,
            max_lifetime: None,
            idle_timeout: None,
            ..Self::new(PathBuf::new())
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = match &self.location {
            DatabaseLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            DatabaseLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };
        Ok(options
            .busy_timeout(self.busy_timeout)
            .pragma("cache_size", format!("-{}", CACHE_SIZE_KIB))
            .statement_cache_capacity(self.statement_cache_capacity))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Open the pool and check that it answers queries.
///
/// # Errors
///
/// [`CatalogError::Connection`] if the database cannot be opened or queried.
pub async fn create_pool(config: DatabaseConfig) -> Result<SqlitePool> {
    info!(location = ?config.location, max_connections = config.max_connections, "Opening catalog database");

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .connect_with(config.connect_options()?)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open catalog database");
            CatalogError::Connection(e)
        })?;

    health_check(&pool).await?;
    debug!(connections = pool.size(), "Catalog database ready");
    Ok(pool)
}

pub async fn health_check(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
        .map_err(|e| {
            warn!(error = %e, "Catalog database health check failed");
            CatalogError::Connection(e)
        })
}
