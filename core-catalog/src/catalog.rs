//! # Catalog Store
//!
//! [`Catalog`] owns the connection pool; [`RootCatalog`] is a cheap handle
//! bound to one root's table that carries every entry operation.
//!
//! ## Table Layout
//!
//! ```text
//! has_sidecar        BOOLEAN NOT NULL
//! name               TEXT    NOT NULL   ┐ primary key
//! relative_directory TEXT    NOT NULL   ┘
//! stage              INTEGER NOT NULL   0 = pending, 1 = completed
//! modified_time      REAL
//! ```
//!
//! ## Transactions
//!
//! Every batch operation runs in one transaction. A failing row aborts the
//! whole batch: the transaction is dropped without commit, which rolls it
//! back, and the error names the offending key.

use crate::db::{create_pool, DatabaseConfig};
use crate::error::{CatalogError, Result};
use crate::models::{modified_time_of, CatalogEntry, ChangeSet, EntryKey, Stage};
use crate::naming::{quote_identifier, root_from_table_name, table_name_for_root, TABLE_PREFIX};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Expected `(column, declared type)` pairs, in table order.
const COLUMNS: [(&str, &str); 5] = [
    ("has_sidecar", "BOOLEAN"),
    ("name", "TEXT"),
    ("relative_directory", "TEXT"),
    ("stage", "INTEGER"),
    ("modified_time", "REAL"),
];

const SELECT_COLUMNS: &str = "has_sidecar, name, relative_directory, stage, modified_time";

// ============================================================================
// Catalog
// ============================================================================

/// Process-scoped handle to the catalog database.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (or create) the catalog database.
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Handle for one root's table. Does not touch the database.
    pub fn root(&self, root: &Path) -> RootCatalog {
        RootCatalog::new(self.pool.clone(), root)
    }

    /// Roots that currently have a table, decoded from the table names.
    pub async fn roots(&self) -> Result<Vec<PathBuf>> {
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, ?1) = ?2 ORDER BY name",
        )
        .bind(TABLE_PREFIX.len() as i64)
        .bind(TABLE_PREFIX)
        .fetch_all(&self.pool)
        .await
        .map_err(CatalogError::read("sqlite_master"))?;

        Ok(tables
            .into_iter()
            .filter_map(|(table,)| root_from_table_name(&table))
            .collect())
    }

    /// Close all pooled connections.
    pub async fn close(self) {
        info!("Closing catalog");
        self.pool.close().await;
    }
}

// ============================================================================
// Root Catalog
// ============================================================================

/// SQL text for one table, built once per handle.
#[derive(Debug)]
struct TableStatements {
    table: String,
    create: String,
    drop: String,
    insert: String,
    delete: String,
    update_stage: String,
    update_sidecar: String,
    update_modified_time: String,
    select_one: String,
    select_all: String,
    select_directory: String,
    select_recursive: String,
    select_stage: String,
    count: String,
}

impl TableStatements {
    fn new(table: String) -> Self {
        let q = quote_identifier(&table);
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {q} (\
                 has_sidecar BOOLEAN NOT NULL, \
                 name TEXT NOT NULL, \
                 relative_directory TEXT NOT NULL, \
                 stage INTEGER NOT NULL, \
                 modified_time REAL, \
                 PRIMARY KEY (name, relative_directory))"
            ),
            drop: format!("DROP TABLE IF EXISTS {q}"),
            insert: format!(
                "INSERT INTO {q} (has_sidecar, name, relative_directory, stage, modified_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            delete: format!("DELETE FROM {q} WHERE name = ?1 AND relative_directory = ?2"),
            update_stage: format!(
                "UPDATE {q} SET stage = ?1 WHERE name = ?2 AND relative_directory = ?3"
            ),
            update_sidecar: format!(
                "UPDATE {q} SET has_sidecar = ?1 WHERE name = ?2 AND relative_directory = ?3"
            ),
            update_modified_time: format!(
                "UPDATE {q} SET modified_time = ?1 WHERE name = ?2 AND relative_directory = ?3"
            ),
            select_one: format!(
                "SELECT {SELECT_COLUMNS} FROM {q} WHERE name = ?1 AND relative_directory = ?2"
            ),
            select_all: format!(
                "SELECT {SELECT_COLUMNS} FROM {q} ORDER BY relative_directory, name"
            ),
            select_directory: format!(
                "SELECT {SELECT_COLUMNS} FROM {q} WHERE relative_directory = ?1 ORDER BY name"
            ),
            select_recursive: format!(
                "SELECT {SELECT_COLUMNS} FROM {q} \
                 WHERE relative_directory = ?1 OR substr(relative_directory, 1, length(?2)) = ?2 \
                 ORDER BY relative_directory, name"
            ),
            select_stage: format!(
                "SELECT {SELECT_COLUMNS} FROM {q} WHERE stage = ?1 ORDER BY relative_directory, name"
            ),
            count: format!("SELECT COUNT(*) FROM {q}"),
            table,
        }
    }
}

/// Entry operations scoped to one root's table.
///
/// Selections return lazy streams that re-query on every call.
#[derive(Debug, Clone)]
pub struct RootCatalog {
    pool: SqlitePool,
    root: PathBuf,
    sql: Arc<TableStatements>,
}

impl RootCatalog {
    fn new(pool: SqlitePool, root: &Path) -> Self {
        Self {
            pool,
            root: root.to_path_buf(),
            sql: Arc::new(TableStatements::new(table_name_for_root(root))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_name(&self) -> &str {
        &self.sql.table
    }

    // ------------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------------

    /// Whether the table currently exists.
    pub async fn exists(&self) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(&self.sql.table)
                .fetch_one(&self.pool)
                .await
                .map_err(CatalogError::read(&self.sql.table))?;
        Ok(count > 0)
    }

    /// Create the table if absent.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Schema`] if a table with this name exists but its
    /// columns differ. No migration is attempted.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn ensure_schema(&self) -> Result<()> {
        let existing: Vec<(String, String)> =
            sqlx::query_as("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
                .bind(&self.sql.table)
                .fetch_all(&self.pool)
                .await
                .map_err(CatalogError::read(&self.sql.table))?;

        if existing.is_empty() {
            sqlx::query(&self.sql.create)
                .execute(&self.pool)
                .await
                .map_err(CatalogError::write(&self.sql.table))?;
            info!(table = %self.sql.table, "Created catalog table");
            return Ok(());
        }

        let compatible = existing.len() == COLUMNS.len()
            && existing
                .iter()
                .zip(COLUMNS.iter())
                .all(|((name, ty), (expected_name, expected_ty))| {
                    name == expected_name && ty.eq_ignore_ascii_case(expected_ty)
                });

        if !compatible {
            let found: Vec<String> = existing
                .iter()
                .map(|(name, ty)| format!("{} {}", name, ty))
                .collect();
            return Err(CatalogError::Schema {
                table: self.sql.table.clone(),
                message: format!("unexpected columns [{}]", found.join(", ")),
            });
        }

        debug!(table = %self.sql.table, "Catalog table already present");
        Ok(())
    }

    /// Drop the table and everything in it.
    pub async fn drop_schema(&self) -> Result<()> {
        sqlx::query(&self.sql.drop)
            .execute(&self.pool)
            .await
            .map_err(CatalogError::write(&self.sql.table))?;
        info!(table = %self.sql.table, root = %self.root.display(), "Dropped catalog table");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(CatalogError::write(&self.sql.table))
    }

    async fn commit(&self, tx: Transaction<'static, Sqlite>) -> Result<()> {
        tx.commit().await.map_err(CatalogError::write(&self.sql.table))
    }

    async fn insert_in(&self, tx: &mut Transaction<'static, Sqlite>, entry: &CatalogEntry) -> Result<()> {
        sqlx::query(&self.sql.insert)
            .bind(entry.has_sidecar)
            .bind(&entry.name)
            .bind(&entry.relative_directory)
            .bind(entry.stage.as_i64())
            .bind(entry.modified_time)
            .execute(&mut **tx)
            .await
            .map_err(CatalogError::write(entry.key()))?;
        Ok(())
    }

    async fn delete_in(&self, tx: &mut Transaction<'static, Sqlite>, key: &EntryKey) -> Result<u64> {
        let result = sqlx::query(&self.sql.delete)
            .bind(&key.name)
            .bind(&key.relative_directory)
            .execute(&mut **tx)
            .await
            .map_err(CatalogError::write(key))?;
        Ok(result.rows_affected())
    }

    async fn set_sidecar_in(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        key: &EntryKey,
        value: bool,
    ) -> Result<u64> {
        let result = sqlx::query(&self.sql.update_sidecar)
            .bind(value)
            .bind(&key.name)
            .bind(&key.relative_directory)
            .execute(&mut **tx)
            .await
            .map_err(CatalogError::write(key))?;
        Ok(result.rows_affected())
    }

    async fn set_modified_time_in(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        key: &EntryKey,
        value: Option<f64>,
    ) -> Result<u64> {
        let result = sqlx::query(&self.sql.update_modified_time)
            .bind(value)
            .bind(&key.name)
            .bind(&key.relative_directory)
            .execute(&mut **tx)
            .await
            .map_err(CatalogError::write(key))?;
        Ok(result.rows_affected())
    }

    /// Insert all entries or none of them.
    pub async fn insert_batch(&self, entries: &[CatalogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin().await?;
        for entry in entries {
            self.insert_in(&mut tx, entry).await?;
        }
        self.commit(tx).await?;
        debug!(table = %self.sql.table, count = entries.len(), "Inserted entries");
        Ok(())
    }

    /// Delete all keys or none of them. Returns the number of rows removed.
    pub async fn remove_batch(&self, keys: &[EntryKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin().await?;
        let mut removed = 0;
        for key in keys {
            removed += self.delete_in(&mut tx, key).await?;
        }
        self.commit(tx).await?;
        debug!(table = %self.sql.table, removed, "Removed entries");
        Ok(removed)
    }

    /// Move entries to `stage`. Returns the number of rows updated.
    pub async fn update_stage(&self, keys: &[EntryKey], stage: Stage) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin().await?;
        let mut updated = 0;
        for key in keys {
            let result = sqlx::query(&self.sql.update_stage)
                .bind(stage.as_i64())
                .bind(&key.name)
                .bind(&key.relative_directory)
                .execute(&mut *tx)
                .await
                .map_err(CatalogError::write(key))?;
            updated += result.rows_affected();
        }
        self.commit(tx).await?;
        info!(table = %self.sql.table, %stage, updated, "Updated stage");
        Ok(updated)
    }

    /// Returns `false` if no entry has this key.
    pub async fn update_has_sidecar(&self, key: &EntryKey, value: bool) -> Result<bool> {
        let mut tx = self.begin().await?;
        let updated = self.set_sidecar_in(&mut tx, key, value).await?;
        self.commit(tx).await?;
        Ok(updated > 0)
    }

    /// Returns `false` if no entry has this key.
    pub async fn update_modified_time(&self, key: &EntryKey, value: Option<f64>) -> Result<bool> {
        let mut tx = self.begin().await?;
        let updated = self.set_modified_time_in(&mut tx, key, value).await?;
        self.commit(tx).await?;
        Ok(updated > 0)
    }

    /// Apply one reconciliation pass in a single transaction.
    ///
    /// Removals run first so a key that was removed and re-added in the same
    /// pass does not collide.
    pub async fn apply(&self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin().await?;
        for key in &changes.removals {
            self.delete_in(&mut tx, key).await?;
        }
        for entry in &changes.inserts {
            self.insert_in(&mut tx, entry).await?;
        }
        for (key, value) in &changes.sidecar_flags {
            self.set_sidecar_in(&mut tx, key, *value).await?;
        }
        for (key, value) in &changes.modified_times {
            self.set_modified_time_in(&mut tx, key, *value).await?;
        }
        self.commit(tx).await?;

        debug!(
            table = %self.sql.table,
            inserted = changes.inserts.len(),
            removed = changes.removals.len(),
            sidecar_flags = changes.sidecar_flags.len(),
            modified_times = changes.modified_times.len(),
            "Applied change set"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn entries<'a>(
        &'a self,
        query: sqlx::query::Query<'a, Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
        key: String,
    ) -> BoxStream<'a, Result<CatalogEntry>> {
        query
            .fetch(&self.pool)
            .map(move |row| {
                row.and_then(|row| CatalogEntry::from_row(&row))
                    .map_err(CatalogError::read(&key))
            })
            .boxed()
    }

    /// Look up a single entry.
    pub async fn get(&self, key: &EntryKey) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query(&self.sql.select_one)
            .bind(&key.name)
            .bind(&key.relative_directory)
            .fetch_optional(&self.pool)
            .await
            .map_err(CatalogError::read(key))?;
        row.map(|row| CatalogEntry::from_row(&row))
            .transpose()
            .map_err(CatalogError::read(key))
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&self.sql.count)
            .fetch_one(&self.pool)
            .await
            .map_err(CatalogError::read(&self.sql.table))?;
        Ok(count)
    }

    /// Every entry of the root.
    pub fn select_all(&self) -> BoxStream<'_, Result<CatalogEntry>> {
        self.entries(sqlx::query(&self.sql.select_all), self.sql.table.clone())
    }

    /// Entries directly inside `relative_directory`.
    pub fn select_by_directory(&self, relative_directory: &str) -> BoxStream<'_, Result<CatalogEntry>> {
        let query = sqlx::query(&self.sql.select_directory).bind(relative_directory.to_string());
        self.entries(query, relative_directory.to_string())
    }

    /// Entries inside `prefix` or any directory below it. An empty prefix
    /// selects the whole root.
    pub fn select_recursive(&self, prefix: &str) -> BoxStream<'_, Result<CatalogEntry>> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.select_all();
        }
        let query = sqlx::query(&self.sql.select_recursive)
            .bind(prefix.to_string())
            .bind(format!("{}/", prefix));
        self.entries(query, prefix.to_string())
    }

    /// Entries in the given lifecycle stage.
    pub fn select_by_stage(&self, stage: Stage) -> BoxStream<'_, Result<CatalogEntry>> {
        let query = sqlx::query(&self.sql.select_stage).bind(stage.as_i64());
        self.entries(query, format!("{} stage={}", self.sql.table, stage))
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Remove every entry whose media file no longer exists on disk.
    ///
    /// Returns the purged keys.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn purge_stale_entries(&self) -> Result<Vec<EntryKey>> {
        let entries: Vec<CatalogEntry> = self.select_all().try_collect().await?;

        let mut stale = Vec::new();
        for entry in entries {
            let key = entry.key();
            let path = key.absolute_path(&self.root);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => {}
                Ok(false) => stale.push(key),
                // Unknown state is kept; the next pass will retry
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot probe entry"),
            }
        }

        if !stale.is_empty() {
            self.remove_batch(&stale).await?;
            info!(purged = stale.len(), "Purged stale entries");
        }
        Ok(stale)
    }

    /// Re-probe the modification time of every entry in one transaction.
    ///
    /// Returns the number of entries whose time changed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn refresh_modified_times(&self) -> Result<usize> {
        let entries: Vec<CatalogEntry> = self.select_all().try_collect().await?;

        let mut changes = ChangeSet::default();
        for entry in entries {
            let key = entry.key();
            let Ok(metadata) = tokio::fs::metadata(key.absolute_path(&self.root)).await else {
                continue;
            };
            let observed = modified_time_of(&metadata);
            if observed != entry.modified_time {
                changes.modified_times.push((key, observed));
            }
        }

        let updated = changes.modified_times.len();
        self.apply(&changes).await?;
        debug!(updated, "Refreshed modified times");
        Ok(updated)
    }
}
