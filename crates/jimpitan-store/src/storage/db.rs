//! SQLite storage gateway (embedded, single shared connection)

use crate::config::StoreConfig;
use crate::error::{is_busy, Result, StoreError};
use crate::storage::schema::{SchemaManager, IDX_CATEGORY, IDX_CATEGORY_DATE, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use jimpitan_types::{
    Category, Contribution, ContributionPatch, DatabaseSize, DeleteSummary, NewContribution,
    Setting, StoreHealth, StoreName,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SELECT_CONTRIBUTION: &str =
    "SELECT id, contributor, amount, category, date, created_at, updated_at FROM contributions";

/// Bounds of a whole-category range scan over the `(category, date)` index
const DATE_RANGE_MIN: &str = "";
const DATE_RANGE_MAX: &str = "\u{10FFFF}";

/// Ways of answering a `(category, date)` query, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryPath {
    /// Exact or range lookup on the `(category, date)` index
    Composite,
    /// `category` index, date filtered in process
    CategoryIndex,
    /// Full table scan, both filtered in process
    Scan,
}

/// Transactional CRUD and query surface over the record stores.
///
/// Holds the one connection of this process. A version change from another
/// connection closes it; the next call opens it again.
pub struct StorageGateway {
    config: StoreConfig,
    schema: SchemaManager,
    pool: RwLock<Option<SqlitePool>>,
}

impl StorageGateway {
    /// Open the database and bring its schema up to date
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let gateway = Self {
            schema: SchemaManager::new(config.migration),
            config,
            pool: RwLock::new(None),
        };
        gateway.pool().await?;

        Ok(gateway)
    }

    pub fn database_path(&self) -> &Path {
        &self.config.database_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Shared pool, opening it first if the gateway is uninitialized
    pub(crate) async fn pool(&self) -> Result<SqlitePool> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = self.connect().await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn connect(&self) -> Result<SqlitePool> {
        let path = &self.config.database_path;
        info!("Opening SQLite database at: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Initialization(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| open_failure(path, e))?;

        if let Err(e) = self.prepare_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }

        info!("Database initialization complete");
        Ok(pool)
    }

    async fn prepare_schema(&self, pool: &SqlitePool) -> Result<()> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| open_failure(&self.config.database_path, e))?;

        self.schema.upgrade(&mut conn).await?;

        let layout = SchemaManager::inspect(&mut conn).await?;
        let missing = layout.missing_indexes(SCHEMA_VERSION);
        if !missing.is_empty() {
            warn!("Indexes missing, queries will use fallback paths: {:?}", missing);
        }
        Ok(())
    }

    /// Close the connection. The next call reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Database connection closed");
        }
    }

    /// Another connection changed the schema: drop ours and let the next caller reopen
    pub async fn handle_version_change(&self) {
        warn!("Database schema changed by another connection, closing local connection");
        self.close().await;
    }

    /// Returns true when the installed version no longer matches ours, after
    /// closing the connection.
    ///
    /// Nothing pushes version changes to this process. `Ledger::load_day` polls
    /// this before reading storage; other callers must poll it themselves.
    pub async fn check_version(&self) -> Result<bool> {
        let pool = match self.pool.read().await.clone() {
            Some(pool) => pool,
            None => return Ok(false),
        };

        let mut conn = pool.acquire().await?;
        let version = SchemaManager::version(&mut conn).await?;
        drop(conn);

        if version != SCHEMA_VERSION {
            self.handle_version_change().await;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete the whole database and start over empty. Never called automatically.
    pub async fn repair(&self) -> Result<()> {
        let path = self.config.database_path.clone();
        warn!("Repairing database, deleting {}", path.display());

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }

        for suffix in ["", "-wal", "-shm"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            match tokio::fs::remove_file(PathBuf::from(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let pool = self.connect().await?;
        *guard = Some(pool);
        info!("Database repaired and reinitialized");
        Ok(())
    }

    // Contribution operations

    pub async fn add(&self, record: &NewContribution) -> Result<i64> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;

        let id = insert_contribution(&mut conn, record, Utc::now())
            .await
            .map_err(|e| {
                StoreError::Write(format!(
                    "Failed to save contribution for {}: {}",
                    record.contributor, e
                ))
            })?;

        debug!(id, category = %record.category, "Contribution added");
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Contribution>> {
        let pool = self.pool().await?;
        let row: Option<ContributionRow> =
            sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_CONTRIBUTION))
                .bind(id)
                .fetch_optional(&pool)
                .await?;

        row.map(Contribution::try_from).transpose()
    }

    /// Merge `patch` into the stored record and stamp `updated_at`
    pub async fn update(&self, id: i64, patch: &ContributionPatch) -> Result<Contribution> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        let row: Option<ContributionRow> =
            sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_CONTRIBUTION))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let mut record = match row {
            Some(row) => Contribution::try_from(row)?,
            None => return Err(StoreError::NotFound { id }),
        };

        patch.apply_to(&mut record);
        record.updated_at = Some(Utc::now());

        sqlx::query(
            r#"
            UPDATE contributions
            SET contributor = ?1, amount = ?2, category = ?3, date = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(&record.contributor)
        .bind(record.amount)
        .bind(record.category.as_str())
        .bind(&record.date)
        .bind(record.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Write(format!("Failed to update contribution {}: {}", id, e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Write(format!("Failed to update contribution {}: {}", id, e)))?;

        debug!(id, "Contribution updated");
        Ok(record)
    }

    /// Deleting an id that does not exist succeeds
    pub async fn delete(&self, id: i64) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM contributions WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Write(format!("Failed to delete contribution {}: {}", id, e)))?;

        Ok(())
    }

    /// Records of `category` on `date`, or on every date when `date` is `None`
    pub async fn query_by_category_and_date(
        &self,
        category: Category,
        date: Option<&str>,
    ) -> Result<Vec<Contribution>> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        select_with_fallback(&mut conn, category, date).await
    }

    /// Insert all records in one transaction.
    ///
    /// On failure the records before the failing one stay committed; the error
    /// carries the failing position and how many were kept.
    pub async fn batch_add(&self, records: &[NewContribution]) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(|e| StoreError::Transaction {
            index: None,
            committed: 0,
            message: format!("Failed to start batch: {}", e),
        })?;

        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            match insert_contribution(&mut tx, record, created_at).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!(index, "Batch insert failed: {}", e);
                    let committed = match tx.commit().await {
                        Ok(()) => ids.len(),
                        Err(commit_err) => {
                            warn!("Failed to commit batch prefix: {}", commit_err);
                            0
                        }
                    };
                    return Err(StoreError::Transaction {
                        index: Some(index),
                        committed,
                        message: format!("Failed to save item at index {}: {}", index, e),
                    });
                }
            }
        }

        tx.commit().await.map_err(|e| StoreError::Transaction {
            index: None,
            committed: 0,
            message: format!("Failed to commit batch: {}", e),
        })?;

        debug!(count = ids.len(), "Batch added");
        Ok(ids)
    }

    /// Delete every record of `category` on `date`, one by one in a single
    /// transaction. A failed delete is counted and the rest carry on.
    pub async fn delete_by_category_and_date(
        &self,
        category: Category,
        date: &str,
    ) -> Result<DeleteSummary> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        let matched = select_with_fallback(&mut tx, category, Some(date)).await?;

        let mut summary = DeleteSummary::default();
        for record in &matched {
            match sqlx::query("DELETE FROM contributions WHERE id = ?1")
                .bind(record.id)
                .execute(&mut *tx)
                .await
            {
                Ok(_) => summary.deleted_count += 1,
                Err(e) => {
                    warn!(id = record.id, "Failed to delete contribution: {}", e);
                    summary.error_count += 1;
                }
            }
        }

        tx.commit().await.map_err(|e| StoreError::Transaction {
            index: None,
            committed: 0,
            message: format!("Transaction failed during deletion: {}", e),
        })?;

        info!(
            category = %category,
            date,
            deleted = summary.deleted_count,
            errors = summary.error_count,
            "Deleted contributions by date"
        );
        Ok(summary)
    }

    pub async fn get_all(&self) -> Result<Vec<Contribution>> {
        let pool = self.pool().await?;
        let rows: Vec<ContributionRow> =
            sqlx::query_as(&format!("{} ORDER BY id", SELECT_CONTRIBUTION))
                .fetch_all(&pool)
                .await?;

        rows.into_iter().map(Contribution::try_from).collect()
    }

    pub async fn count(&self, store: StoreName) -> Result<u64> {
        let pool = self.pool().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", store.as_str()))
            .fetch_one(&pool)
            .await?;
        Ok(count as u64)
    }

    /// Existence and record count of every store. Faults are reported as
    /// `exists: false`, never returned.
    pub async fn health_check(&self) -> Vec<StoreHealth> {
        let mut report = Vec::with_capacity(StoreName::ALL.len());
        for store in StoreName::ALL {
            let health = match self.store_health(store).await {
                Ok(health) => health,
                Err(e) => {
                    warn!(store = %store, "Health check failed: {}", e);
                    StoreHealth::missing(store)
                }
            };
            report.push(health);
        }
        report
    }

    async fn store_health(&self, store: StoreName) -> Result<StoreHealth> {
        let pool = self.pool().await?;
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(store.as_str())
        .fetch_one(&pool)
        .await?;

        if tables == 0 {
            return Ok(StoreHealth::missing(store));
        }

        let count = self.count(store).await?;
        Ok(StoreHealth {
            store,
            exists: true,
            count: Some(count),
        })
    }

    pub async fn database_size(&self) -> Result<DatabaseSize> {
        let pool = self.pool().await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&pool)
            .await?;

        Ok(DatabaseSize::from_bytes((page_count * page_size).max(0) as u64))
    }

    // Setting operations

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await?;
        Ok(value)
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Write(format!("Failed to save setting {}: {}", key, e)))?;

        Ok(())
    }

    pub async fn list_settings(&self) -> Result<Vec<Setting>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
            .fetch_all(&pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| Setting { key, value })
            .collect())
    }

    #[cfg(test)]
    pub(crate) async fn drop_index(&self, name: &str) {
        let pool = self.pool().await.unwrap();
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", name))
            .execute(&pool)
            .await
            .unwrap();
    }
}

/// Opening fails with `Initialization`. A lock held by another connection is
/// reported as a blocked open and not retried.
fn open_failure(path: &Path, e: sqlx::Error) -> StoreError {
    if is_busy(&e) {
        warn!("Opening {} blocked by another connection: {}", path.display(), e);
        return StoreError::Initialization(format!(
            "Database at {} is blocked by another open connection: {}",
            path.display(),
            e
        ));
    }
    StoreError::Initialization(format!("Failed to open database at {}: {}", path.display(), e))
}

async fn insert_contribution(
    conn: &mut SqliteConnection,
    record: &NewContribution,
    created_at: DateTime<Utc>,
) -> std::result::Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO contributions (contributor, amount, category, date, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&record.contributor)
    .bind(record.amount)
    .bind(record.category.as_str())
    .bind(&record.date)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Composite index first, then the category index, then a scan
async fn select_with_fallback(
    conn: &mut SqliteConnection,
    category: Category,
    date: Option<&str>,
) -> Result<Vec<Contribution>> {
    match select_contributions(conn, QueryPath::Composite, category, date).await {
        Err(StoreError::IndexUnavailable(reason)) => {
            warn!(category = %category, "Composite index unavailable, using category index: {}", reason);
        }
        other => return other,
    }

    match select_contributions(conn, QueryPath::CategoryIndex, category, date).await {
        Err(StoreError::IndexUnavailable(reason)) => {
            warn!(category = %category, "Category index unavailable, scanning: {}", reason);
        }
        other => return other,
    }

    select_contributions(conn, QueryPath::Scan, category, date).await
}

pub(crate) async fn select_contributions(
    conn: &mut SqliteConnection,
    path: QueryPath,
    category: Category,
    date: Option<&str>,
) -> Result<Vec<Contribution>> {
    let rows: Vec<ContributionRow> = match path {
        QueryPath::Composite => {
            let (low, high) = date
                .map(|d| (d, d))
                .unwrap_or((DATE_RANGE_MIN, DATE_RANGE_MAX));
            sqlx::query_as(&format!(
                "{} INDEXED BY {} WHERE category = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY id",
                SELECT_CONTRIBUTION, IDX_CATEGORY_DATE
            ))
            .bind(category.as_str())
            .bind(low)
            .bind(high)
            .fetch_all(&mut *conn)
            .await?
        }
        QueryPath::CategoryIndex => {
            sqlx::query_as(&format!(
                "{} INDEXED BY {} WHERE category = ?1 ORDER BY id",
                SELECT_CONTRIBUTION, IDX_CATEGORY
            ))
            .bind(category.as_str())
            .fetch_all(&mut *conn)
            .await?
        }
        QueryPath::Scan => {
            sqlx::query_as(&format!("{} NOT INDEXED ORDER BY id", SELECT_CONTRIBUTION))
                .fetch_all(&mut *conn)
                .await?
        }
    };

    let records = rows
        .into_iter()
        .map(Contribution::try_from)
        .collect::<Result<Vec<_>>>()?;

    if path == QueryPath::Composite {
        return Ok(records);
    }

    Ok(records
        .into_iter()
        .filter(|r| r.category == category)
        .filter(|r| date.map_or(true, |d| r.date == d))
        .collect())
}

// Helper struct for sqlx query_as
#[derive(sqlx::FromRow)]
struct ContributionRow {
    id: i64,
    contributor: String,
    amount: i64,
    category: String,
    date: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ContributionRow> for Contribution {
    type Error = StoreError;

    fn try_from(r: ContributionRow) -> Result<Self> {
        let category = r
            .category
            .parse::<Category>()
            .map_err(|e| StoreError::Database(format!("Contribution {}: {}", r.id, e)))?;

        Ok(Contribution {
            id: r.id,
            contributor: r.contributor,
            amount: r.amount,
            category,
            date: r.date,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}
