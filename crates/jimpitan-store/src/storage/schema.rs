//! Versioned on-disk layout
//!
//! The schema version lives in SQLite's `PRAGMA user_version`. Every upgrade runs
//! in a single transaction together with the version bump, so a failed or blocked
//! upgrade leaves the previous layout untouched.
//!
//! - v1: `contributions` with single-field indexes, `settings`
//! - v2: composite indexes on `contributions`, `cache` with an `expires` index
//! - v3: `updated_at` on `contributions`

use crate::error::{is_busy, Result, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Version this build installs
pub const SCHEMA_VERSION: i64 = 3;

pub const IDX_CATEGORY_DATE: &str = "idx_contributions_category_date";
pub const IDX_CATEGORY: &str = "idx_contributions_category";
pub const IDX_CACHE_EXPIRES: &str = "idx_cache_expires";

/// How to reach the latest version from an older one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPolicy {
    /// Apply each missing step in order, keeping existing records
    #[default]
    Preserve,
    /// Drop and recreate `contributions` on any upgrade into the latest version.
    /// Discards every stored contribution.
    Recreate,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub since: i64,
}

impl IndexSpec {
    fn create_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

pub const REQUIRED_INDEXES: &[IndexSpec] = &[
    IndexSpec { name: IDX_CATEGORY, table: "contributions", columns: &["category"], since: 1 },
    IndexSpec { name: "idx_contributions_date", table: "contributions", columns: &["date"], since: 1 },
    IndexSpec { name: "idx_contributions_contributor", table: "contributions", columns: &["contributor"], since: 1 },
    IndexSpec { name: "idx_contributions_created_at", table: "contributions", columns: &["created_at"], since: 1 },
    IndexSpec { name: IDX_CATEGORY_DATE, table: "contributions", columns: &["category", "date"], since: 2 },
    IndexSpec { name: "idx_contributions_category_contributor", table: "contributions", columns: &["category", "contributor"], since: 2 },
    IndexSpec { name: "idx_contributions_date_category", table: "contributions", columns: &["date", "category"], since: 2 },
    IndexSpec { name: IDX_CACHE_EXPIRES, table: "cache", columns: &["expires"], since: 2 },
];

const CONTRIBUTIONS_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS contributions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        contributor TEXT NOT NULL CHECK (length(contributor) > 0),
        amount INTEGER NOT NULL CHECK (amount >= 0),
        category TEXT NOT NULL,
        date TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
"#;

const CONTRIBUTIONS_LATEST: &str = r#"
    CREATE TABLE IF NOT EXISTS contributions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        contributor TEXT NOT NULL CHECK (length(contributor) > 0),
        amount INTEGER NOT NULL CHECK (amount >= 0),
        category TEXT NOT NULL,
        date TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )
"#;

const SETTINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )
"#;

const CACHE: &str = r#"
    CREATE TABLE IF NOT EXISTS cache (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        expires INTEGER NOT NULL,
        stored_at INTEGER NOT NULL
    )
"#;

/// Result of an upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: i64,
    pub to: i64,
    /// `contributions` was dropped and recreated
    pub recreated: bool,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Tables and indexes present in a database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub version: i64,
    pub tables: BTreeSet<String>,
    pub indexes: BTreeSet<String>,
}

impl Layout {
    /// Required indexes for `version` that are absent
    pub fn missing_indexes(&self, version: i64) -> Vec<&'static str> {
        REQUIRED_INDEXES
            .iter()
            .filter(|spec| spec.since <= version && !self.indexes.contains(spec.name))
            .map(|spec| spec.name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaManager {
    policy: MigrationPolicy,
}

impl SchemaManager {
    pub fn new(policy: MigrationPolicy) -> Self {
        Self { policy }
    }

    pub async fn version(conn: &mut SqliteConnection) -> Result<i64> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await?;
        Ok(version)
    }

    /// Bring the database up to `SCHEMA_VERSION`
    pub async fn upgrade(&self, conn: &mut SqliteConnection) -> Result<UpgradeReport> {
        self.upgrade_to(conn, SCHEMA_VERSION).await
    }

    /// Bring the database up to `target`. A database already at or past `target`
    /// is left alone.
    pub async fn upgrade_to(&self, conn: &mut SqliteConnection, target: i64) -> Result<UpgradeReport> {
        let from = Self::version(conn)
            .await
            .map_err(|e| StoreError::Initialization(format!("Failed to read schema version: {}", e)))?;

        if from > SCHEMA_VERSION {
            return Err(StoreError::Initialization(format!(
                "Database schema v{} is newer than supported v{}",
                from, SCHEMA_VERSION
            )));
        }
        if from >= target {
            return Ok(UpgradeReport { from, to: from, recreated: false });
        }

        info!("Upgrading schema from v{} to v{}", from, target);

        let recreated = self
            .apply_in_transaction(conn, from, target)
            .await
            .map_err(|e| {
                if is_busy(&e) {
                    warn!("Schema upgrade to v{} blocked by another connection", target);
                    StoreError::Initialization(format!(
                        "Schema upgrade blocked by another open connection: {}",
                        e
                    ))
                } else {
                    StoreError::Initialization(format!("Schema upgrade to v{} failed: {}", target, e))
                }
            })?;

        if recreated {
            warn!("Contributions store recreated during upgrade; previous records were discarded");
        }
        info!("Schema upgrade complete (v{})", target);

        Ok(UpgradeReport { from, to: target, recreated })
    }

    async fn apply_in_transaction(
        &self,
        conn: &mut SqliteConnection,
        from: i64,
        target: i64,
    ) -> std::result::Result<bool, sqlx::Error> {
        let mut tx = conn.begin().await?;

        let recreated = if self.policy == MigrationPolicy::Recreate && target == SCHEMA_VERSION {
            recreate_latest(&mut *tx).await?;
            from > 0
        } else {
            apply_steps(&mut *tx, from, target).await?;
            false
        };

        sqlx::query(&format!("PRAGMA user_version = {}", target))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(recreated)
    }

    /// Tables and indexes currently present
    pub async fn inspect(conn: &mut SqliteConnection) -> Result<Layout> {
        let version = Self::version(conn).await?;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&mut *conn)
        .await?;

        let indexes: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(Layout {
            version,
            tables: tables.into_iter().collect(),
            indexes: indexes.into_iter().collect(),
        })
    }
}

/// Incremental steps `from + 1 ..= target`. Each step can run again safely.
async fn apply_steps(
    conn: &mut SqliteConnection,
    from: i64,
    target: i64,
) -> std::result::Result<(), sqlx::Error> {
    if from < 1 && target >= 1 {
        sqlx::query(CONTRIBUTIONS_V1).execute(&mut *conn).await?;
        sqlx::query(SETTINGS).execute(&mut *conn).await?;
        create_indexes(conn, 1).await?;
    }

    if from < 2 && target >= 2 {
        sqlx::query(CACHE).execute(&mut *conn).await?;
        create_indexes(conn, 2).await?;
    }

    if from < 3 && target >= 3 && !has_column(conn, "contributions", "updated_at").await? {
        sqlx::query("ALTER TABLE contributions ADD COLUMN updated_at TEXT")
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

async fn recreate_latest(conn: &mut SqliteConnection) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("DROP TABLE IF EXISTS contributions")
        .execute(&mut *conn)
        .await?;
    sqlx::query(CONTRIBUTIONS_LATEST).execute(&mut *conn).await?;
    sqlx::query(SETTINGS).execute(&mut *conn).await?;
    sqlx::query(CACHE).execute(&mut *conn).await?;
    for spec in REQUIRED_INDEXES {
        sqlx::query(&spec.create_sql()).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn create_indexes(conn: &mut SqliteConnection, since: i64) -> std::result::Result<(), sqlx::Error> {
    for spec in REQUIRED_INDEXES.iter().filter(|s| s.since == since) {
        sqlx::query(&spec.create_sql()).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn has_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> std::result::Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")
        .bind(table)
        .bind(column)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> SqliteConnection {
        SqliteConnection::connect("sqlite::memory:").await.unwrap()
    }

    async fn insert_v1_row(conn: &mut SqliteConnection) {
        sqlx::query(
            "INSERT INTO contributions (contributor, amount, category, date, created_at)
             VALUES ('Amat', 5000, 'kategori1', '01/01/2025', '2025-01-01T08:00:00Z')",
        )
        .execute(&mut *conn)
        .await
        .unwrap();
    }

    async fn contribution_count(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM contributions")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_upgrade_creates_full_layout() {
        let mut conn = memory_conn().await;
        let report = SchemaManager::default().upgrade(&mut conn).await.unwrap();
        assert_eq!(report, UpgradeReport { from: 0, to: SCHEMA_VERSION, recreated: false });

        let layout = SchemaManager::inspect(&mut conn).await.unwrap();
        assert_eq!(layout.version, SCHEMA_VERSION);
        for table in ["contributions", "settings", "cache"] {
            assert!(layout.tables.contains(table), "missing table {}", table);
        }
        assert!(layout.missing_indexes(SCHEMA_VERSION).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_upgrade_is_noop() {
        let mut conn = memory_conn().await;
        let manager = SchemaManager::default();
        manager.upgrade(&mut conn).await.unwrap();

        let again = manager.upgrade(&mut conn).await.unwrap();
        assert!(again.is_noop());

        // Re-entering every step on a database that already has them does not raise
        apply_steps(&mut conn, 0, SCHEMA_VERSION).await.unwrap();
        let layout = SchemaManager::inspect(&mut conn).await.unwrap();
        assert!(layout.missing_indexes(SCHEMA_VERSION).is_empty());
    }

    #[tokio::test]
    async fn test_preserving_upgrade_keeps_records() {
        let mut conn = memory_conn().await;
        let manager = SchemaManager::new(MigrationPolicy::Preserve);
        manager.upgrade_to(&mut conn, 1).await.unwrap();
        insert_v1_row(&mut conn).await;

        let v1 = SchemaManager::inspect(&mut conn).await.unwrap();
        assert!(!v1.tables.contains("cache"));
        assert_eq!(v1.missing_indexes(SCHEMA_VERSION).len(), 4);

        let report = manager.upgrade(&mut conn).await.unwrap();
        assert_eq!(report.from, 1);
        assert!(!report.recreated);
        assert_eq!(contribution_count(&mut conn).await, 1);
        assert!(has_column(&mut conn, "contributions", "updated_at").await.unwrap());

        let layout = SchemaManager::inspect(&mut conn).await.unwrap();
        assert!(layout.missing_indexes(SCHEMA_VERSION).is_empty());
    }

    #[tokio::test]
    async fn test_recreate_policy_discards_records() {
        let mut conn = memory_conn().await;
        SchemaManager::new(MigrationPolicy::Preserve)
            .upgrade_to(&mut conn, 2)
            .await
            .unwrap();
        insert_v1_row(&mut conn).await;

        let report = SchemaManager::new(MigrationPolicy::Recreate)
            .upgrade(&mut conn)
            .await
            .unwrap();
        assert!(report.recreated);
        assert_eq!(contribution_count(&mut conn).await, 0);

        let layout = SchemaManager::inspect(&mut conn).await.unwrap();
        assert!(layout.missing_indexes(SCHEMA_VERSION).is_empty());
    }

    #[tokio::test]
    async fn test_recreate_policy_leaves_current_database_alone() {
        let mut conn = memory_conn().await;
        let manager = SchemaManager::new(MigrationPolicy::Recreate);
        manager.upgrade(&mut conn).await.unwrap();
        insert_v1_row(&mut conn).await;

        let report = manager.upgrade(&mut conn).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(contribution_count(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn test_newer_database_is_rejected() {
        let mut conn = memory_conn().await;
        sqlx::query("PRAGMA user_version = 99")
            .execute(&mut conn)
            .await
            .unwrap();

        let err = SchemaManager::default().upgrade(&mut conn).await.unwrap_err();
        assert!(matches!(err, StoreError::Initialization(_)));
    }
}
