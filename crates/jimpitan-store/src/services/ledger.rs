//! Contribution ledger service

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::storage::{ContributionMirror, StorageGateway, SweeperHandle, TtlCache};
use jimpitan_types::{
    parse_date, Category, Contribution, ContributionPatch, DeleteSummary, NewContribution,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`Ledger::record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Created(Contribution),
    Updated(Contribution),
}

impl Recorded {
    pub fn contribution(&self) -> &Contribution {
        match self {
            Recorded::Created(c) | Recorded::Updated(c) => c,
        }
    }
}

/// One category's contributions for one day, in roster order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySheet {
    pub category: Category,
    pub date: String,
    pub rows: Vec<Contribution>,
    pub total: i64,
    pub count: usize,
    /// Roster names with no record for the day
    pub pending: Vec<String>,
}

/// Owns the gateway, the TTL cache, the mirror and the cache sweeper
pub struct Ledger {
    config: StoreConfig,
    gateway: Arc<StorageGateway>,
    cache: Arc<TtlCache>,
    mirror: ContributionMirror,
    sweeper: SweeperHandle,
}

impl Ledger {
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let gateway = Arc::new(StorageGateway::open(config.clone()).await?);
        let cache = Arc::new(TtlCache::new(gateway.clone(), config.cache_ttl()));
        let sweeper = cache.start_sweeper(config.sweep_interval());
        let mirror = ContributionMirror::new(config.mirror_freshness());

        info!("Ledger opened at {}", gateway.database_path().display());
        Ok(Self {
            config,
            gateway,
            cache,
            mirror,
            sweeper,
        })
    }

    /// Stop the sweeper and close the database
    pub async fn shutdown(self) {
        self.sweeper.stop();
        self.gateway.close().await;
        info!("Ledger shut down");
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn mirror(&self) -> &ContributionMirror {
        &self.mirror
    }

    /// Warm the mirror from the cached copy of a day. Returns whether one was found.
    pub async fn preload(&self, category: Category, date: &str) -> Result<bool> {
        validate_date(date)?;

        let key = cache_key(category, date);
        let records = match self.cache.get::<Vec<Contribution>>(&key).await {
            Ok(Some(records)) => records,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(key = %key, "Cache unavailable during preload: {}", e);
                return Ok(false);
            }
        };

        debug!(key = %key, count = records.len(), "Mirror preloaded from cache");
        self.mirror.replace(category, date, &records);
        Ok(true)
    }

    /// The day's records, served from the mirror while it is fresh
    pub async fn load_day(&self, category: Category, date: &str) -> Result<Vec<Contribution>> {
        validate_date(date)?;

        if let Some(records) = self.mirror.fresh(category, date) {
            debug!(category = %category, date, "Serving day from mirror");
            return Ok(records);
        }

        // A schema moved on by another connection closes ours; the query reopens it
        if self.gateway.check_version().await? {
            self.mirror.invalidate(category);
        }

        let records = self
            .gateway
            .query_by_category_and_date(category, Some(date))
            .await?;
        self.mirror.replace(category, date, &records);

        let key = cache_key(category, date);
        if let Err(e) = self.cache.set(&key, &records).await {
            warn!(key = %key, "Failed to cache day: {}", e);
        }

        Ok(records)
    }

    /// Store a contributor's amount for a day, updating their existing record if any
    pub async fn record(
        &self,
        category: Category,
        contributor: &str,
        amount: i64,
        date: &str,
    ) -> Result<Recorded> {
        let contributor = contributor.trim();
        validate_contributor(contributor)?;
        validate_amount(amount)?;
        validate_date(date)?;

        if let Some(existing) = self.find_existing(category, contributor, date).await? {
            match self
                .gateway
                .update(existing.id, &ContributionPatch::amount_and_date(amount, date))
                .await
            {
                Ok(updated) => {
                    self.mirror.upsert(&updated);
                    self.forget(category, date).await;
                    return Ok(Recorded::Updated(updated));
                }
                // Deleted behind the mirror's back
                Err(StoreError::NotFound { id }) => {
                    self.mirror.remove(id);
                }
                Err(e) => return Err(e),
            }
        }

        let id = self
            .gateway
            .add(&NewContribution::new(category, contributor, amount, date))
            .await?;
        let created = self
            .gateway
            .get(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;

        self.mirror.upsert(&created);
        self.forget(category, date).await;
        Ok(Recorded::Created(created))
    }

    async fn find_existing(
        &self,
        category: Category,
        contributor: &str,
        date: &str,
    ) -> Result<Option<Contribution>> {
        if let Some(existing) = self.mirror.lookup(category, contributor, date) {
            return Ok(Some(existing));
        }

        let day = self
            .gateway
            .query_by_category_and_date(category, Some(date))
            .await?;
        Ok(day.into_iter().find(|r| r.contributor == contributor))
    }

    /// Change the amount and date of a record by id
    pub async fn amend(&self, id: i64, amount: i64, date: &str) -> Result<Contribution> {
        validate_amount(amount)?;
        validate_date(date)?;

        let previous = self
            .gateway
            .get(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        let updated = self
            .gateway
            .update(id, &ContributionPatch::amount_and_date(amount, date))
            .await?;

        self.mirror.upsert(&updated);
        self.forget(previous.category, &previous.date).await;
        if previous.date != updated.date {
            self.forget(updated.category, &updated.date).await;
        }
        Ok(updated)
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        let previous = self.gateway.get(id).await?;
        self.gateway.delete(id).await?;

        self.mirror.remove(id);
        if let Some(previous) = previous {
            self.forget(previous.category, &previous.date).await;
        }
        Ok(())
    }

    /// Delete every record of a day.
    ///
    /// Falls back to deleting one record at a time when the bulk delete fails.
    /// The mirror and the cached day are dropped either way.
    pub async fn clear_day(&self, category: Category, date: &str) -> Result<DeleteSummary> {
        validate_date(date)?;

        let outcome = match self.gateway.delete_by_category_and_date(category, date).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(category = %category, date, "Bulk delete failed, deleting one by one: {}", e);
                self.delete_each(category, date).await
            }
        };

        self.mirror.invalidate(category);
        self.forget(category, date).await;
        outcome
    }

    async fn delete_each(&self, category: Category, date: &str) -> Result<DeleteSummary> {
        let records = self
            .gateway
            .query_by_category_and_date(category, Some(date))
            .await?;

        let mut summary = DeleteSummary::default();
        for record in &records {
            match self.gateway.delete(record.id).await {
                Ok(()) => summary.deleted_count += 1,
                Err(e) => {
                    warn!(id = record.id, "Failed to delete contribution: {}", e);
                    summary.error_count += 1;
                }
            }
        }

        if summary.error_count > 0 {
            return Err(StoreError::Write(format!(
                "Failed to delete {} of {} contributions",
                summary.error_count,
                summary.matched()
            )));
        }
        Ok(summary)
    }

    /// The day's rows in roster order, with totals and who is still missing
    pub async fn day_sheet(&self, category: Category, date: &str) -> Result<DaySheet> {
        let mut rows = self.load_day(category, date).await?;
        let roster = self.config.roster(category);

        rows.sort_by(|a, b| {
            roster_position(roster, &a.contributor)
                .cmp(&roster_position(roster, &b.contributor))
                .then_with(|| a.contributor.cmp(&b.contributor))
        });

        let pending = roster
            .iter()
            .filter(|name| !rows.iter().any(|r| &r.contributor == *name))
            .cloned()
            .collect();

        Ok(DaySheet {
            category,
            date: date.to_string(),
            total: rows.iter().map(|r| r.amount).sum(),
            count: rows.len(),
            rows,
            pending,
        })
    }

    /// Drop the cached copy of a day. Cache faults are only logged.
    async fn forget(&self, category: Category, date: &str) {
        let key = cache_key(category, date);
        if let Err(e) = self.cache.clear(&key).await {
            warn!(key = %key, "Failed to clear cached day: {}", e);
        }
    }
}

fn cache_key(category: Category, date: &str) -> String {
    format!("{}_{}", category.as_str(), date)
}

fn roster_position(roster: &[String], contributor: &str) -> usize {
    roster
        .iter()
        .position(|name| name == contributor)
        .unwrap_or(usize::MAX)
}

fn validate_contributor(contributor: &str) -> Result<()> {
    if contributor.is_empty() {
        return Err(StoreError::InvalidInput(
            "Contributor name must not be empty".into(),
        ));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount < 0 {
        return Err(StoreError::InvalidInput(format!(
            "Amount must not be negative: {}",
            amount
        )));
    }
    Ok(())
}

fn validate_date(date: &str) -> Result<()> {
    if parse_date(date).is_none() {
        return Err(StoreError::InvalidInput(format!(
            "Invalid date {:?}, expected dd/mm/yyyy",
            date
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jimpitan_types::StoreName;
    use std::time::Duration;
    use tokio_test::assert_err;

    const DAY: &str = "01/01/2025";

    async fn open_temp() -> (tempfile::TempDir, Ledger) {
        open_with(|_| {}).await
    }

    async fn open_with(tweak: impl FnOnce(&mut StoreConfig)) -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::in_dir(dir.path());
        tweak(&mut config);
        let ledger = Ledger::open(config).await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn test_record_creates_then_updates() {
        let (_dir, ledger) = open_temp().await;

        let first = ledger.record(Category::Kategori1, "Amat", 5000, DAY).await.unwrap();
        assert!(matches!(first, Recorded::Created(_)));

        let second = ledger.record(Category::Kategori1, "Amat", 7000, DAY).await.unwrap();
        match second {
            Recorded::Updated(c) => {
                assert_eq!(c.id, first.contribution().id);
                assert_eq!(c.amount, 7000);
                assert!(c.updated_at.is_some());
            }
            other => panic!("expected update, got {:?}", other),
        }

        let day = ledger
            .gateway()
            .query_by_category_and_date(Category::Kategori1, Some(DAY))
            .await
            .unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].amount, 7000);
    }

    #[tokio::test]
    async fn test_record_finds_existing_without_mirror() {
        let (_dir, ledger) = open_temp().await;
        ledger
            .gateway()
            .add(&NewContribution::new(Category::Kategori2, "Pak A", 1000, DAY))
            .await
            .unwrap();

        let outcome = ledger.record(Category::Kategori2, "Pak A", 2000, DAY).await.unwrap();
        assert!(matches!(outcome, Recorded::Updated(_)));
        assert_eq!(ledger.gateway().count(StoreName::Contributions).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_writing() {
        let (_dir, ledger) = open_temp().await;

        for (contributor, amount, date) in [("  ", 100, DAY), ("Amat", -1, DAY), ("Amat", 100, "2025-01-01")] {
            let err = assert_err!(ledger.record(Category::Kategori1, contributor, amount, date).await);
            assert!(matches!(err, StoreError::InvalidInput(_)), "{}", err);
        }
        assert_eq!(ledger.gateway().count(StoreName::Contributions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_day_uses_mirror_while_fresh() {
        let (_dir, ledger) = open_with(|c| c.mirror_freshness_ms = 100).await;
        ledger.record(Category::Kategori1, "Amat", 5000, DAY).await.unwrap();
        assert_eq!(ledger.load_day(Category::Kategori1, DAY).await.unwrap().len(), 1);

        // Written behind the mirror
        ledger
            .gateway()
            .add(&NewContribution::new(Category::Kategori1, "Dani", 0, DAY))
            .await
            .unwrap();
        assert_eq!(ledger.load_day(Category::Kategori1, DAY).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ledger.load_day(Category::Kategori1, DAY).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_preload_warms_mirror_from_cache() {
        let (_dir, ledger) = open_temp().await;
        assert!(!ledger.preload(Category::Kategori3, DAY).await.unwrap());

        ledger.record(Category::Kategori3, "Pak B", 3000, DAY).await.unwrap();
        ledger.mirror().invalidate(Category::Kategori3);
        ledger.load_day(Category::Kategori3, DAY).await.unwrap();

        ledger.mirror().invalidate(Category::Kategori3);
        assert!(ledger.preload(Category::Kategori3, DAY).await.unwrap());

        let day = ledger.mirror().fresh(Category::Kategori3, DAY).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].contributor, "Pak B");
    }

    #[tokio::test]
    async fn test_amend_and_remove_patch_mirror() {
        let (_dir, ledger) = open_temp().await;
        let id = ledger
            .record(Category::Kategori1, "Idek", 1000, DAY)
            .await
            .unwrap()
            .contribution()
            .id;
        ledger.load_day(Category::Kategori1, DAY).await.unwrap();

        let amended = ledger.amend(id, 1500, DAY).await.unwrap();
        assert_eq!(amended.amount, 1500);
        assert_eq!(ledger.load_day(Category::Kategori1, DAY).await.unwrap()[0].amount, 1500);

        ledger.remove(id).await.unwrap();
        assert!(ledger.load_day(Category::Kategori1, DAY).await.unwrap().is_empty());
        assert!(ledger.gateway().get(id).await.unwrap().is_none());

        assert!(ledger.amend(id, 1, DAY).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_clear_day_invalidates_mirror_and_cache() {
        let (_dir, ledger) = open_temp().await;
        ledger.record(Category::Kategori1, "Amat", 5000, DAY).await.unwrap();
        ledger.record(Category::Kategori1, "Dani", 0, DAY).await.unwrap();
        ledger.record(Category::Kategori1, "Amat", 2000, "02/01/2025").await.unwrap();
        ledger.load_day(Category::Kategori1, DAY).await.unwrap();

        let summary = ledger.clear_day(Category::Kategori1, DAY).await.unwrap();
        assert_eq!(summary, DeleteSummary { deleted_count: 2, error_count: 0 });

        assert!(ledger.mirror().fresh(Category::Kategori1, DAY).is_none());
        assert!(!ledger.preload(Category::Kategori1, DAY).await.unwrap());
        assert!(ledger.load_day(Category::Kategori1, DAY).await.unwrap().is_empty());
        assert_eq!(ledger.load_day(Category::Kategori1, "02/01/2025").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_day_falls_back_to_single_deletes() {
        let (_dir, ledger) = open_temp().await;
        let mut ids = Vec::new();
        for name in ["Amat", "Dani", "Idek"] {
            let recorded = ledger.record(Category::Kategori1, name, 1000, DAY).await.unwrap();
            ids.push(recorded.contribution().id);
        }
        ledger.load_day(Category::Kategori1, DAY).await.unwrap();

        // Deleting Dani leaves a dangling deferred reference: the bulk delete
        // fails at commit, a single delete fails on its own
        let pool = ledger.gateway().pool().await.unwrap();
        for sql in [
            "PRAGMA foreign_keys = ON".to_string(),
            "CREATE TABLE day_owner (id INTEGER PRIMARY KEY)".to_string(),
            "CREATE TABLE day_audit (owner INTEGER REFERENCES day_owner(id) DEFERRABLE INITIALLY DEFERRED)"
                .to_string(),
            format!(
                "CREATE TRIGGER audit_delete BEFORE DELETE ON contributions WHEN old.id = {} \
                 BEGIN INSERT INTO day_audit (owner) VALUES (old.id); END",
                ids[1]
            ),
        ] {
            sqlx::query(&sql).execute(&pool).await.unwrap();
        }
        assert!(ledger
            .gateway()
            .delete_by_category_and_date(Category::Kategori1, DAY)
            .await
            .is_err());
        assert_eq!(ledger.gateway().count(StoreName::Contributions).await.unwrap(), 3);

        let err = ledger.clear_day(Category::Kategori1, DAY).await.unwrap_err();
        match err {
            StoreError::Write(message) => assert!(message.contains("1 of 3"), "{}", message),
            other => panic!("unexpected error: {}", other),
        }

        let remaining = ledger.gateway().get_all().await.unwrap();
        assert_eq!(remaining.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[1]]);
        assert!(ledger.mirror().fresh(Category::Kategori1, DAY).is_none());
        assert!(!ledger.preload(Category::Kategori1, DAY).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_day_notices_schema_change() {
        let (_dir, ledger) = open_temp().await;
        ledger.load_day(Category::Kategori1, DAY).await.unwrap();
        ledger.mirror().invalidate(Category::Kategori1);

        let pool = ledger.gateway().pool().await.unwrap();
        sqlx::query("PRAGMA user_version = 99").execute(&pool).await.unwrap();
        drop(pool);

        let err = ledger.load_day(Category::Kategori1, DAY).await.unwrap_err();
        assert!(matches!(err, StoreError::Initialization(_)), "{}", err);
        assert!(!ledger.gateway().is_open().await);
    }

    #[tokio::test]
    async fn test_delete_each_counts_every_record() {
        let (_dir, ledger) = open_temp().await;
        ledger.record(Category::Kategori2, "Pak A", 100, DAY).await.unwrap();
        ledger.record(Category::Kategori2, "Pak B", 200, DAY).await.unwrap();

        let summary = ledger.delete_each(Category::Kategori2, DAY).await.unwrap();
        assert_eq!(summary.deleted_count, 2);
        assert_eq!(ledger.gateway().count(StoreName::Contributions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_day_sheet_follows_roster() {
        let (_dir, ledger) = open_temp().await;
        for (name, amount) in [("Zed", 500), ("Pak C", 300), ("Pak A", 0), ("Bu Ani", 200)] {
            ledger.record(Category::Kategori2, name, amount, DAY).await.unwrap();
        }

        let sheet = ledger.day_sheet(Category::Kategori2, DAY).await.unwrap();
        let names: Vec<&str> = sheet.rows.iter().map(|r| r.contributor.as_str()).collect();
        assert_eq!(names, ["Pak A", "Pak C", "Bu Ani", "Zed"]);
        assert_eq!(sheet.total, 1000);
        assert_eq!(sheet.count, 4);
        assert_eq!(sheet.pending, ["Pak B"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_gateway() {
        let (_dir, ledger) = open_temp().await;
        let gateway = ledger.gateway().clone();

        ledger.shutdown().await;
        assert!(!gateway.is_open().await);
    }
}
