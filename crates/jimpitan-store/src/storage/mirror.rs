//! In-memory mirror of recently loaded contributions

use dashmap::DashMap;
use jimpitan_types::{Category, Contribution};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per category: contributor name to their latest record, and when the
/// category was last loaded from storage.
///
/// Patched in place on single writes, so it is eventually consistent with the
/// database. Only a full load makes a category fresh again.
pub struct ContributionMirror {
    slots: DashMap<Category, MirrorSlot>,
    freshness: Duration,
}

#[derive(Default)]
struct MirrorSlot {
    refreshed_at: Option<Instant>,
    date: Option<String>,
    by_contributor: HashMap<String, Contribution>,
}

impl MirrorSlot {
    fn records_on(&self, date: &str) -> Vec<Contribution> {
        let mut records: Vec<Contribution> = self
            .by_contributor
            .values()
            .filter(|r| r.date == date)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

impl ContributionMirror {
    pub fn new(freshness: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            freshness,
        }
    }

    /// Records of `date` if `category` was loaded for that date within the freshness window
    pub fn fresh(&self, category: Category, date: &str) -> Option<Vec<Contribution>> {
        let slot = self.slots.get(&category)?;
        let refreshed_at = slot.refreshed_at?;
        if refreshed_at.elapsed() > self.freshness || slot.date.as_deref() != Some(date) {
            return None;
        }
        Some(slot.records_on(date))
    }

    /// Replace the category with a full load for `date`
    pub fn replace(&self, category: Category, date: &str, records: &[Contribution]) {
        let by_contributor = records
            .iter()
            .map(|r| (r.contributor.clone(), r.clone()))
            .collect();

        self.slots.insert(
            category,
            MirrorSlot {
                refreshed_at: Some(Instant::now()),
                date: Some(date.to_string()),
                by_contributor,
            },
        );
    }

    pub fn lookup(&self, category: Category, contributor: &str, date: &str) -> Option<Contribution> {
        self.slots
            .get(&category)?
            .by_contributor
            .get(contributor)
            .filter(|r| r.date == date)
            .cloned()
    }

    /// Patch one record in. A category seen for the first time stays stale.
    /// Records of a day other than the loaded one are only dropped.
    pub fn upsert(&self, record: &Contribution) {
        let mut slot = self.slots.entry(record.category).or_default();
        slot.by_contributor.retain(|_, r| r.id != record.id);
        if slot.date.as_deref().map_or(true, |d| d == record.date) {
            slot.by_contributor
                .insert(record.contributor.clone(), record.clone());
        }
    }

    /// Drop the record with `id` wherever it is mirrored
    pub fn remove(&self, id: i64) -> bool {
        let mut removed = false;
        for mut slot in self.slots.iter_mut() {
            let before = slot.by_contributor.len();
            slot.by_contributor.retain(|_, r| r.id != id);
            removed |= slot.by_contributor.len() != before;
        }
        removed
    }

    pub fn invalidate(&self, category: Category) {
        self.slots.remove(&category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: i64, contributor: &str, amount: i64, date: &str) -> Contribution {
        Contribution {
            id,
            contributor: contributor.to_string(),
            amount,
            category: Category::Kategori1,
            date: date.to_string(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_fresh_within_window() {
        let mirror = ContributionMirror::new(Duration::from_secs(30));
        assert!(mirror.fresh(Category::Kategori1, "01/01/2025").is_none());

        mirror.replace(
            Category::Kategori1,
            "01/01/2025",
            &[record(2, "Dani", 0, "01/01/2025"), record(1, "Amat", 5000, "01/01/2025")],
        );

        let day = mirror.fresh(Category::Kategori1, "01/01/2025").unwrap();
        assert_eq!(day.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(mirror.fresh(Category::Kategori1, "02/01/2025").is_none());
        assert!(mirror.fresh(Category::Kategori2, "01/01/2025").is_none());
    }

    #[tokio::test]
    async fn test_goes_stale_after_window() {
        let mirror = ContributionMirror::new(Duration::from_millis(20));
        mirror.replace(Category::Kategori1, "01/01/2025", &[]);
        assert!(mirror.fresh(Category::Kategori1, "01/01/2025").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(mirror.fresh(Category::Kategori1, "01/01/2025").is_none());
    }

    #[test]
    fn test_patching() {
        let mirror = ContributionMirror::new(Duration::from_secs(30));
        mirror.replace(
            Category::Kategori1,
            "01/01/2025",
            &[record(1, "Amat", 5000, "01/01/2025")],
        );

        mirror.upsert(&record(1, "Amat", 7000, "01/01/2025"));
        mirror.upsert(&record(3, "Idek", 100, "01/01/2025"));
        assert_eq!(
            mirror.lookup(Category::Kategori1, "Amat", "01/01/2025").unwrap().amount,
            7000
        );
        assert_eq!(mirror.fresh(Category::Kategori1, "01/01/2025").unwrap().len(), 2);
        assert!(mirror.lookup(Category::Kategori1, "Amat", "02/01/2025").is_none());

        mirror.upsert(&record(4, "Amat", 2000, "02/01/2025"));
        assert_eq!(
            mirror.lookup(Category::Kategori1, "Amat", "01/01/2025").unwrap().amount,
            7000
        );

        assert!(mirror.remove(3));
        assert!(!mirror.remove(3));
        assert!(mirror.lookup(Category::Kategori1, "Idek", "01/01/2025").is_none());

        mirror.invalidate(Category::Kategori1);
        assert!(mirror.lookup(Category::Kategori1, "Amat", "01/01/2025").is_none());
    }

    #[test]
    fn test_upsert_into_unloaded_category_is_stale() {
        let mirror = ContributionMirror::new(Duration::from_secs(30));
        mirror.upsert(&record(1, "Amat", 5000, "01/01/2025"));

        assert!(mirror.lookup(Category::Kategori1, "Amat", "01/01/2025").is_some());
        assert!(mirror.fresh(Category::Kategori1, "01/01/2025").is_none());
    }
}
