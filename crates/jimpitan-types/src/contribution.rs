//! Contribution records

use crate::category::Category;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Day format used for the `date` field (one value per calendar day)
pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// A persisted contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: i64,
    pub contributor: String,
    /// Zero means "registered but did not contribute"
    pub amount: i64,
    pub category: Category,
    pub date: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contribution {
    pub fn is_registered_only(&self) -> bool {
        self.amount == 0
    }
}

/// A contribution that has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContribution {
    pub contributor: String,
    pub amount: i64,
    pub category: Category,
    pub date: String,
}

impl NewContribution {
    pub fn new(
        category: Category,
        contributor: impl Into<String>,
        amount: i64,
        date: impl Into<String>,
    ) -> Self {
        Self {
            contributor: contributor.into(),
            amount,
            category,
            date: date.into(),
        }
    }
}

/// Fields to merge into an existing contribution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionPatch {
    pub contributor: Option<String>,
    pub amount: Option<i64>,
    pub category: Option<Category>,
    pub date: Option<String>,
}

impl ContributionPatch {
    pub fn amount_and_date(amount: i64, date: impl Into<String>) -> Self {
        Self {
            amount: Some(amount),
            date: Some(date.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contributor.is_none()
            && self.amount.is_none()
            && self.category.is_none()
            && self.date.is_none()
    }

    /// Merge the present fields into `record`
    pub fn apply_to(&self, record: &mut Contribution) {
        if let Some(ref contributor) = self.contributor {
            record.contributor = contributor.clone();
        }
        if let Some(amount) = self.amount {
            record.amount = amount;
        }
        if let Some(category) = self.category {
            record.category = category;
        }
        if let Some(ref date) = self.date {
            record.date = date.clone();
        }
    }
}

/// Outcome of a bulk delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub deleted_count: usize,
    pub error_count: usize,
}

impl DeleteSummary {
    pub fn matched(&self) -> usize {
        self.deleted_count + self.error_count
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

/// Today's date on the local clock
pub fn today() -> String {
    format_date(Local::now().date_naive())
}
