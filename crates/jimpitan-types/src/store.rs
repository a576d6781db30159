//! Store-level types

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Record collections in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreName {
    Contributions,
    Settings,
    Cache,
}

impl StoreName {
    pub const ALL: [StoreName; 3] = [StoreName::Contributions, StoreName::Settings, StoreName::Cache];

    /// Table backing the store
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Contributions => "contributions",
            StoreName::Settings => "settings",
            StoreName::Cache => "cache",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown store: {0}")]
pub struct ParseStoreError(pub String);

impl FromStr for StoreName {
    type Err = ParseStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contributions" => Ok(StoreName::Contributions),
            "settings" => Ok(StoreName::Settings),
            "cache" => Ok(StoreName::Cache),
            other => Err(ParseStoreError(other.to_string())),
        }
    }
}

/// Health of a single store. `count` is absent when the store could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub store: StoreName,
    pub exists: bool,
    pub count: Option<u64>,
}

impl StoreHealth {
    pub fn missing(store: StoreName) -> Self {
        Self {
            store,
            exists: false,
            count: None,
        }
    }
}

/// Key/value setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// On-disk size of the database
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSize {
    pub total_bytes: u64,
    pub total_mb: f64,
}

impl DatabaseSize {
    pub fn from_bytes(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            total_mb: total_bytes as f64 / (1024.0 * 1024.0),
        }
    }
}
