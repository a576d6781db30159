//! Configuration for the jimpitan store

use crate::error::{Result, StoreError};
use crate::storage::schema::MigrationPolicy;
use jimpitan_types::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file names to search for
pub const CONFIG_FILE_NAMES: &[&str] = &[
    "jimpitan.config.yaml",
    "jimpitan.config.yml",
    "jimpitan.config.json",
];

/// Application directory under the platform data dir
const APP_DIR: &str = "jimpitan";

const DATABASE_FILE: &str = "jimpitan.db";

const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MIRROR_FRESHNESS_MS: u64 = 30 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 60 * 1000;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub cache_ttl_ms: u64,
    pub mirror_freshness_ms: u64,
    pub sweep_interval_ms: u64,
    pub busy_timeout_ms: u64,
    pub migration: MigrationPolicy,
    pub log: LogConfig,
    /// Contributor order per category, used to sort the day sheet
    pub rosters: BTreeMap<Category, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            mirror_freshness_ms: DEFAULT_MIRROR_FRESHNESS_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            migration: MigrationPolicy::default(),
            log: LogConfig::default(),
            rosters: default_rosters(),
        }
    }
}

impl StoreConfig {
    /// Defaults with the database placed in `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_path: dir.join(DATABASE_FILE),
            ..Self::default()
        }
    }

    /// Find configuration file in a directory
    pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Load configuration from a file, JSON or YAML by extension
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)?;
        let config: StoreConfig = if config_path
            .extension()
            .map(|e| e == "json")
            .unwrap_or(false)
        {
            serde_json::from_str(&content).map_err(|e| StoreError::Config(e.to_string()))?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from the first config file in `dir`, or defaults placed in `dir`
    pub fn load_from_directory(dir: &Path) -> Result<Self> {
        match Self::find_config_file(dir) {
            Some(path) => Self::load(&path),
            None => Ok(Self::in_dir(dir)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(StoreError::Config("database_path must not be empty".into()));
        }
        for (field, value) in [
            ("cache_ttl_ms", self.cache_ttl_ms),
            ("mirror_freshness_ms", self.mirror_freshness_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(StoreError::Config(format!("{} must be greater than zero", field)));
            }
        }
        for (category, names) in &self.rosters {
            if names.iter().any(|n| n.trim().is_empty()) {
                return Err(StoreError::Config(format!(
                    "roster for {} contains an empty name",
                    category
                )));
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn mirror_freshness(&self) -> Duration {
        Duration::from_millis(self.mirror_freshness_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn roster(&self, category: Category) -> &[String] {
        self.rosters
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// `<data dir>/jimpitan/jimpitan.db`, or the working directory when there is no data dir
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATABASE_FILE)
}

fn default_rosters() -> BTreeMap<Category, Vec<String>> {
    let tengah = [
        "Mas Ani", "Pak Kholis", "Pak Hasyim", "Amat", "Mbak Is", "Dani", "Pak Napi",
        "Pak Ipin", "Mas Agus BZ", "Pak Fat", "Pak Ropi", "Mas Umam", "Pak Kisman",
        "Pak Yanto", "Pak Pardi", "Pak Salam", "Pak Piyan", "Pak Slamet", "Pak Ibin", "Idek",
        "Pak Ngari", "Pak Tukhin", "Pak Rofiq", "Pak Syafak", "Pak Jubaidi", "Mbak Kholis",
        "Pak Kholiq", "Pak Rokhan", "Mas Agus", "Mas Izin", "Pak Abror", "Mas Gustaf",
    ];
    let placeholder = ["Pak A", "Pak B", "Pak C"];

    let to_owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();

    BTreeMap::from([
        (Category::Kategori1, to_owned(&tengah)),
        (Category::Kategori2, to_owned(&placeholder)),
        (Category::Kategori3, to_owned(&placeholder)),
    ])
}
