//! Local persistence and caching for the jimpitan contribution ledger
//!
//! - `storage`: schema management, the SQLite gateway, the TTL cache and the in-memory mirror
//! - `services`: the [`Ledger`] the UI layer owns
//! - `config` / `telemetry`: configuration loading and log setup

pub mod config;
pub mod error;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::{LogConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use services::{DaySheet, Ledger, Recorded};
pub use storage::{ContributionMirror, StorageGateway, SweeperHandle, TtlCache};

pub use jimpitan_types;
