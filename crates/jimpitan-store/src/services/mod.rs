//! Services built on the storage layer

pub mod ledger;

pub use ledger::{DaySheet, Ledger, Recorded};
