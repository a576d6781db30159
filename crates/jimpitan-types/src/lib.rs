//! Jimpitan Types - Pure record definitions
//!
//! Data types shared between the storage engine and whatever UI layer renders
//! the ledger. Nothing in here touches storage or an async runtime.

pub mod category;
pub mod contribution;
pub mod store;

pub use category::*;
pub use contribution::*;
pub use store::*;
