//! Storage layer
//!
//! SQLite (embedded) holds the contributions, settings and the TTL cache.
//! DashMap (in-memory) mirrors recently loaded days.

pub mod cache;
pub mod db;
pub mod mirror;
pub mod schema;

pub use cache::{SweeperHandle, TtlCache};
pub use db::StorageGateway;
pub use mirror::ContributionMirror;
pub use schema::{MigrationPolicy, SchemaManager, SCHEMA_VERSION};
