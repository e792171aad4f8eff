//! Persistence layer.
//!
//! `storage_trait` defines the `Store` contract; `database_storage` is the
//! SQLite implementation behind it.

pub mod database_storage;
pub mod storage_trait;

pub use database_storage::DatabaseStore;
pub use storage_trait::Store;
