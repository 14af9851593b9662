//! Query result caching and persistence.
//!
//! This module provides the storage side of the sync layer:
//! - A byte-oriented [`KeyValueStore`] contract with SQLite, in-memory and
//!   no-op backends
//! - [`PersistentCacheStore`], which writes whole [`CacheSnapshot`]s tagged
//!   with a buster version and purges them when incompatible or too old
//! - [`CacheResult`] metadata describing where returned data came from

mod layer;
mod storage;
mod traits;

pub use layer::{CacheEntry, CacheSnapshot, PersistentCacheStore};
pub use storage::{MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, KeyValueStore};
