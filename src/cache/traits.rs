//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

/// A byte-oriented key/value store that survives process restarts.
///
/// Implementations are synchronous; async callers move work onto a
/// blocking thread.
pub trait KeyValueStore: Send + Sync + 'static {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Write `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

impl<S: KeyValueStore> KeyValueStore for std::sync::Arc<S> {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> Result<()> {
    (**self).remove(key)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the remote source.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data read from the local fallback while offline.
  pub fn from_local(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Local,
      cached_at: None,
    }
  }

  /// Data served from the query cache.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the remote source
  Network,
  /// Read from the local fallback (offline)
  Local,
  /// From cache, within the freshness window
  CacheFresh,
  /// From cache, past the freshness window; a background refetch was started
  CacheStale,
}
