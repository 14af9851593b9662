//! Persistence of query results across restarts.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use super::traits::KeyValueStore;
use crate::catalog::{Page, QueryKey};

/// Storage key under which the snapshot is written.
const SNAPSHOT_KEY: &str = "strainsync-query-cache";

/// Cached pages for a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: QueryKey,
  /// Pages in cursor order; `pages[i].cursor == i + 1`
  pub pages: Vec<Page>,
  pub stored_at: DateTime<Utc>,
  /// Buster of the build that wrote this entry
  pub version: String,
}

impl CacheEntry {
  pub fn page(&self, cursor: u32) -> Option<&Page> {
    let index = usize::try_from(cursor.checked_sub(1)?).ok()?;
    self.pages.get(index)
  }
}

/// Every cached query, as persisted in one payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
  pub entries: Vec<CacheEntry>,
}

/// On-disk envelope. `snapshot` is kept as JSON text so the checksum covers
/// the exact bytes written.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
  buster: String,
  timestamp: DateTime<Utc>,
  checksum: String,
  snapshot: String,
}

fn checksum(payload: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload.as_bytes());
  hex::encode(hasher.finalize())
}

fn encode(snapshot: &CacheSnapshot, buster: &str, timestamp: DateTime<Utc>) -> Result<Vec<u8>> {
  let snapshot =
    serde_json::to_string(snapshot).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
  let persisted = PersistedCache {
    buster: buster.to_string(),
    timestamp,
    checksum: checksum(&snapshot),
    snapshot,
  };
  serde_json::to_vec(&persisted).map_err(|e| eyre!("Failed to serialize cache: {}", e))
}

/// Outcome of decoding a stored payload.
#[derive(Debug)]
enum Decoded {
  Valid(CacheSnapshot),
  /// Intact but unusable (other build or too old)
  Expired(String),
}

fn decode(bytes: &[u8], buster: &str, max_age: Duration, now: DateTime<Utc>) -> Result<Decoded> {
  let persisted: PersistedCache =
    serde_json::from_slice(bytes).map_err(|e| eyre!("Unreadable cache payload: {}", e))?;

  if checksum(&persisted.snapshot) != persisted.checksum {
    return Err(eyre!("Cache payload checksum mismatch"));
  }

  if persisted.buster != buster {
    return Ok(Decoded::Expired(format!(
      "buster changed from {} to {}",
      persisted.buster, buster
    )));
  }

  if now - persisted.timestamp > max_age {
    return Ok(Decoded::Expired(format!(
      "written at {} exceeds max age",
      persisted.timestamp
    )));
  }

  let mut snapshot: CacheSnapshot = serde_json::from_str(&persisted.snapshot)
    .map_err(|e| eyre!("Unreadable cache snapshot: {}", e))?;

  snapshot
    .entries
    .retain(|entry| entry.version == buster && now - entry.stored_at <= max_age);

  Ok(Decoded::Valid(snapshot))
}

/// Persists [`CacheSnapshot`]s in a [`KeyValueStore`], tagged with a buster
/// version and discarded wholesale once too old or written by another build.
pub struct PersistentCacheStore<S: KeyValueStore> {
  storage: Arc<S>,
  buster: String,
  max_age: Duration,
  /// Sequence number handed to the next `persist` call
  next_seq: Arc<AtomicU64>,
  /// Sequence number of the snapshot currently in storage
  written_seq: Arc<Mutex<u64>>,
}

impl<S: KeyValueStore> PersistentCacheStore<S> {
  pub fn new(storage: S, buster: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      buster: buster.into(),
      max_age: Duration::hours(24),
      next_seq: Arc::new(AtomicU64::new(1)),
      written_seq: Arc::new(Mutex::new(0)),
    }
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn buster(&self) -> &str {
    &self.buster
  }

  /// Read the persisted snapshot written under `buster`.
  ///
  /// Anything other than an intact, current payload purges the stored state
  /// and yields `None`; a partially trusted cache is never returned.
  pub async fn restore(&self, buster: &str) -> Option<CacheSnapshot> {
    let storage = Arc::clone(&self.storage);
    let buster = buster.to_string();
    let max_age = self.max_age;

    let outcome = tokio::task::spawn_blocking(move || -> Result<Option<Decoded>> {
      match storage.get(SNAPSHOT_KEY)? {
        Some(bytes) => decode(&bytes, &buster, max_age, Utc::now()).map(Some),
        None => Ok(None),
      }
    })
    .await
    .map_err(|e| eyre!("Restore task failed: {}", e))
    .and_then(|r| r);

    match outcome {
      Ok(Some(Decoded::Valid(snapshot))) => {
        tracing::debug!(entries = snapshot.entries.len(), "restored query cache");
        Some(snapshot)
      }
      Ok(Some(Decoded::Expired(reason))) => {
        tracing::info!(%reason, "discarding persisted query cache");
        self.clear().await;
        None
      }
      Ok(None) => None,
      Err(e) => {
        tracing::warn!(error = %e, "persisted query cache is corrupt, purging");
        self.clear().await;
        None
      }
    }
  }

  /// Write `snapshot` in the background.
  ///
  /// Failures are logged and never reach the caller. The returned handle may
  /// be awaited or dropped. A snapshot is never written over one that was
  /// handed to `persist` after it.
  pub fn persist(&self, snapshot: CacheSnapshot) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let buster = self.buster.clone();
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
    let written_seq = Arc::clone(&self.written_seq);

    tokio::task::spawn_blocking(move || {
      let mut written = written_seq.lock().unwrap_or_else(PoisonError::into_inner);
      if *written > seq {
        tracing::trace!(seq, written = *written, "skipping superseded snapshot");
        return;
      }
      *written = seq;

      let result = encode(&snapshot, &buster, Utc::now())
        .and_then(|bytes| storage.set(SNAPSHOT_KEY, &bytes));
      if let Err(e) = result {
        tracing::warn!(error = %e, "failed to persist query cache");
      }
    })
  }

  /// Remove all persisted entries. Snapshots handed to `persist` earlier and
  /// not yet written are dropped.
  pub async fn clear(&self) {
    let storage = Arc::clone(&self.storage);
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
    let written_seq = Arc::clone(&self.written_seq);

    let result = tokio::task::spawn_blocking(move || {
      let mut written = written_seq.lock().unwrap_or_else(PoisonError::into_inner);
      *written = (*written).max(seq);
      storage.remove(SNAPSHOT_KEY)
    })
    .await;

    match result {
      Ok(Ok(())) => {}
      Ok(Err(e)) => tracing::warn!(error = %e, "failed to clear persisted query cache"),
      Err(e) => tracing::warn!(error = %e, "clear task failed"),
    }
  }
}

impl<S: KeyValueStore> Clone for PersistentCacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      buster: self.buster.clone(),
      max_age: self.max_age,
      next_seq: Arc::clone(&self.next_seq),
      written_seq: Arc::clone(&self.written_seq),
    }
  }
}
