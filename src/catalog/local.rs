//! SQLite-backed local catalog used when the remote is unreachable.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::source::{FetchError, FetchResponse, LocalFetch};
use super::types::{FilterCriteria, Record};

/// Schema for the local record mirror.
const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_name ON records(name);
CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at);
"#;

/// Local mirror of the remote catalog.
#[derive(Clone)]
pub struct SqliteCatalog {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
  /// Open or create the catalog database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create catalog directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open catalog database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory catalog: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CATALOG_SCHEMA)
      .map_err(|e| eyre!("Failed to run catalog migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Insert or replace records by id. Returns the number written.
  pub fn upsert(&self, records: &[Record]) -> Result<usize> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for record in records {
      let data =
        serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO records (id, name, data, updated_at) VALUES (?, ?, ?, ?)",
        params![record.id, record.name, data, record.updated_at],
      )
      .map_err(|e| eyre!("Failed to store record {}: {}", record.id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(records.len())
  }

  /// Latest `updated_at` in the mirror, used as the delta-sync watermark.
  pub fn max_updated_at(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let max: Option<Option<String>> = conn
      .query_row("SELECT MAX(updated_at) FROM records", [], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read max updated_at: {}", e))?;

    Ok(max.flatten())
  }

  pub fn count(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count records: {}", e))?;

    Ok(usize::try_from(count).unwrap_or_default())
  }

  /// Run `criteria` against the mirror, returning at most `limit` records
  /// starting at `offset`.
  pub fn query(
    &self,
    criteria: &FilterCriteria,
    offset: u32,
    limit: u32,
  ) -> Result<FetchResponse, FetchError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| FetchError::LocalStorage(format!("lock poisoned: {}", e)))?;

    let mut stmt = conn
      .prepare("SELECT data FROM records ORDER BY name COLLATE NOCASE, id")
      .map_err(|e| FetchError::LocalStorage(e.to_string()))?;

    let rows = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| FetchError::LocalStorage(e.to_string()))?;

    // Rows are decoded before filtering; a corrupt row up to the lookahead
    // fails the query wherever it sorts
    let mut skipped = 0u32;
    let mut items = Vec::with_capacity(limit as usize);
    let mut has_more = false;
    for row in rows {
      let data = row.map_err(|e| FetchError::LocalStorage(e.to_string()))?;
      let record = serde_json::from_slice::<Record>(&data)
        .map_err(|e| FetchError::LocalStorage(format!("corrupt record: {}", e)))?;

      if !criteria.matches(&record) {
        continue;
      }
      if skipped < offset {
        skipped += 1;
      } else if items.len() < limit as usize {
        items.push(record);
      } else {
        has_more = true;
        break;
      }
    }

    Ok(FetchResponse { items, has_more })
  }
}

impl LocalFetch for SqliteCatalog {
  fn fetch_local<'a>(
    &'a self,
    criteria: &'a FilterCriteria,
    offset: u32,
    limit: u32,
  ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
    let catalog = self.clone();
    let criteria = criteria.clone();

    Box::pin(async move {
      tokio::task::spawn_blocking(move || catalog.query(&criteria, offset, limit))
        .await
        .map_err(|e| FetchError::LocalStorage(format!("local query task failed: {}", e)))?
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::types::record;

  fn seeded() -> SqliteCatalog {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    catalog
      .upsert(&[
        record("1", "Blue Dream", "hybrid", Some(18.0)),
        record("2", "Blueberry", "indica", Some(16.0)),
        record("3", "Sour Diesel", "sativa", Some(22.0)),
        record("4", "Blue Cheese", "indica", Some(19.0)),
      ])
      .unwrap();
    catalog
  }

  #[test]
  fn test_query_applies_shared_predicate() {
    let catalog = seeded();
    let criteria = FilterCriteria::new(20).with_search("blue").with_species("indica");

    let result = catalog.query(&criteria, 0, 20).unwrap();
    let names: Vec<_> = result.items.iter().map(|r| r.name.as_str()).collect();

    assert_eq!(names, vec!["Blue Cheese", "Blueberry"]);
    assert!(!result.has_more);
  }

  #[test]
  fn test_query_paginates_with_offset() {
    let catalog = seeded();
    let criteria = FilterCriteria::new(2).with_search("blue");

    let first = catalog.query(&criteria, 0, 2).unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.has_more);

    let second = catalog.query(&criteria, 2, 2).unwrap();
    assert_eq!(second.items.len(), 1);
    assert!(!second.has_more);
  }

  #[test]
  fn test_upsert_replaces_and_tracks_watermark() {
    let catalog = seeded();
    assert_eq!(catalog.max_updated_at().unwrap().as_deref(), Some("2024-01-01T00:00:00Z"));

    let mut updated = record("3", "Sour Diesel", "sativa", Some(24.0));
    updated.updated_at = "2024-02-01T00:00:00Z".to_string();
    catalog.upsert(&[updated]).unwrap();

    assert_eq!(catalog.count().unwrap(), 4);
    assert_eq!(catalog.max_updated_at().unwrap().as_deref(), Some("2024-02-01T00:00:00Z"));
  }

  #[test]
  fn test_corrupt_row_is_local_storage_error() {
    let catalog = seeded();
    {
      let conn = catalog.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO records (id, name, data, updated_at) VALUES ('x', 'Aaa', X'00', '')",
          [],
        )
        .unwrap();
    }

    let err = catalog.query(&FilterCriteria::default(), 0, 20).unwrap_err();
    assert!(matches!(err, FetchError::LocalStorage(_)));
  }

  #[test]
  fn test_corrupt_row_before_page_is_not_skipped() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    catalog
      .upsert(&[
        record("1", "Blue Dream", "hybrid", Some(18.0)),
        record("2", "Zeta", "sativa", Some(20.0)),
      ])
      .unwrap();
    {
      let conn = catalog.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO records (id, name, data, updated_at) VALUES ('x', 'Aaa', X'00', '')",
          [],
        )
        .unwrap();
    }

    let err = catalog.query(&FilterCriteria::default(), 1, 1).unwrap_err();
    assert!(matches!(err, FetchError::LocalStorage(_)));
  }

  #[test]
  fn test_corrupt_row_in_lookahead_is_an_error() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    catalog
      .upsert(&[record("1", "Blue Dream", "hybrid", Some(18.0))])
      .unwrap();
    {
      let conn = catalog.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO records (id, name, data, updated_at) VALUES ('x', 'Zzz', X'00', '')",
          [],
        )
        .unwrap();
    }

    let err = catalog.query(&FilterCriteria::default(), 0, 1).unwrap_err();
    assert!(matches!(err, FetchError::LocalStorage(_)));
  }

  #[tokio::test]
  async fn test_fetch_local_runs_off_thread() {
    let catalog = seeded();
    let criteria = FilterCriteria::new(20).with_species("sativa");

    let result = catalog.fetch_local(&criteria, 0, 20).await.unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].id, "3");
  }

  #[test]
  fn test_empty_catalog_has_no_watermark() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    assert_eq!(catalog.max_updated_at().unwrap(), None);
  }
}
