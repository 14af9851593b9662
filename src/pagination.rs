//! Page cursor arithmetic and accumulated ("infinite") queries.

use crate::cache::KeyValueStore;
use crate::catalog::{FetchError, FilterCriteria, Page, Record};
use crate::coordinator::QueryCoordinator;

/// Cursor of the page following `last_page`, or `None` when there are no
/// further pages.
///
/// `pages_fetched` is the number of pages fetched so far, `last_page`
/// included.
pub fn next_cursor(last_page: &Page, pages_fetched: u32) -> Option<u32> {
  last_page.has_more.then(|| pages_fetched + 1)
}

/// Accumulates consecutive pages of one query.
pub struct InfiniteQuery<S: KeyValueStore> {
  coordinator: QueryCoordinator<S>,
  criteria: FilterCriteria,
  pages: Vec<Page>,
}

impl<S: KeyValueStore> InfiniteQuery<S> {
  pub fn new(coordinator: QueryCoordinator<S>, criteria: FilterCriteria) -> Self {
    Self {
      coordinator,
      criteria,
      pages: Vec::new(),
    }
  }

  pub fn criteria(&self) -> &FilterCriteria {
    &self.criteria
  }

  pub fn pages(&self) -> &[Page] {
    &self.pages
  }

  /// All records fetched so far, in page order.
  pub fn items(&self) -> impl Iterator<Item = &Record> {
    self.pages.iter().flat_map(|page| page.items.iter())
  }

  /// Cursor of the next page to fetch, `None` once exhausted.
  pub fn next_cursor(&self) -> Option<u32> {
    match self.pages.last() {
      Some(last) => next_cursor(last, self.pages.len() as u32),
      None => Some(1),
    }
  }

  pub fn has_next_page(&self) -> bool {
    self.next_cursor().is_some()
  }

  /// Fetch the next page. Returns `Ok(None)` when every page is loaded.
  pub async fn fetch_next_page(&mut self) -> Result<Option<&Page>, FetchError> {
    let Some(cursor) = self.next_cursor() else {
      return Ok(None);
    };

    let page = self.coordinator.fetch_page(&self.criteria, cursor).await?;
    self.pages.push(page);
    Ok(self.pages.last())
  }

  /// Fetch pages until exhausted or `max_pages` are loaded.
  pub async fn fetch_all(&mut self, max_pages: u32) -> Result<usize, FetchError> {
    while (self.pages.len() as u32) < max_pages && self.fetch_next_page().await?.is_some() {}
    Ok(self.pages.len())
  }

  /// Drop accumulated pages; the next fetch starts again at page 1.
  pub fn reset(&mut self) {
    self.pages.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, PersistentCacheStore};
  use crate::catalog::{record, FetchResponse, LocalFetch, RemoteFetch};
  use crate::connectivity::{ConnectivityMonitor, ManualSignal};
  use crate::coordinator::CoordinatorOptions;
  use futures::future::BoxFuture;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  /// Serves `total` records in pages, recording requested page numbers.
  struct PagedRemote {
    records: Vec<Record>,
    pages: Mutex<Vec<u32>>,
    calls: AtomicUsize,
  }

  impl PagedRemote {
    fn new(total: usize) -> Arc<Self> {
      let records = (0..total)
        .map(|i| record(&i.to_string(), &format!("Strain {:02}", i), "hybrid", None))
        .collect();
      Arc::new(Self {
        records,
        pages: Mutex::new(Vec::new()),
        calls: AtomicUsize::new(0),
      })
    }
  }

  impl RemoteFetch for PagedRemote {
    fn fetch<'a>(
      &'a self,
      _criteria: &'a FilterCriteria,
      page: u32,
      limit: u32,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
      Box::pin(async move {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages.lock().unwrap().push(page);
        let offset = ((page - 1) * limit) as usize;
        let items: Vec<_> = self
          .records
          .iter()
          .skip(offset)
          .take(limit as usize)
          .cloned()
          .collect();
        Ok(FetchResponse {
          has_more: offset + items.len() < self.records.len(),
          items,
        })
      })
    }
  }

  struct NoLocal;

  impl LocalFetch for NoLocal {
    fn fetch_local<'a>(
      &'a self,
      _criteria: &'a FilterCriteria,
      _offset: u32,
      _limit: u32,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
      Box::pin(async { Err(FetchError::LocalStorage("no local catalog".to_string())) })
    }
  }

  fn infinite(remote: Arc<PagedRemote>, page_size: u32) -> InfiniteQuery<MemoryStorage> {
    let signal = ManualSignal::new();
    let coordinator = QueryCoordinator::new(
      remote,
      Arc::new(NoLocal),
      ConnectivityMonitor::start(&signal),
      PersistentCacheStore::new(MemoryStorage::new(), "1.0.0"),
      CoordinatorOptions::default(),
    );
    InfiniteQuery::new(coordinator, FilterCriteria::new(page_size))
  }

  #[tokio::test]
  async fn test_fetch_all_stops_when_no_more_pages() {
    let remote = PagedRemote::new(5);
    let mut query = infinite(Arc::clone(&remote), 2);

    assert_eq!(query.fetch_all(10).await.unwrap(), 3);

    assert_eq!(*remote.pages.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(query.items().count(), 5);
    assert!(!query.has_next_page());
    assert!(query.fetch_next_page().await.unwrap().is_none());
    assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_fetch_all_respects_max_pages() {
    let remote = PagedRemote::new(10);
    let mut query = infinite(Arc::clone(&remote), 2);

    assert_eq!(query.fetch_all(2).await.unwrap(), 2);

    assert_eq!(query.next_cursor(), Some(3));
    assert_eq!(query.items().count(), 4);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_reset_starts_over_from_cache() {
    let remote = PagedRemote::new(3);
    let mut query = infinite(Arc::clone(&remote), 2);
    query.fetch_all(10).await.unwrap();

    query.reset();
    assert!(query.pages().is_empty());
    assert_eq!(query.next_cursor(), Some(1));

    let first = query.fetch_next_page().await.unwrap().unwrap();
    assert_eq!(first.cursor, 1);
    // Served from the fresh cache entry
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
  }

  fn page(has_more: bool, cursor: u32) -> Page {
    Page {
      items: Vec::new(),
      has_more,
      cursor,
    }
  }

  #[test]
  fn test_next_cursor_after_first_page() {
    assert_eq!(next_cursor(&page(true, 1), 1), Some(2));
  }

  #[test]
  fn test_next_cursor_done() {
    assert_eq!(next_cursor(&page(false, 1), 1), None);
    assert_eq!(next_cursor(&page(false, 7), 7), None);
  }

  #[test]
  fn test_next_cursor_counts_pages_fetched() {
    assert_eq!(next_cursor(&page(true, 3), 3), Some(4));
  }
}
