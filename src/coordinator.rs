//! Query coordinator: chooses the remote or local path for each page request,
//! coalesces identical in-flight requests and keeps the query cache current.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::{
  CacheEntry, CacheResult, CacheSnapshot, KeyValueStore, PersistentCacheStore,
};
use crate::catalog::{
  FetchError, FetchResponse, FilterCriteria, LocalFetch, Page, QueryKey, RemoteFetch,
};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::debounce::Debouncer;

type FetchOutcome = Result<CacheResult<Page>, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Tuning for [`QueryCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
  /// Cached pages younger than this are served without a fetch
  pub stale_time: chrono::Duration,
  /// Retries after the first failed remote attempt
  pub retry: u32,
  /// First retry delay; doubles on each further attempt
  pub retry_base: Duration,
  pub retry_max: Duration,
  /// Quiet window for search keystrokes
  pub debounce: Duration,
  pub page_size: u32,
}

impl Default for CoordinatorOptions {
  fn default() -> Self {
    Self {
      stale_time: chrono::Duration::minutes(5),
      retry: 2,
      retry_base: Duration::from_secs(1),
      retry_max: Duration::from_secs(30),
      debounce: Duration::from_millis(300),
      page_size: crate::catalog::DEFAULT_PAGE_SIZE,
    }
  }
}

impl CoordinatorOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      stale_time: config.cache.stale_time(),
      retry: config.query.retry,
      retry_base: config.query.retry_base(),
      debounce: config.query.debounce(),
      page_size: config.query.page_size,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (0-based).
  fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self.retry_base.saturating_mul(factor).min(self.retry_max)
  }
}

struct Inner<S: KeyValueStore> {
  remote: Arc<dyn RemoteFetch>,
  local: Arc<dyn LocalFetch>,
  connectivity: ConnectivityMonitor,
  store: PersistentCacheStore<S>,
  options: CoordinatorOptions,
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  in_flight: Mutex<HashMap<(QueryKey, u32), SharedFetch>>,
  /// Entries stored at or before this instant count as stale
  stale_before: Mutex<Option<DateTime<Utc>>>,
  criteria: Arc<watch::Sender<FilterCriteria>>,
  search: Debouncer<String>,
  reconnect: Mutex<Option<Subscription>>,
}

/// Serves pages of catalog query results.
///
/// Cloning is cheap; clones share the cache and the in-flight table.
pub struct QueryCoordinator<S: KeyValueStore> {
  inner: Arc<Inner<S>>,
}

impl<S: KeyValueStore> Clone for QueryCoordinator<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: KeyValueStore> QueryCoordinator<S> {
  pub fn new(
    remote: Arc<dyn RemoteFetch>,
    local: Arc<dyn LocalFetch>,
    connectivity: ConnectivityMonitor,
    store: PersistentCacheStore<S>,
    options: CoordinatorOptions,
  ) -> Self {
    let (criteria_tx, _) = watch::channel(FilterCriteria::new(options.page_size));
    let criteria = Arc::new(criteria_tx);

    let search_target = Arc::clone(&criteria);
    let search = Debouncer::new(options.debounce, move |search: String| {
      search_target.send_if_modified(|current| {
        let next = current.clone().with_search(&search);
        let changed = *current != next;
        *current = next;
        changed
      });
    });

    let coordinator = Self {
      inner: Arc::new(Inner {
        remote,
        local,
        connectivity,
        store,
        options,
        entries: Mutex::new(HashMap::new()),
        in_flight: Mutex::new(HashMap::new()),
        stale_before: Mutex::new(None),
        criteria,
        search,
        reconnect: Mutex::new(None),
      }),
    };

    // Results read while offline may be incomplete; age them all on reconnect
    let weak: Weak<Inner<S>> = Arc::downgrade(&coordinator.inner);
    let subscription = coordinator.inner.connectivity.subscribe_edges(move |edge| {
      if let Some(inner) = weak.upgrade() {
        *inner.stale_before.lock().unwrap_or_else(PoisonError::into_inner) = Some(edge.at);
      }
    });
    *coordinator
      .inner
      .reconnect
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

    coordinator
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.inner.connectivity
  }

  pub fn options(&self) -> &CoordinatorOptions {
    &self.inner.options
  }

  /// Load persisted results into the cache. Returns the number of entries.
  pub async fn restore(&self) -> usize {
    let Some(snapshot) = self.inner.store.restore(self.inner.store.buster()).await else {
      return 0;
    };

    let mut entries = self.lock_entries();
    entries.clear();
    for entry in snapshot.entries {
      entries.insert(entry.key.clone(), entry);
    }
    tracing::info!(entries = entries.len(), "query cache restored");
    entries.len()
  }

  /// Drop every cached result, in memory and persisted.
  pub async fn invalidate_all(&self) {
    self.lock_entries().clear();
    self.inner.store.clear().await;
  }

  /// Fetch page `cursor` (1-based) of `criteria`.
  pub async fn fetch_page(&self, criteria: &FilterCriteria, cursor: u32) -> Result<Page, FetchError> {
    self
      .fetch_page_with_source(criteria, cursor)
      .await
      .map(|result| result.data)
  }

  /// Like [`fetch_page`](Self::fetch_page), also reporting where the page
  /// came from.
  ///
  /// 1. Fresh cached page - returned without a fetch
  /// 2. Stale cached page - returned, and a background refetch is started
  /// 3. No cached page - fetched (remote when online, local otherwise)
  pub async fn fetch_page_with_source(&self, criteria: &FilterCriteria, cursor: u32) -> FetchOutcome {
    let cursor = cursor.max(1);
    let key = criteria.query_key();

    if let Some((page, stored_at)) = self.cached_page(&key, cursor) {
      if !self.is_stale(stored_at) {
        return Ok(CacheResult::from_cache(page, stored_at, false));
      }

      tracing::debug!(key = %key, cursor, "serving stale page, refetching in background");
      // The shared fetch runs on its own task; no need to await it here
      drop(self.shared_fetch(criteria, key, cursor));
      return Ok(CacheResult::from_cache(page, stored_at, true));
    }

    self.shared_fetch(criteria, key, cursor).await
  }

  /// Fetch page `cursor` bypassing the cache.
  pub async fn refetch_page(&self, criteria: &FilterCriteria, cursor: u32) -> Result<Page, FetchError> {
    self
      .refetch_page_with_source(criteria, cursor)
      .await
      .map(|result| result.data)
  }

  /// Like [`refetch_page`](Self::refetch_page); the source is `Local` when
  /// the fetch ran offline.
  pub async fn refetch_page_with_source(&self, criteria: &FilterCriteria, cursor: u32) -> FetchOutcome {
    let cursor = cursor.max(1);
    self.shared_fetch(criteria, criteria.query_key(), cursor).await
  }

  /// Feed a search keystroke; applied to [`criteria`](Self::criteria) once
  /// input is quiet for the debounce window.
  pub fn type_search(&self, text: impl Into<String>) {
    self.inner.search.push(text.into());
  }

  /// Apply the search text immediately.
  pub fn submit_search(&self, text: impl Into<String>) {
    self.inner.search.flush(text.into());
  }

  /// Discard a pending search keystroke.
  pub fn cancel_pending_search(&self) {
    self.inner.search.cancel();
  }

  /// Replace the non-search filters; the debounced search is kept.
  pub fn set_filters(&self, filters: FilterCriteria) {
    self.inner.criteria.send_if_modified(|current| {
      let next = filters.with_search(current.search());
      let changed = *current != next;
      *current = next;
      changed
    });
  }

  /// Current stable criteria.
  pub fn criteria(&self) -> FilterCriteria {
    self.inner.criteria.borrow().clone()
  }

  /// Receiver notified each time the stable criteria change.
  pub fn watch_criteria(&self) -> watch::Receiver<FilterCriteria> {
    self.inner.criteria.subscribe()
  }

  /// Fetch page `cursor` of the current stable criteria.
  pub async fn fetch_current(&self, cursor: u32) -> Result<Page, FetchError> {
    let criteria = self.criteria();
    self.fetch_page(&criteria, cursor).await
  }

  pub fn cached_entry(&self, criteria: &FilterCriteria) -> Option<CacheEntry> {
    self.lock_entries().get(&criteria.query_key()).cloned()
  }

  /// Number of distinct fetches currently running.
  pub fn in_flight_count(&self) -> usize {
    self.lock_in_flight().len()
  }

  fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
    self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<(QueryKey, u32), SharedFetch>> {
    self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn cached_page(&self, key: &QueryKey, cursor: u32) -> Option<(Page, DateTime<Utc>)> {
    let entries = self.lock_entries();
    let entry = entries.get(key)?;
    entry.page(cursor).map(|page| (page.clone(), entry.stored_at))
  }

  fn is_stale(&self, stored_at: DateTime<Utc>) -> bool {
    let invalidated = self
      .inner
      .stale_before
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some_and(|before| stored_at <= before);
    invalidated || Utc::now() - stored_at > self.inner.options.stale_time
  }

  /// Join the in-flight fetch for `(key, cursor)`, starting one if needed.
  ///
  /// The fetch runs on a spawned task, so dropping any one caller's future
  /// leaves it running for the rest.
  fn shared_fetch(&self, criteria: &FilterCriteria, key: QueryKey, cursor: u32) -> SharedFetch {
    let mut in_flight = self.lock_in_flight();
    let slot = (key, cursor);

    if let Some(existing) = in_flight.get(&slot) {
      tracing::trace!(key = %slot.0, cursor, "joining in-flight fetch");
      return existing.clone();
    }

    let this = self.clone();
    let criteria = criteria.clone();
    let task_slot = slot.clone();
    let handle = tokio::spawn(async move {
      let (key, cursor) = &task_slot;
      let result = this.run_fetch(&criteria, key, *cursor).await;
      this.lock_in_flight().remove(&task_slot);
      result
    });

    let shared = async move { handle.await.unwrap_or(Err(FetchError::Cancelled)) }
      .boxed()
      .shared();
    in_flight.insert(slot, shared.clone());
    shared
  }

  async fn run_fetch(&self, criteria: &FilterCriteria, key: &QueryKey, cursor: u32) -> FetchOutcome {
    let limit = criteria.page_size();
    let online = self.inner.connectivity.is_online();

    let result = if online {
      self
        .fetch_remote(criteria, cursor, limit)
        .await
        .map(|response| CacheResult::from_network(self.remote_page(criteria, response, cursor)))
    } else {
      let offset = (cursor - 1).saturating_mul(limit);
      self
        .inner
        .local
        .fetch_local(criteria, offset, limit)
        .await
        .map(|response| {
          CacheResult::from_local(Page {
            items: response.items,
            has_more: response.has_more,
            cursor,
          })
        })
    };

    match &result {
      Ok(fetched) => {
        tracing::debug!(key = %key, cursor, online, items = fetched.data.items.len(), "page fetched");
        self.store_page(key, fetched.data.clone());
      }
      Err(e) => tracing::warn!(key = %key, cursor, online, error = %e, "page fetch failed"),
    }

    result
  }

  async fn fetch_remote(
    &self,
    criteria: &FilterCriteria,
    cursor: u32,
    limit: u32,
  ) -> Result<FetchResponse, FetchError> {
    let mut attempt = 0;
    loop {
      match self.inner.remote.fetch(criteria, cursor, limit).await {
        Ok(response) => return Ok(response),
        Err(e) if e.is_transient() && attempt < self.inner.options.retry => {
          let delay = self.inner.options.backoff(attempt);
          attempt += 1;
          tracing::debug!(attempt, ?delay, error = %e, "remote fetch failed, retrying");
          tokio::time::sleep(delay).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  /// Build a page from a remote response, holding it to the same predicate
  /// the local path applies.
  fn remote_page(&self, criteria: &FilterCriteria, response: FetchResponse, cursor: u32) -> Page {
    let received = response.items.len();
    let items: Vec<_> = response
      .items
      .into_iter()
      .filter(|record| criteria.matches(record))
      .collect();

    if items.len() != received {
      tracing::warn!(
        dropped = received - items.len(),
        "remote returned records outside the requested filters"
      );
    }

    Page {
      items,
      has_more: response.has_more,
      cursor,
    }
  }

  /// Record `page` in its cache entry and persist the cache.
  ///
  /// Page 1 starts a new entry; later pages replace or extend a contiguous
  /// run and are otherwise not cached.
  fn store_page(&self, key: &QueryKey, page: Page) {
    let snapshot = {
      let mut entries = self.lock_entries();
      let now = Utc::now();
      let index = (page.cursor - 1) as usize;

      if index == 0 {
        entries.insert(
          key.clone(),
          CacheEntry {
            key: key.clone(),
            pages: vec![page],
            stored_at: now,
            version: self.inner.store.buster().to_string(),
          },
        );
      } else {
        match entries.get_mut(key) {
          Some(entry) if index < entry.pages.len() => {
            entry.pages[index] = page;
            entry.stored_at = now;
          }
          Some(entry) if index == entry.pages.len() => {
            entry.pages.push(page);
            entry.stored_at = now;
          }
          _ => {
            tracing::debug!(key = %key, cursor = page.cursor, "not caching non-contiguous page");
            return;
          }
        }
      }

      let mut snapshot = CacheSnapshot {
        entries: entries.values().cloned().collect(),
      };
      snapshot.entries.sort_by(|a, b| a.key.cmp(&b.key));
      snapshot
    };

    drop(self.inner.store.persist(snapshot));
  }
}
