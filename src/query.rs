//! Consumer-side handle on one page of a query.
//!
//! A [`QueryHandle`] starts a fetch through the [`QueryCoordinator`] and
//! exposes its progress as a [`QueryState`] that the consumer polls from its
//! own loop.
//!
//! ```ignore
//! let mut handle = QueryHandle::new(coordinator.clone(), criteria, 1);
//! handle.fetch();
//!
//! // In the event loop tick
//! if handle.poll() {
//!     match handle.state() {
//!         QueryState::Loading => show_spinner(),
//!         QueryState::Success(page) => show_page(page),
//!         QueryState::Error(e) => show_error(e),
//!         QueryState::Idle => {}
//!     }
//! }
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheResult, CacheSource, KeyValueStore};
use crate::catalog::{FetchError, FilterCriteria, Page};
use crate::coordinator::QueryCoordinator;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(Page),
  /// Query failed with an error
  Error(FetchError),
}

impl QueryState {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&Page> {
    match self {
      QueryState::Success(page) => Some(page),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type FetchOutcome = Result<CacheResult<Page>, FetchError>;

/// One consumer's view of page `cursor` for a fixed set of criteria.
///
/// Dropping or unmounting the handle stops it waiting; the underlying fetch
/// keeps running for any other consumer of the same page.
pub struct QueryHandle<S: KeyValueStore> {
  coordinator: QueryCoordinator<S>,
  criteria: FilterCriteria,
  cursor: u32,
  state: QueryState,
  source: Option<CacheSource>,
  receiver: Option<mpsc::UnboundedReceiver<FetchOutcome>>,
  waiter: Option<JoinHandle<()>>,
}

impl<S: KeyValueStore> QueryHandle<S> {
  pub fn new(coordinator: QueryCoordinator<S>, criteria: FilterCriteria, cursor: u32) -> Self {
    Self {
      coordinator,
      criteria,
      cursor: cursor.max(1),
      state: QueryState::Idle,
      source: None,
      receiver: None,
      waiter: None,
    }
  }

  pub fn criteria(&self) -> &FilterCriteria {
    &self.criteria
  }

  pub fn cursor(&self) -> u32 {
    self.cursor
  }

  pub fn state(&self) -> &QueryState {
    &self.state
  }

  pub fn data(&self) -> Option<&Page> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// Where the last successful page came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  /// Start fetching if not already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start(false);
  }

  /// Fetch again, bypassing the cache.
  pub fn refetch(&mut self) {
    self.stop_waiting();
    self.start(true);
  }

  /// Poll for the result of a pending fetch.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    match receiver.try_recv() {
      Ok(Ok(result)) => {
        self.source = Some(result.source);
        self.state = QueryState::Success(result.data);
        self.finish();
        true
      }
      Ok(Err(e)) => {
        self.state = QueryState::Error(e);
        self.finish();
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error(FetchError::Cancelled);
        self.finish();
        true
      }
    }
  }

  /// Wait for the pending fetch and return the new state.
  pub async fn settle(&mut self) -> &QueryState {
    if let Some(receiver) = &mut self.receiver {
      let outcome = receiver.recv().await;
      match outcome {
        Some(Ok(result)) => {
          self.source = Some(result.source);
          self.state = QueryState::Success(result.data);
        }
        Some(Err(e)) => self.state = QueryState::Error(e),
        None => self.state = QueryState::Error(FetchError::Cancelled),
      }
      self.finish();
    }
    &self.state
  }

  /// Stop waiting for the pending fetch and go back to idle.
  pub fn unmount(&mut self) {
    self.stop_waiting();
    self.state = QueryState::Idle;
  }

  fn start(&mut self, bypass_cache: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let coordinator = self.coordinator.clone();
    let criteria = self.criteria.clone();
    let cursor = self.cursor;
    self.waiter = Some(tokio::spawn(async move {
      let outcome = if bypass_cache {
        coordinator.refetch_page_with_source(&criteria, cursor).await
      } else {
        coordinator.fetch_page_with_source(&criteria, cursor).await
      };
      // Receiver is gone once the handle unmounts
      let _ = tx.send(outcome);
    }));
  }

  fn finish(&mut self) {
    self.receiver = None;
    self.waiter = None;
  }

  fn stop_waiting(&mut self) {
    self.receiver = None;
    if let Some(waiter) = self.waiter.take() {
      waiter.abort();
    }
  }
}

impl<S: KeyValueStore> Drop for QueryHandle<S> {
  fn drop(&mut self) {
    self.stop_waiting();
  }
}

impl<S: KeyValueStore> std::fmt::Debug for QueryHandle<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", &self.criteria.query_key().to_string())
      .field("cursor", &self.cursor)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
