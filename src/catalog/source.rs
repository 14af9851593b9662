//! Data source contracts used by the query coordinator.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{FilterCriteria, Record};

/// Errors surfaced on the query path.
///
/// `Clone` so a single coalesced fetch can hand the same error to every
/// waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Remote unreachable, timed out or returned a server error.
  #[error("remote fetch failed: {0}")]
  Transient(String),

  /// The local store could not be read.
  #[error("local store error: {0}")]
  LocalStorage(String),

  /// The shared fetch task was aborted before it produced a result.
  #[error("fetch was cancelled")]
  Cancelled,
}

impl FetchError {
  /// Whether retrying the same request can reasonably succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, FetchError::Transient(_))
  }
}

/// A slice of records as returned by either data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
  pub items: Vec<Record>,
  pub has_more: bool,
}

/// The online data source.
pub trait RemoteFetch: Send + Sync + 'static {
  /// Fetch page `page` (1-based) of at most `limit` records.
  fn fetch<'a>(
    &'a self,
    criteria: &'a FilterCriteria,
    page: u32,
    limit: u32,
  ) -> BoxFuture<'a, Result<FetchResponse, FetchError>>;
}

/// The offline fallback source.
///
/// Must not depend on connectivity; may fail only when local storage is
/// unreadable.
pub trait LocalFetch: Send + Sync + 'static {
  fn fetch_local<'a>(
    &'a self,
    criteria: &'a FilterCriteria,
    offset: u32,
    limit: u32,
  ) -> BoxFuture<'a, Result<FetchResponse, FetchError>>;
}
