use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;
use url::Url;

use crate::catalog::api_types::{ApiChangesResponse, ApiPageResponse};
use crate::catalog::source::{FetchError, FetchResponse, RemoteFetch};
use crate::catalog::types::{FilterCriteria, Record};
use crate::config::RemoteConfig;

/// Page size used when walking the change feed.
const CHANGES_PAGE_SIZE: u32 = 200;

/// HTTP client for the catalog API
#[derive(Clone)]
pub struct RemoteCatalog {
  client: reqwest::Client,
  base_url: Url,
}

impl RemoteCatalog {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    // Url::join replaces the last segment unless the base ends in '/'
    let mut base_url = config.url.clone();
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path)
      .map_err(|e| FetchError::Transient(format!("invalid endpoint {}: {}", path, e)))
  }

  /// Fetch one page of records matching `criteria`
  pub async fn fetch_page(
    &self,
    criteria: &FilterCriteria,
    page: u32,
    limit: u32,
  ) -> Result<FetchResponse, FetchError> {
    let url = self.endpoint("records")?;

    let mut query = criteria.query_pairs();
    query.push(("page", page.to_string()));
    query.push(("limit", limit.to_string()));

    let response = self
      .client
      .get(url)
      .query(&query)
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
      .map_err(|e| FetchError::Transient(e.to_string()))?;

    let body: ApiPageResponse = response
      .json()
      .await
      .map_err(|e| FetchError::Transient(format!("failed to parse records: {}", e)))?;

    let has_more = body.has_more(page, limit);
    Ok(FetchResponse {
      items: body.items.into_iter().map(Record::from).collect(),
      has_more,
    })
  }

  /// Fetch every record modified after `since` (all records when `None`).
  pub async fn fetch_updated_since(&self, since: Option<&str>) -> Result<Vec<Record>> {
    let url = self
      .endpoint("records/changes")
      .map_err(|e| eyre!("{}", e))?;

    let mut all_records = Vec::new();
    let mut page = 1u32;

    loop {
      let mut query = vec![
        ("page", page.to_string()),
        ("limit", CHANGES_PAGE_SIZE.to_string()),
      ];
      if let Some(since) = since {
        query.push(("since", since.to_string()));
      }

      let response: ApiChangesResponse = self
        .client
        .get(url.clone())
        .query(&query)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| eyre!("Failed to fetch changes: {}", e))?
        .json()
        .await
        .map_err(|e| eyre!("Failed to parse changes: {}", e))?;

      let count = response.items.len();
      all_records.extend(response.items.into_iter().map(Record::from));

      if response.is_last || count < CHANGES_PAGE_SIZE as usize {
        break;
      }
      page += 1;
    }

    Ok(all_records)
  }
}

impl RemoteFetch for RemoteCatalog {
  fn fetch<'a>(
    &'a self,
    criteria: &'a FilterCriteria,
    page: u32,
    limit: u32,
  ) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
    Box::pin(self.fetch_page(criteria, page, limit))
  }
}
