//! Catalog records, filter criteria and the data sources that serve them.

pub mod api_types;
mod client;
mod local;
mod source;
mod types;

pub use client::RemoteCatalog;
pub use local::SqliteCatalog;
pub use source::{FetchError, FetchResponse, LocalFetch, RemoteFetch};
pub use types::{FilterCriteria, Page, QueryKey, Record, DEFAULT_PAGE_SIZE};

#[cfg(test)]
pub(crate) use types::record;
