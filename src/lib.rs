//! Connectivity-aware query cache and delta sync for a strain catalog.
//!
//! Pages of filtered catalog queries are served from the remote API while
//! online and from a local SQLite mirror while offline, through one
//! [`QueryCoordinator`](coordinator::QueryCoordinator) that coalesces
//! identical requests and persists results across restarts. Reconnects
//! trigger a delta sync of the local mirror.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod debounce;
pub mod logging;
pub mod pagination;
pub mod query;
pub mod sync;
