//! Delta sync on reconnect.
//!
//! [`DeltaSyncTrigger`] listens for offline→online edges and runs one
//! reconciliation per edge, never two at once.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::catalog::{RemoteCatalog, SqliteCatalog};
use crate::connectivity::{ConnectivityMonitor, Subscription};

/// Brings local state up to date with the remote. Must be idempotent.
pub trait Reconciler: Send + Sync + 'static {
  fn run_delta_sync(&self) -> BoxFuture<'_, Result<()>>;
}

struct TriggerState {
  running: AtomicBool,
  completed: AtomicU64,
  skipped: AtomicU64,
}

/// Held by a running reconciliation; releases the in-flight flag on drop,
/// including when the reconciler panics.
struct RunGuard(Arc<TriggerState>);

impl Drop for RunGuard {
  fn drop(&mut self) {
    self.0.running.store(false, Ordering::Release);
    self.0.completed.fetch_add(1, Ordering::Release);
  }
}

/// Runs a [`Reconciler`] on every reconnect. Dropping it unsubscribes.
pub struct DeltaSyncTrigger {
  state: Arc<TriggerState>,
  _subscription: Subscription,
}

impl DeltaSyncTrigger {
  /// Subscribe to `monitor`'s edges. Must be called within a tokio runtime.
  pub fn start(monitor: &ConnectivityMonitor, reconciler: Arc<dyn Reconciler>) -> Result<Self> {
    let runtime = Handle::try_current().map_err(|e| eyre!("No tokio runtime: {}", e))?;
    let state = Arc::new(TriggerState {
      running: AtomicBool::new(false),
      completed: AtomicU64::new(0),
      skipped: AtomicU64::new(0),
    });

    let edge_state = Arc::clone(&state);
    let subscription = monitor.subscribe_edges(move |edge| {
      if edge_state
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        edge_state.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(at = %edge.at, "delta sync already running, edge dropped");
        return;
      }

      let state = Arc::clone(&edge_state);
      let reconciler = Arc::clone(&reconciler);
      runtime.spawn(async move {
        let _guard = RunGuard(state);
        tracing::info!(at = %edge.at, "starting delta sync");
        match reconciler.run_delta_sync().await {
          Ok(()) => tracing::info!("delta sync finished"),
          Err(e) => tracing::warn!(error = %e, "delta sync failed"),
        }
      });
    });

    Ok(Self {
      state,
      _subscription: subscription,
    })
  }

  /// Reconciliations finished so far, successful or not.
  pub fn run_count(&self) -> u64 {
    self.state.completed.load(Ordering::Acquire)
  }

  /// Edges dropped because a reconciliation was already running.
  pub fn skipped_count(&self) -> u64 {
    self.state.skipped.load(Ordering::Relaxed)
  }

  pub fn is_running(&self) -> bool {
    self.state.running.load(Ordering::Acquire)
  }
}

/// Pulls remote changes newer than the local watermark into the local catalog.
#[derive(Clone)]
pub struct CatalogDeltaSync {
  remote: RemoteCatalog,
  local: SqliteCatalog,
}

impl CatalogDeltaSync {
  pub fn new(remote: RemoteCatalog, local: SqliteCatalog) -> Self {
    Self { remote, local }
  }

  /// Run one reconciliation. Returns the number of records written.
  pub async fn sync_now(&self) -> Result<usize> {
    let local = self.local.clone();
    let since = tokio::task::spawn_blocking(move || local.max_updated_at())
      .await
      .map_err(|e| eyre!("Watermark task failed: {}", e))??;

    let records = self.remote.fetch_updated_since(since.as_deref()).await?;
    if records.is_empty() {
      tracing::debug!(since = ?since, "local catalog already current");
      return Ok(0);
    }

    let local = self.local.clone();
    let written = tokio::task::spawn_blocking(move || local.upsert(&records))
      .await
      .map_err(|e| eyre!("Upsert task failed: {}", e))??;

    tracing::info!(written, since = ?since, "local catalog updated");
    Ok(written)
  }
}

impl Reconciler for CatalogDeltaSync {
  fn run_delta_sync(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { self.sync_now().await.map(|_| ()) })
  }
}
