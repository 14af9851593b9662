//! Cancellable debounce timer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

type ApplyFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Delays values until input has been quiet for a fixed window.
///
/// Each [`Debouncer::push`] cancels the pending timer and starts a new one;
/// only the last value pushed within a quiet window reaches the callback.
/// Dropping the debouncer cancels any pending timer.
pub struct Debouncer<T> {
  quiet: Duration,
  apply: ApplyFn<T>,
  pending: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Debouncer<T> {
  pub fn new<F>(quiet: Duration, apply: F) -> Self
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    Self {
      quiet,
      apply: Arc::new(apply),
      pending: Mutex::new(None),
    }
  }

  /// Restart the timer with `value`. Must be called within a tokio runtime.
  pub fn push(&self, value: T) {
    let apply = Arc::clone(&self.apply);
    let quiet = self.quiet;

    let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(previous) = pending.take() {
      previous.abort();
    }

    *pending = Some(tokio::spawn(async move {
      tokio::time::sleep(quiet).await;
      apply(value);
    }));
  }

  /// Apply `value` now, discarding any pending one.
  pub fn flush(&self, value: T) {
    self.cancel();
    (self.apply)(value);
  }

  /// Drop the pending value, if any.
  pub fn cancel(&self) {
    let pending = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = pending {
      handle.abort();
    }
  }

  /// Whether a value is waiting for its quiet window to elapse.
  pub fn is_pending(&self) -> bool {
    self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }
}

impl<T> Drop for Debouncer<T> {
  fn drop(&mut self) {
    let pending = self
      .pending
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = pending {
      handle.abort();
    }
  }
}
