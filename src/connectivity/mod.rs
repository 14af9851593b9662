//! Process-wide online/offline state with edge detection.
//!
//! A [`ConnectivityMonitor`] holds the single platform registration and fans
//! readings out to two listener sets: plain online/offline listeners, and
//! [`SyncEdge`] listeners that fire only on a literal offline→online
//! transition.

mod signal;

pub use signal::{ConnectivitySignal, Disposer, ManualSignal, ProbeSignal, SignalCallback};

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

type OnlineListener = Arc<dyn Fn(bool) + Send + Sync>;
type EdgeListener = Arc<dyn Fn(SyncEdge) + Send + Sync>;

/// Observed connectivity. `None` means not yet observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: Option<bool>,
  pub previous_online: Option<bool>,
}

/// A detected offline→online transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEdge {
  pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Listeners {
  next_id: u64,
  online: Vec<(u64, OnlineListener)>,
  edges: Vec<(u64, EdgeListener)>,
}

struct Inner {
  state: Mutex<ConnectivityState>,
  listeners: Mutex<Listeners>,
  platform: Mutex<Option<Disposer>>,
  /// Serializes reading processing so edges are evaluated in order
  signal_lock: Mutex<()>,
}

impl Inner {
  fn handle_reading(&self, online: bool) {
    let _guard = self.signal_lock.lock().unwrap_or_else(PoisonError::into_inner);

    let (is_edge, changed) = {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      let changed = state.is_online != Some(online);
      state.is_online = Some(online);
      (state.previous_online == Some(false) && online, changed)
    };

    if is_edge {
      tracing::info!("connectivity restored");
      let edge = SyncEdge { at: Utc::now() };
      for listener in self.edge_listeners() {
        listener(edge);
      }
    }

    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .previous_online = Some(online);

    if changed {
      tracing::debug!(online, "connectivity changed");
      for listener in self.online_listeners() {
        listener(online);
      }
    }
  }

  fn online_listeners(&self) -> Vec<OnlineListener> {
    let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.online.iter().map(|(_, l)| Arc::clone(l)).collect()
  }

  fn edge_listeners(&self) -> Vec<EdgeListener> {
    let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.edges.iter().map(|(_, l)| Arc::clone(l)).collect()
  }

  fn detach_platform(&self) {
    let disposer = self
      .platform
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(dispose) = disposer {
      dispose();
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.detach_platform();
  }
}

/// Shared handle to the connectivity state.
///
/// Cloning is cheap; all clones observe the same state. The platform
/// registration is released on [`ConnectivityMonitor::shutdown`] or when the
/// last clone is dropped.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  /// Register with `signal` and start tracking its readings.
  pub fn start(signal: &dyn ConnectivitySignal) -> Self {
    // The platform's initial reading counts as observed, so booting offline
    // still yields an edge on the first online reading
    let initial = signal.current();
    let inner = Arc::new(Inner {
      state: Mutex::new(ConnectivityState {
        is_online: initial,
        previous_online: initial,
      }),
      listeners: Mutex::new(Listeners::default()),
      platform: Mutex::new(None),
      signal_lock: Mutex::new(()),
    });

    let weak = Arc::downgrade(&inner);
    let disposer = signal.on_change(Arc::new(move |online| {
      if let Some(inner) = weak.upgrade() {
        inner.handle_reading(online);
      }
    }));
    *inner.platform.lock().unwrap_or_else(PoisonError::into_inner) = Some(disposer);

    Self { inner }
  }

  /// Current connectivity. Unknown reads as online.
  pub fn is_online(&self) -> bool {
    self.state().is_online.unwrap_or(true)
  }

  pub fn state(&self) -> ConnectivityState {
    *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Wait up to `timeout` for the first reading. Returns the reading, or
  /// `None` if connectivity is still unknown.
  pub async fn wait_for_reading(&self, timeout: Duration) -> Option<bool> {
    if let Some(online) = self.state().is_online {
      return Some(online);
    }

    let notify = Arc::new(Notify::new());
    let waker = Arc::clone(&notify);
    let _sub = self.subscribe(move |_| waker.notify_one());

    // A reading may have landed before the listener was registered
    if let Some(online) = self.state().is_online {
      return Some(online);
    }

    if tokio::time::timeout(timeout, notify.notified()).await.is_err() {
      tracing::debug!(?timeout, "no connectivity reading yet");
    }
    self.state().is_online
  }

  /// Call `callback` with the new value whenever connectivity changes.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let mut listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners.online.push((id, Arc::new(callback)));

    Subscription {
      inner: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Call `callback` on every offline→online transition.
  pub fn subscribe_edges<F>(&self, callback: F) -> Subscription
  where
    F: Fn(SyncEdge) + Send + Sync + 'static,
  {
    let mut listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let id = listeners.next_id;
    listeners.next_id += 1;
    listeners.edges.push((id, Arc::new(callback)));

    Subscription {
      inner: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Number of live listeners across both sets.
  pub fn listener_count(&self) -> usize {
    let listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.online.len() + listeners.edges.len()
  }

  /// Release the platform registration and drop all listeners.
  pub fn shutdown(&self) {
    self.inner.detach_platform();
    let mut listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.online.clear();
    listeners.edges.clear();
  }
}

/// Listener registration; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  inner: Weak<Inner>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      let mut listeners = inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
      listeners.online.retain(|(id, _)| *id != self.id);
      listeners.edges.retain(|(id, _)| *id != self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn count_edges(monitor: &ConnectivityMonitor) -> (Subscription, Arc<AtomicUsize>) {
    let edges = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&edges);
    let sub = monitor.subscribe_edges(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    (sub, edges)
  }

  #[test]
  fn test_false_then_true_is_one_edge() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);

    for online in [true, false, true] {
      signal.set(online);
    }

    assert_eq!(edges.load(Ordering::SeqCst), 1);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_steady_online_has_no_edges() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);

    for _ in 0..3 {
      signal.set(true);
    }

    assert_eq!(edges.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_unknown_is_never_a_transition() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);

    assert_eq!(monitor.state(), ConnectivityState::default());
    assert!(monitor.is_online());

    signal.set(true);
    assert_eq!(edges.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_repeated_offline_readings_yield_single_edge() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);

    for online in [false, false, false, true, true, false, true] {
      signal.set(online);
    }

    assert_eq!(edges.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_edge_precedes_online_notification() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let log = Arc::new(Mutex::new(Vec::new()));

    let edge_log = Arc::clone(&log);
    let _edges = monitor.subscribe_edges(move |_| edge_log.lock().unwrap().push("edge"));
    let online_log = Arc::clone(&log);
    let _online = monitor.subscribe(move |online| {
      online_log
        .lock()
        .unwrap()
        .push(if online { "online" } else { "offline" });
    });

    signal.set(false);
    signal.set(true);

    assert_eq!(*log.lock().unwrap(), vec!["offline", "edge", "online"]);
  }

  #[test]
  fn test_duplicate_readings_do_not_notify() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _sub = monitor.subscribe(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    signal.set(false);
    signal.set(false);
    signal.set(true);
    signal.set(true);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_single_platform_registration() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);

    let subs: Vec<_> = (0..5).map(|_| monitor.subscribe(|_| {})).collect();
    let (_edge_sub, _) = count_edges(&monitor);

    assert_eq!(signal.registrations(), 1);
    assert_eq!(monitor.listener_count(), 6);

    drop(subs);
    assert_eq!(monitor.listener_count(), 1);
  }

  #[test]
  fn test_unsubscribe_stops_delivery() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);
    let (sub, edges) = count_edges(&monitor);

    signal.set(false);
    sub.unsubscribe();
    signal.set(true);

    assert_eq!(edges.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_shutdown_and_drop_release_platform() {
    let signal = ManualSignal::new();

    let monitor = ConnectivityMonitor::start(&signal);
    monitor.shutdown();
    assert_eq!(signal.registrations(), 0);

    let monitor = ConnectivityMonitor::start(&signal);
    let clone = monitor.clone();
    drop(monitor);
    assert_eq!(signal.registrations(), 1);
    drop(clone);
    assert_eq!(signal.registrations(), 0);
  }

  #[test]
  fn test_initial_reading_from_platform() {
    let signal = ManualSignal::new();
    signal.set(false);

    let monitor = ConnectivityMonitor::start(&signal);
    assert!(!monitor.is_online());
    assert_eq!(monitor.state().previous_online, Some(false));
  }

  #[test]
  fn test_boot_offline_then_online_is_an_edge() {
    let signal = ManualSignal::new();
    signal.set(false);

    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);
    signal.set(true);

    assert_eq!(edges.load(Ordering::SeqCst), 1);
    assert_eq!(
      monitor.state(),
      ConnectivityState {
        is_online: Some(true),
        previous_online: Some(true),
      }
    );
  }

  #[test]
  fn test_boot_online_then_online_is_not_an_edge() {
    let signal = ManualSignal::new();
    signal.set(true);

    let monitor = ConnectivityMonitor::start(&signal);
    let (_sub, edges) = count_edges(&monitor);
    signal.set(true);

    assert_eq!(edges.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_wait_for_reading_returns_known_state() {
    let signal = ManualSignal::new();
    signal.set(false);
    let monitor = ConnectivityMonitor::start(&signal);

    assert_eq!(monitor.wait_for_reading(Duration::from_secs(1)).await, Some(false));
  }

  #[tokio::test(start_paused = true)]
  async fn test_wait_for_reading_sees_late_reading() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);

    let late = signal.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      late.set(false);
    });

    let start = tokio::time::Instant::now();
    assert_eq!(monitor.wait_for_reading(Duration::from_secs(5)).await, Some(false));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(monitor.listener_count(), 0);
  }

  #[tokio::test]
  async fn test_probe_of_closed_port_reads_offline() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let probe = ProbeSignal::new("127.0.0.1", port, Duration::from_secs(60));
    let monitor = ConnectivityMonitor::start(&probe);

    assert_eq!(monitor.wait_for_reading(Duration::from_secs(4)).await, Some(false));
    assert!(!monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_wait_for_reading_times_out_when_silent() {
    let signal = ManualSignal::new();
    let monitor = ConnectivityMonitor::start(&signal);

    assert_eq!(monitor.wait_for_reading(Duration::from_secs(4)).await, None);
    assert!(monitor.is_online());
  }
}
