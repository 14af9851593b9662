//! Platform connectivity signals.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

/// Callback receiving each raw online/offline reading.
pub type SignalCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Detaches a registration when called.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// Source of raw connectivity readings from the host platform.
///
/// Delivery is best effort: readings may repeat or be skipped.
pub trait ConnectivitySignal: Send + Sync {
  /// Register `callback` for future readings.
  fn on_change(&self, callback: SignalCallback) -> Disposer;

  /// Reading available before the first callback, if the platform has one.
  fn current(&self) -> Option<bool> {
    None
  }
}

#[derive(Default)]
struct ManualInner {
  next_id: u64,
  callbacks: Vec<(u64, SignalCallback)>,
  last: Option<bool>,
}

/// Signal driven by explicit [`ManualSignal::set`] calls.
///
/// Used by hosts that receive connectivity events from elsewhere (an OS
/// notification, an embedding application) and in tests.
#[derive(Clone, Default)]
pub struct ManualSignal {
  inner: Arc<Mutex<ManualInner>>,
}

impl ManualSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver a reading to every registered callback.
  pub fn set(&self, online: bool) {
    let callbacks: Vec<SignalCallback> = {
      let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      inner.last = Some(online);
      inner.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    };

    for callback in callbacks {
      callback(online);
    }
  }

  /// Number of live registrations.
  pub fn registrations(&self) -> usize {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .callbacks
      .len()
  }
}

impl ConnectivitySignal for ManualSignal {
  fn on_change(&self, callback: SignalCallback) -> Disposer {
    let id = {
      let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      let id = inner.next_id;
      inner.next_id += 1;
      inner.callbacks.push((id, callback));
      id
    };

    let inner = Arc::clone(&self.inner);
    Box::new(move || {
      let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
      inner.callbacks.retain(|(cb_id, _)| *cb_id != id);
    })
  }

  fn current(&self) -> Option<bool> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner).last
  }
}

/// Signal that periodically checks TCP reachability of a host.
#[derive(Debug, Clone)]
pub struct ProbeSignal {
  host: String,
  port: u16,
  interval: Duration,
  timeout: Duration,
}

impl ProbeSignal {
  pub fn new(host: impl Into<String>, port: u16, interval: Duration) -> Self {
    Self {
      host: host.into(),
      port,
      interval,
      timeout: Duration::from_secs(3),
    }
  }

  /// Probe the host serving `url` (the catalog API).
  pub fn for_url(url: &Url, interval: Duration) -> Option<Self> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(Self::new(host, port, interval))
  }

  async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let connect = tokio::net::TcpStream::connect((host, port));
    match tokio::time::timeout(timeout, connect).await {
      Ok(Ok(stream)) => {
        let peer: Option<SocketAddr> = stream.peer_addr().ok();
        tracing::trace!(?peer, "connectivity probe succeeded");
        true
      }
      Ok(Err(e)) => {
        tracing::trace!(error = %e, "connectivity probe failed");
        false
      }
      Err(_) => false,
    }
  }
}

impl ConnectivitySignal for ProbeSignal {
  fn on_change(&self, callback: SignalCallback) -> Disposer {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      tracing::warn!("no async runtime, connectivity probe disabled");
      return Box::new(|| {});
    };

    let probe = self.clone();
    let task = runtime.spawn(async move {
      let mut ticker = tokio::time::interval(probe.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = Self::probe(&probe.host, probe.port, probe.timeout).await;
        callback(online);
      }
    });

    Box::new(move || task.abort())
  }
}
