//! Online/offline state tracking.

use tokio::sync::watch;

/// Transition-driven connectivity state. Not persisted; a fresh process
/// starts from whatever the caller tells it.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

/// A live view of connectivity transitions. Dropping it cancels the
/// subscription.
pub struct ConnectivitySubscription {
  rx: watch::Receiver<bool>,
}

impl ConnectivitySubscription {
  /// Wait for the next transition and return the new state. Returns None
  /// once the monitor has been dropped.
  pub async fn changed(&mut self) -> Option<bool> {
    self.rx.changed().await.ok()?;
    Some(*self.rx.borrow())
  }

  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a connectivity transition. Setting the current state again is a
  /// no-op and notifies nobody, so a flappy caller cannot double-trigger a
  /// drain.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|state| {
      if *state == online {
        return false;
      }
      if online {
        tracing::info!("connection restored");
      } else {
        tracing::warn!("connection lost, mutations will be queued");
      }
      *state = online;
      true
    });
  }

  pub fn subscribe(&self) -> ConnectivitySubscription {
    ConnectivitySubscription {
      rx: self.tx.subscribe(),
    }
  }
}
