//! In-memory optimistic cache.
//!
//! Keyed last-known entity states, mutated speculatively before the server
//! confirms. Every write happens under one lock, so readers see either the
//! state before a patch or the state after it, never a torn middle. The
//! cache is process-local; only the offline queue survives restarts.
//!
//! Writes come exclusively from the sync coordinator. Everyone else reads
//! via [`OptimisticCache::read`] or a [`CacheSubscription`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

/// A speculative change to one cache entry.
#[derive(Debug, Clone)]
pub enum Patch {
  /// Shallow-merge a partial JSON object into the current value.
  Merge(Value),
  /// Replace the value wholesale (optimistic create).
  Replace(Value),
  /// Remove the entry (optimistic delete).
  Remove,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
  value: Value,
  /// True while an optimistic overlay awaits its remote outcome.
  pending: bool,
}

/// The exact pre-patch state of a key, held by the coordinator until the
/// matching remote outcome is known. Rolling back restores it verbatim.
#[derive(Debug, Clone)]
pub struct Snapshot {
  key: String,
  prior: Option<Entry>,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub key: String,
  /// The new value, or None if the entry was removed.
  pub value: Option<Value>,
}

struct Inner {
  entries: HashMap<String, Entry>,
  subscribers: HashMap<u64, mpsc::UnboundedSender<CacheEvent>>,
  next_subscriber: u64,
}

/// Subscription handle. Dropping it unsubscribes, so a forgotten handle
/// cannot leak a listener past its owner's lifetime.
pub struct CacheSubscription {
  inner: Weak<Mutex<Inner>>,
  id: u64,
}

impl Drop for CacheSubscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      if let Ok(mut inner) = inner.lock() {
        inner.subscribers.remove(&self.id);
      }
    }
  }
}

#[derive(Clone)]
pub struct OptimisticCache {
  inner: Arc<Mutex<Inner>>,
}

impl Default for OptimisticCache {
  fn default() -> Self {
    Self::new()
  }
}

impl OptimisticCache {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: HashMap::new(),
        subscribers: HashMap::new(),
        next_subscriber: 0,
      })),
    }
  }

  /// Current known value for a key, optimistic overlay included.
  pub fn read(&self, key: &str) -> Option<Value> {
    self.lock().entries.get(key).map(|e| e.value.clone())
  }

  /// Whether the key has an optimistic overlay awaiting confirmation.
  pub fn is_pending(&self, key: &str) -> bool {
    self.lock().entries.get(key).is_some_and(|e| e.pending)
  }

  /// Apply a speculative patch and return the pre-patch snapshot.
  ///
  /// A second patch on a key whose overlay is still in flight merges over
  /// the first (last submitted wins); its snapshot then carries the first
  /// overlay, so a later rollback unwinds exactly one patch.
  pub fn apply_optimistic(&self, key: &str, patch: &Patch) -> Snapshot {
    let mut inner = self.lock();
    let prior = inner.entries.get(key).cloned();

    match patch {
      Patch::Merge(partial) => {
        let merged = match prior.as_ref().map(|e| &e.value) {
          Some(current) => shallow_merge(current, partial),
          None => partial.clone(),
        };
        inner.entries.insert(
          key.to_string(),
          Entry {
            value: merged,
            pending: true,
          },
        );
      }
      Patch::Replace(value) => {
        inner.entries.insert(
          key.to_string(),
          Entry {
            value: value.clone(),
            pending: true,
          },
        );
      }
      Patch::Remove => {
        inner.entries.remove(key);
      }
    }

    let value = inner.entries.get(key).map(|e| e.value.clone());
    Self::notify(&mut inner, key, value);

    Snapshot {
      key: key.to_string(),
      prior,
    }
  }

  /// Replace the entry with the authoritative server state, clearing the
  /// pending overlay. Also used to seed the cache from read responses.
  pub fn commit(&self, key: &str, authoritative: Value) {
    let mut inner = self.lock();
    inner.entries.insert(
      key.to_string(),
      Entry {
        value: authoritative.clone(),
        pending: false,
      },
    );
    Self::notify(&mut inner, key, Some(authoritative));
  }

  /// Confirm an optimistic removal: the entry stays gone.
  pub fn commit_remove(&self, key: &str) {
    let mut inner = self.lock();
    if inner.entries.remove(key).is_some() {
      Self::notify(&mut inner, key, None);
    }
  }

  /// Restore the snapshot taken before an optimistic patch. Used only on
  /// terminal failure of the matching remote call.
  pub fn rollback(&self, snapshot: Snapshot) {
    let mut inner = self.lock();
    let value = match snapshot.prior {
      Some(entry) => {
        let value = entry.value.clone();
        inner.entries.insert(snapshot.key.clone(), entry);
        Some(value)
      }
      None => {
        inner.entries.remove(&snapshot.key);
        None
      }
    };
    Self::notify(&mut inner, &snapshot.key, value);
  }

  /// Discard whatever is cached for a key.
  ///
  /// Used when a queued mutation is dropped after its retry maximum: the
  /// pre-patch snapshot is long gone (it may predate a restart), so the
  /// honest move is to forget the speculative state entirely and let the
  /// next read fetch the server's truth.
  pub fn invalidate(&self, key: &str) {
    let mut inner = self.lock();
    if inner.entries.remove(key).is_some() {
      Self::notify(&mut inner, key, None);
    }
  }

  /// Subscribe to change notifications.
  pub fn subscribe(&self) -> (CacheSubscription, mpsc::UnboundedReceiver<CacheEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut inner = self.lock();
    let id = inner.next_subscriber;
    inner.next_subscriber += 1;
    inner.subscribers.insert(id, tx);
    (
      CacheSubscription {
        inner: Arc::downgrade(&self.inner),
        id,
      },
      rx,
    )
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
    // Recover from poisoning: writes are single-assignment under the lock,
    // so a panicked writer cannot leave an entry half-updated.
    self
      .inner
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  fn notify(inner: &mut Inner, key: &str, value: Option<Value>) {
    let event = CacheEvent {
      key: key.to_string(),
      value,
    };
    // Prune subscribers whose receivers are gone
    inner
      .subscribers
      .retain(|_, tx| tx.send(event.clone()).is_ok());
  }
}

/// JS-spread style merge: keys in `patch` win, everything else is kept.
/// Non-object operands fall back to replacement.
fn shallow_merge(current: &Value, patch: &Value) -> Value {
  match (current, patch) {
    (Value::Object(base), Value::Object(overlay)) => {
      let mut merged = base.clone();
      for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
      }
      Value::Object(merged)
    }
    _ => patch.clone(),
  }
}
