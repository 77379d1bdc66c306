//! Mutation coordinator.
//!
//! Single owner of the optimistic cache and the offline queue. Every
//! mutation goes through [`SyncCoordinator::submit`], which decides between
//! the direct path (optimistic patch, send, commit or rollback) and the
//! offline path (optimistic patch, persist intent, replay on reconnect).
//!
//! Per-mutation state machine:
//!
//! ```text
//! Pending -> InFlight -> Confirmed | RolledBack
//!         -> Queued   -> InFlight  -> Confirmed | Dropped
//! ```
//!
//! Retry exhaustion on a direct attempt is a rollback, not a demotion to
//! the queue. Only mutations submitted while offline get queued; an online
//! failure should be visible immediately rather than leave the UI stale
//! behind a silent retry loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::transport::{ApiRequest, Method, Transport};
use crate::cache::{OptimisticCache, Patch};
use crate::queue::{OfflineQueue, ReplayOutcome};
use crate::sync::connectivity::ConnectivityMonitor;

/// User-visible pipeline notifications, in the spirit of a toast feed.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  Offline,
  Online { pending: usize },
  /// A mutation was persisted for later replay.
  Queued {
    id: String,
    method: Method,
    endpoint: String,
  },
  /// A queued mutation was successfully replayed.
  Replayed { id: String, endpoint: String },
  /// A queued mutation was dropped after its retry maximum.
  Dropped {
    id: String,
    endpoint: String,
    reason: String,
  },
  /// A direct mutation failed terminally and its optimistic state was
  /// reverted.
  RolledBack { endpoint: String, reason: String },
  DrainFinished(DrainSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
  pub replayed: usize,
  pub kept: usize,
  pub dropped: usize,
}

/// How a submitted mutation resolved from the caller's point of view.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
  /// The server confirmed; the payload is its authoritative response.
  Confirmed(Value),
  /// Submitted while offline; the intent is durably queued and the
  /// optimistic state stands until a drain settles it.
  Queued { id: String },
}

#[derive(Clone)]
pub struct SyncCoordinator {
  transport: Arc<dyn Transport>,
  queue: Arc<OfflineQueue>,
  cache: OptimisticCache,
  monitor: ConnectivityMonitor,
  events: mpsc::UnboundedSender<SyncEvent>,
  submissions: Arc<AtomicU64>,
}

impl SyncCoordinator {
  pub fn new(
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    cache: OptimisticCache,
    monitor: ConnectivityMonitor,
  ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Self {
        transport,
        queue,
        cache,
        monitor,
        events: tx,
        submissions: Arc::new(AtomicU64::new(0)),
      },
      rx,
    )
  }

  pub fn cache(&self) -> &OptimisticCache {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  /// Seed the cache with an authoritative value from a read response.
  pub fn refresh(&self, key: &str, value: Value) {
    self.cache.commit(key, value);
  }

  /// Submit a mutation.
  ///
  /// The optimistic patch is applied before any network activity either
  /// way; what differs is whether the intent goes to the transport now or
  /// to the durable queue for later.
  pub async fn submit(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<Value>,
  ) -> Result<MutationOutcome> {
    if !self.monitor.is_online() {
      let intent = self.queue.enqueue(method, endpoint, body)?;
      let key = optimistic_key(method, endpoint, &intent.id);
      self.cache.apply_optimistic(&key, &patch_for(method, intent.data.as_ref()));
      self.emit(SyncEvent::Queued {
        id: intent.id.clone(),
        method,
        endpoint: endpoint.to_string(),
      });
      return Ok(MutationOutcome::Queued { id: intent.id });
    }

    let submission = self.submissions.fetch_add(1, Ordering::SeqCst);
    let key = optimistic_key(method, endpoint, &format!("pending_{submission}"));
    let snapshot = self.cache.apply_optimistic(&key, &patch_for(method, body.as_ref()));

    let request = ApiRequest::new(method, endpoint, body);
    match self.transport.send(&request).await {
      Ok(response) => {
        self.reconcile_confirmed(method, endpoint, &key, &response);
        Ok(MutationOutcome::Confirmed(response))
      }
      Err(err) => {
        self.cache.rollback(snapshot);
        tracing::warn!(%method, endpoint, "mutation failed, rolled back: {err}");
        self.emit(SyncEvent::RolledBack {
          endpoint: endpoint.to_string(),
          reason: err.to_string(),
        });
        Err(err.into())
      }
    }
  }

  /// Replay the offline queue and reconcile the cache per intent.
  pub async fn drain(&self) -> Result<DrainSummary> {
    let transport = self.transport.clone();
    let outcomes = self
      .queue
      .drain(move |intent| {
        let transport = transport.clone();
        async move {
          let request = intent.request();
          transport.send(&request).await
        }
      })
      .await?;

    let mut summary = DrainSummary::default();
    for outcome in outcomes {
      match outcome {
        ReplayOutcome::Replayed { intent, response } => {
          let key = optimistic_key(intent.method, &intent.endpoint, &intent.id);
          self.reconcile_confirmed(intent.method, &intent.endpoint, &key, &response);
          self.emit(SyncEvent::Replayed {
            id: intent.id,
            endpoint: intent.endpoint,
          });
          summary.replayed += 1;
        }
        ReplayOutcome::Kept { .. } => {
          // Optimistic overlay stands; a later drain will try again.
          summary.kept += 1;
        }
        ReplayOutcome::Dropped { intent, error } => {
          let key = optimistic_key(intent.method, &intent.endpoint, &intent.id);
          self.cache.invalidate(&key);
          self.emit(SyncEvent::Dropped {
            id: intent.id,
            endpoint: intent.endpoint,
            reason: error.to_string(),
          });
          summary.dropped += 1;
        }
      }
    }

    if summary != DrainSummary::default() {
      self.emit(SyncEvent::DrainFinished(summary));
    }
    Ok(summary)
  }

  /// Watch connectivity and drain once per offline→online transition.
  ///
  /// Meant for long-lived processes. One-shot invocations skip this and
  /// settle the queue directly: flip the monitor online, call [`drain`].
  ///
  /// [`drain`]: SyncCoordinator::drain
  pub fn spawn_reconnect_listener(&self) -> tokio::task::JoinHandle<()> {
    let coordinator = self.clone();
    let mut sub = self.monitor.subscribe();
    tokio::spawn(async move {
      while let Some(online) = sub.changed().await {
        if online {
          let pending = coordinator.queue.len().unwrap_or(0);
          coordinator.emit(SyncEvent::Online { pending });
          if let Err(e) = coordinator.drain().await {
            tracing::error!("drain after reconnect failed: {e}");
          }
        } else {
          coordinator.emit(SyncEvent::Offline);
        }
      }
    })
  }

  /// Fold the authoritative response back into the cache.
  fn reconcile_confirmed(&self, method: Method, endpoint: &str, key: &str, response: &Value) {
    match method {
      Method::Delete => self.cache.commit_remove(key),
      Method::Post => {
        // The optimistic entry lived under a temporary key; move it to the
        // server-assigned identity.
        self.cache.invalidate(key);
        let entity = unwrap_entity(response);
        if let Some(id) = entity.get("id").and_then(Value::as_str) {
          let collection = collection_for(endpoint);
          self.cache.commit(&format!("{collection}/{id}"), entity.clone());
        } else {
          tracing::debug!(endpoint, "create response carries no id, cache not seeded");
        }
      }
      _ => self.cache.commit(key, unwrap_entity(response).clone()),
    }
  }

  fn emit(&self, event: SyncEvent) {
    // Nobody listening is fine
    let _ = self.events.send(event);
  }
}

/// Cache key for a mutation's optimistic entry. Updates and deletes target
/// the resource path itself; creates get a temporary key until the server
/// assigns an id.
fn optimistic_key(method: Method, endpoint: &str, submission_id: &str) -> String {
  match method {
    Method::Post => format!("{endpoint}#{submission_id}"),
    _ => endpoint.to_string(),
  }
}

/// Collection a created entity is cached under. Most creates post to the
/// collection itself, but converting a note posts to `/notes/{id}/convert`
/// and the entity that comes back is a task.
fn collection_for(endpoint: &str) -> &str {
  if endpoint.ends_with("/convert") {
    "/tasks"
  } else {
    endpoint
  }
}

fn patch_for(method: Method, body: Option<&Value>) -> Patch {
  let payload = body.cloned().unwrap_or_else(|| Value::Object(Default::default()));
  match method {
    Method::Post => Patch::Replace(payload),
    Method::Delete => Patch::Remove,
    _ => Patch::Merge(payload),
  }
}

/// Servers wrap some create responses in an envelope like `{"note": {...}}`.
/// Unwrap a single-key envelope whose inner object has an id; otherwise the
/// response already is the entity.
fn unwrap_entity(response: &Value) -> &Value {
  if let Some(obj) = response.as_object() {
    if !obj.contains_key("id") && obj.len() == 1 {
      if let Some(inner) = obj.values().next() {
        if inner.get("id").is_some() {
          return inner;
        }
      }
    }
  }
  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::error::ApiError;
  use crate::api::transport::{send_with_retry, Backoff, BoxFuture, RetryPolicy};
  use crate::db::Database;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use std::time::Duration;

  /// Transport that serves scripted responses and logs every request, with
  /// the same bounded retry the real transport applies.
  struct FakeTransport {
    responses: Mutex<VecDeque<Result<Value, ApiError>>>,
    log: Mutex<Vec<(Method, String, Option<Value>)>>,
    policy: RetryPolicy,
  }

  impl FakeTransport {
    fn new(responses: Vec<Result<Value, ApiError>>) -> Arc<Self> {
      Arc::new(Self {
        responses: Mutex::new(responses.into_iter().collect()),
        log: Mutex::new(Vec::new()),
        policy: RetryPolicy {
          max_attempts: 3,
          delay: Duration::ZERO,
          backoff: Backoff::Fixed,
        },
      })
    }

    fn requests(&self) -> Vec<(Method, String, Option<Value>)> {
      self.log.lock().unwrap().clone()
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<Value, ApiError> {
      self.log.lock().unwrap().push((
        request.method,
        request.endpoint.clone(),
        request.body.clone(),
      ));
      self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(ApiError::Network("no scripted response".into())))
    }
  }

  impl Transport for FakeTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<Value, ApiError>> {
      Box::pin(async move { send_with_retry(&self.policy, || self.send_once(request)).await })
    }
  }

  fn pipeline(
    transport: Arc<FakeTransport>,
    online: bool,
  ) -> (SyncCoordinator, mpsc::UnboundedReceiver<SyncEvent>) {
    let db = Database::open_in_memory().unwrap();
    let queue = Arc::new(OfflineQueue::new(db));
    let cache = OptimisticCache::new();
    let monitor = ConnectivityMonitor::new(online);
    SyncCoordinator::new(transport, queue, cache, monitor)
  }

  fn http_503() -> ApiError {
    ApiError::Http {
      status: 503,
      message: "Service Unavailable".into(),
      code: None,
    }
  }

  // Scenario A: online update confirms and commits the server response.
  #[tokio::test]
  async fn test_online_update_commits_authoritative_response() {
    let server_task = json!({"id": "T1", "title": "Ship", "status": "done", "updatedAt": "2026-08-29T10:00:00Z"});
    let transport = FakeTransport::new(vec![Ok(server_task.clone())]);
    let (coordinator, _events) = pipeline(transport.clone(), true);
    coordinator.refresh("/tasks/T1", json!({"id": "T1", "title": "Ship", "status": "todo"}));

    let outcome = coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Confirmed(_)));
    assert_eq!(coordinator.cache().read("/tasks/T1"), Some(server_task));
    assert!(!coordinator.cache().is_pending("/tasks/T1"));
    assert!(coordinator.queue().is_empty().unwrap());
  }

  // Scenario B: offline update queues the intent, cache shows the patch
  // before any network activity.
  #[tokio::test]
  async fn test_offline_update_queues_and_applies_optimistically() {
    let transport = FakeTransport::new(vec![]);
    let (coordinator, mut events) = pipeline(transport.clone(), false);
    coordinator.refresh("/tasks/T1", json!({"id": "T1", "status": "todo"}));

    let outcome = coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Queued { .. }));
    let intents = coordinator.queue().peek_all().unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].method, Method::Patch);
    assert_eq!(intents[0].endpoint, "/tasks/T1");
    assert_eq!(intents[0].data, Some(json!({"status": "done"})));

    assert_eq!(
      coordinator.cache().read("/tasks/T1"),
      Some(json!({"id": "T1", "status": "done"}))
    );
    assert!(transport.requests().is_empty());
    assert!(matches!(events.try_recv(), Ok(SyncEvent::Queued { .. })));
  }

  // Scenario C: reconnect drains the queue; the replayed mutation commits.
  #[tokio::test]
  async fn test_reconnect_drains_queue_and_confirms_cache() {
    let server_task = json!({"id": "T1", "status": "done"});
    let transport = FakeTransport::new(vec![Ok(server_task.clone())]);
    let (coordinator, _events) = pipeline(transport.clone(), false);

    coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await
      .unwrap();
    assert!(coordinator.cache().is_pending("/tasks/T1"));

    let listener = coordinator.spawn_reconnect_listener();
    coordinator.monitor().set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(coordinator.queue().is_empty().unwrap());
    assert_eq!(coordinator.cache().read("/tasks/T1"), Some(server_task));
    assert!(!coordinator.cache().is_pending("/tasks/T1"));

    listener.abort();
  }

  // Scenario D: three 503s with budget 3 is a terminal failure; rollback,
  // no queueing.
  #[tokio::test]
  async fn test_online_retry_exhaustion_rolls_back_and_does_not_queue() {
    let transport =
      FakeTransport::new(vec![Err(http_503()), Err(http_503()), Err(http_503())]);
    let (coordinator, mut events) = pipeline(transport.clone(), true);
    let original = json!({"id": "T2", "status": "todo"});
    coordinator.refresh("/tasks/T2", original.clone());

    let result = coordinator
      .submit(Method::Patch, "/tasks/T2", Some(json!({"status": "done"})))
      .await;

    assert!(result.is_err());
    assert_eq!(transport.requests().len(), 3);
    assert_eq!(coordinator.cache().read("/tasks/T2"), Some(original));
    assert!(coordinator.queue().is_empty().unwrap());

    // Skip the initial Online-free feed until the rollback notification
    let mut saw_rollback = false;
    while let Ok(event) = events.try_recv() {
      if matches!(event, SyncEvent::RolledBack { .. }) {
        saw_rollback = true;
      }
    }
    assert!(saw_rollback);
  }

  #[tokio::test]
  async fn test_client_error_rolls_back_without_retry() {
    let transport = FakeTransport::new(vec![Err(ApiError::Http {
      status: 404,
      message: "Not Found".into(),
      code: None,
    })]);
    let (coordinator, _events) = pipeline(transport.clone(), true);
    coordinator.refresh("/tasks/T1", json!({"id": "T1", "status": "todo"}));

    let result = coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await;

    assert!(result.is_err());
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(
      coordinator.cache().read("/tasks/T1"),
      Some(json!({"id": "T1", "status": "todo"}))
    );
  }

  #[tokio::test]
  async fn test_drain_replays_in_submission_order() {
    let transport = FakeTransport::new(vec![
      Ok(json!({"id": "n1"})),
      Ok(json!({"id": "T1", "status": "in-progress"})),
      Ok(json!({"id": "T1", "status": "done"})),
    ]);
    let (coordinator, _events) = pipeline(transport.clone(), false);

    coordinator
      .submit(Method::Post, "/notes", Some(json!({"content": "a"})))
      .await
      .unwrap();
    coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "in-progress"})))
      .await
      .unwrap();
    coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await
      .unwrap();

    let summary = {
      coordinator.monitor().set_online(true);
      coordinator.drain().await.unwrap()
    };

    assert_eq!(summary.replayed, 3);
    let endpoints: Vec<String> = transport
      .requests()
      .into_iter()
      .map(|(_, endpoint, _)| endpoint)
      .collect();
    assert_eq!(endpoints, vec!["/notes", "/tasks/T1", "/tasks/T1"]);
    // Last submitted status wins in the cache
    assert_eq!(
      coordinator.cache().read("/tasks/T1"),
      Some(json!({"id": "T1", "status": "done"}))
    );
  }

  #[tokio::test]
  async fn test_queued_create_moves_to_server_assigned_key() {
    let transport = FakeTransport::new(vec![Ok(json!({"note": {"id": "n9", "content": "hi"}}))]);
    let (coordinator, _events) = pipeline(transport.clone(), false);

    coordinator
      .submit(Method::Post, "/notes", Some(json!({"content": "hi"})))
      .await
      .unwrap();

    // The optimistic create is readable under its temporary key
    let intents = coordinator.queue().peek_all().unwrap();
    let temp_key = format!("/notes#{}", intents[0].id);
    assert_eq!(coordinator.cache().read(&temp_key), Some(json!({"content": "hi"})));

    coordinator.monitor().set_online(true);
    coordinator.drain().await.unwrap();

    assert_eq!(coordinator.cache().read(&temp_key), None);
    assert_eq!(
      coordinator.cache().read("/notes/n9"),
      Some(json!({"id": "n9", "content": "hi"}))
    );
  }

  #[tokio::test]
  async fn test_replayed_note_conversion_commits_task_not_convert_path() {
    let transport =
      FakeTransport::new(vec![Ok(json!({"task": {"id": "t9", "title": "From note"}}))]);
    let (coordinator, _events) = pipeline(transport.clone(), false);

    coordinator
      .submit(Method::Post, "/notes/n1/convert", None)
      .await
      .unwrap();

    coordinator.monitor().set_online(true);
    coordinator.drain().await.unwrap();

    assert_eq!(
      coordinator.cache().read("/tasks/t9"),
      Some(json!({"id": "t9", "title": "From note"}))
    );
    // Nothing lingers under the conversion endpoint itself
    assert_eq!(coordinator.cache().read("/notes/n1/convert/t9"), None);
  }

  #[tokio::test]
  async fn test_dropped_intent_invalidates_cache_and_reports() {
    // Every replay attempt fails terminally at the transport level
    let transport = FakeTransport::new(vec![
      Err(ApiError::Http {
        status: 400,
        message: "Bad Request".into(),
        code: None,
      });
      3
    ]);
    let (coordinator, mut events) = pipeline(transport.clone(), false);

    coordinator
      .submit(Method::Patch, "/tasks/T1", Some(json!({"status": "done"})))
      .await
      .unwrap();
    coordinator.monitor().set_online(true);

    // Drains 1 and 2 keep the intent, drain 3 drops it
    assert_eq!(coordinator.drain().await.unwrap().kept, 1);
    assert_eq!(coordinator.drain().await.unwrap().kept, 1);
    let summary = coordinator.drain().await.unwrap();
    assert_eq!(summary.dropped, 1);

    assert!(coordinator.queue().is_empty().unwrap());
    assert_eq!(coordinator.cache().read("/tasks/T1"), None);

    let mut saw_dropped = false;
    while let Ok(event) = events.try_recv() {
      if let SyncEvent::Dropped { reason, .. } = event {
        assert!(reason.contains("gave up"));
        saw_dropped = true;
      }
    }
    assert!(saw_dropped);
  }

  #[tokio::test]
  async fn test_online_delete_confirms_removal() {
    let transport = FakeTransport::new(vec![Ok(Value::Null)]);
    let (coordinator, _events) = pipeline(transport.clone(), true);
    coordinator.refresh("/notes/n1", json!({"id": "n1", "content": "old"}));

    coordinator
      .submit(Method::Delete, "/notes/n1", None)
      .await
      .unwrap();

    assert_eq!(coordinator.cache().read("/notes/n1"), None);
    assert_eq!(transport.requests().len(), 1);
  }

  #[test]
  fn test_unwrap_entity_handles_envelope_and_bare_forms() {
    let bare = json!({"id": "t1", "title": "x"});
    assert_eq!(unwrap_entity(&bare), &bare);

    let enveloped = json!({"note": {"id": "n1", "content": "x"}});
    assert_eq!(unwrap_entity(&enveloped), &json!({"id": "n1", "content": "x"}));

    let no_id = json!({"items": []});
    assert_eq!(unwrap_entity(&no_id), &no_id);
  }
}
