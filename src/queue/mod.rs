//! Durable offline mutation queue.
//!
//! Mutations attempted while disconnected are persisted here and replayed,
//! in submission order, when connectivity returns. Every enqueue and remove
//! is flushed to SQLite synchronously so the queue survives process
//! restarts; nothing else about a pending mutation does.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;

use crate::api::error::ApiError;
use crate::api::transport::{ApiRequest, Method};
use crate::db::Database;

/// Replay attempts per intent before it is dropped for good.
pub const MAX_REPLAY_RETRIES: u32 = 3;

static INTENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A mutation recorded while offline, waiting to be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
  /// Unique, generation-ordered id.
  pub id: String,
  pub method: Method,
  pub endpoint: String,
  pub data: Option<Value>,
  pub timestamp: DateTime<Utc>,
  pub retries: u32,
}

impl MutationIntent {
  /// The request to issue when replaying this intent.
  pub fn request(&self) -> ApiRequest {
    ApiRequest::new(self.method, self.endpoint.clone(), self.data.clone())
  }
}

/// Outcome of one intent during a drain.
#[derive(Debug)]
pub enum ReplayOutcome {
  /// Replay succeeded; the intent was removed from the queue.
  Replayed {
    intent: MutationIntent,
    response: Value,
  },
  /// Replay failed but the intent stays queued for a later drain.
  Kept {
    intent: MutationIntent,
    error: ApiError,
  },
  /// Replay failed at the retry maximum; the intent was dropped.
  Dropped {
    intent: MutationIntent,
    error: ApiError,
  },
}

/// FIFO queue of [`MutationIntent`]s backed by the state database.
pub struct OfflineQueue {
  db: Arc<Database>,
  /// Held for the duration of a drain so two drains cannot interleave.
  drain_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Persist a new intent at the tail of the queue.
  pub fn enqueue(&self, method: Method, endpoint: &str, data: Option<Value>) -> Result<MutationIntent> {
    let timestamp = Utc::now();
    let counter = INTENT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let intent = MutationIntent {
      id: format!("queue_{}_{}", timestamp.timestamp_millis(), counter),
      method,
      endpoint: endpoint.to_string(),
      data,
      timestamp,
      retries: 0,
    };

    let data_json = intent
      .data
      .as_ref()
      .map(|v| serde_json::to_string(v))
      .transpose()
      .map_err(|e| eyre!("Failed to serialize intent data: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO offline_queue (id, method, endpoint, data, timestamp, retries)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          intent.id,
          intent.method.as_str(),
          intent.endpoint,
          data_json,
          intent.timestamp.to_rfc3339(),
          intent.retries,
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    tracing::info!(id = %intent.id, method = %intent.method, endpoint = %intent.endpoint, "queued offline mutation");
    Ok(intent)
  }

  /// All queued intents in enqueue order.
  pub fn peek_all(&self) -> Result<Vec<MutationIntent>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, endpoint, data, timestamp, retries
         FROM offline_queue ORDER BY position",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<String>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, u32>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?;

    let mut intents = Vec::new();
    for row in rows {
      let (id, method, endpoint, data, timestamp, retries) =
        row.map_err(|e| eyre!("Failed to read queue row: {}", e))?;
      intents.push(MutationIntent {
        id,
        method: method
          .parse()
          .map_err(|e| eyre!("Corrupt queue entry: {}", e))?,
        endpoint,
        data: data
          .map(|s| serde_json::from_str(&s))
          .transpose()
          .map_err(|e| eyre!("Corrupt queue entry data: {}", e))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
          .map_err(|e| eyre!("Corrupt queue entry timestamp: {}", e))?
          .with_timezone(&Utc),
        retries,
      });
    }

    Ok(intents)
  }

  /// Remove an intent by id. Removing an already-removed id is a no-op,
  /// which is what makes a retried drain after partial failure safe.
  pub fn remove(&self, id: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued mutation: {}", e))?;
    Ok(())
  }

  /// Number of queued intents.
  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Increment the retry count for an intent, returning the new count.
  fn bump_retries(&self, id: &str) -> Result<u32> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE offline_queue SET retries = retries + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update retry count: {}", e))?;
    conn
      .query_row(
        "SELECT retries FROM offline_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read retry count: {}", e))
  }

  /// Replay every queued intent through `replay`, in enqueue order.
  ///
  /// Per intent: success removes it; failure bumps its retry count and
  /// either keeps it for a later drain or, at [`MAX_REPLAY_RETRIES`], drops
  /// it and reports the permanent failure. Draining an empty queue does
  /// nothing and calls `replay` zero times.
  ///
  /// If a drain is already in progress this call is a no-op. One trigger
  /// per reconnection is all a drain needs, and overlapping drains would
  /// replay intents twice.
  pub async fn drain<F, Fut>(&self, mut replay: F) -> Result<Vec<ReplayOutcome>>
  where
    F: FnMut(MutationIntent) -> Fut,
    Fut: Future<Output = std::result::Result<Value, ApiError>>,
  {
    let _guard = match self.drain_lock.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        tracing::debug!("drain already in progress, skipping");
        return Ok(Vec::new());
      }
    };

    let intents = self.peek_all()?;
    if intents.is_empty() {
      return Ok(Vec::new());
    }

    tracing::info!(pending = intents.len(), "draining offline queue");

    let mut outcomes = Vec::with_capacity(intents.len());
    for intent in intents {
      match replay(intent.clone()).await {
        Ok(response) => {
          self.remove(&intent.id)?;
          tracing::info!(id = %intent.id, "replayed queued mutation");
          outcomes.push(ReplayOutcome::Replayed { intent, response });
        }
        Err(error) => {
          let retries = self.bump_retries(&intent.id)?;
          if retries >= MAX_REPLAY_RETRIES {
            self.remove(&intent.id)?;
            tracing::warn!(
              id = %intent.id,
              retries,
              "dropping queued mutation after retry maximum: {error}"
            );
            let intent = MutationIntent { retries, ..intent };
            let error = ApiError::ReplayExhausted {
              method: intent.method.as_str().to_string(),
              endpoint: intent.endpoint.clone(),
              attempts: retries,
              last_error: error.to_string(),
            };
            outcomes.push(ReplayOutcome::Dropped { intent, error });
          } else {
            tracing::debug!(id = %intent.id, retries, "keeping queued mutation for later drain: {error}");
            let intent = MutationIntent { retries, ..intent };
            outcomes.push(ReplayOutcome::Kept { intent, error });
          }
        }
      }
    }

    Ok(outcomes)
  }
}
