//! Persisted auth state.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use crate::db::Database;

/// Storage key for the bearer token.
const AUTH_TOKEN_KEY: &str = "auth_token";

/// Handle to the persisted auth token.
///
/// Passed explicitly to the components that need it rather than living in
/// ambient module state. The `DONEPIN_TOKEN` environment variable overrides
/// whatever is persisted.
#[derive(Clone)]
pub struct AuthStore {
  db: Arc<Database>,
}

impl AuthStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// The current bearer token, if any.
  ///
  /// Storage errors are logged rather than surfaced: a missing token just
  /// means requests go out unauthenticated and the server says 401.
  pub fn token(&self) -> Option<String> {
    if let Ok(token) = std::env::var("DONEPIN_TOKEN") {
      if !token.is_empty() {
        return Some(token);
      }
    }

    match self.read_token() {
      Ok(token) => token,
      Err(e) => {
        tracing::warn!("failed to read auth token: {e}");
        None
      }
    }
  }

  fn read_token(&self) -> Result<Option<String>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv WHERE key = ?",
        params![AUTH_TOKEN_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query auth token: {}", e))
  }

  /// Persist a new token, replacing any previous one.
  pub fn set_token(&self, token: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![AUTH_TOKEN_KEY, token],
      )
      .map_err(|e| eyre!("Failed to store auth token: {}", e))?;
    Ok(())
  }

  /// Forget the persisted token.
  pub fn clear_token(&self) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![AUTH_TOKEN_KEY])
      .map_err(|e| eyre!("Failed to clear auth token: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_round_trip() {
    let db = Database::open_in_memory().unwrap();
    let auth = AuthStore::new(db);

    assert_eq!(auth.token(), None);
    auth.set_token("tok_123").unwrap();
    assert_eq!(auth.token(), Some("tok_123".to_string()));

    auth.clear_token().unwrap();
    assert_eq!(auth.token(), None);
  }

  #[test]
  fn test_set_token_replaces_previous() {
    let db = Database::open_in_memory().unwrap();
    let auth = AuthStore::new(db);

    auth.set_token("old").unwrap();
    auth.set_token("new").unwrap();
    assert_eq!(auth.token(), Some("new".to_string()));
  }
}
