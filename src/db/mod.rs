use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Local state database.
///
/// Holds everything that must survive a process restart: the offline
/// mutation queue and the persisted auth token. The optimistic cache is
/// deliberately not persisted here.
pub struct Database {
  conn: Mutex<Connection>,
}

/// Schema for durable state tables.
const SCHEMA: &str = r#"
-- Pending mutations, FIFO by position
CREATE TABLE IF NOT EXISTS offline_queue (
    position INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0
);

-- Namespaced key/value storage (auth token lives here)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl Database {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Arc<Self>> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at the given path.
  pub fn open_at(path: &Path) -> Result<Arc<Self>> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory database. Used by tests.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Arc<Self>> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Arc<Self>> {
    // Flush every write through to disk so queued mutations survive a crash.
    conn
      .pragma_update(None, "synchronous", "FULL")
      .map_err(|e| eyre!("Failed to set synchronous pragma: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(Arc::new(db))
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("donepin").join("state.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the underlying connection.
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
