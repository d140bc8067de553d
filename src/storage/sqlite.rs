//! SQLite implementation of the sync storage backend.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::{SnapshotEntry, SyncStorage};
use crate::error::{SyncError, SyncResult};
use crate::queue::QueuedMutation;

/// SQLite-backed sync storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the default location.
  pub fn open() -> SyncResult<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) a database at an explicit path.
  pub fn open_at(path: &Path) -> SyncResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("failed to create data directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!("failed to open database at {}: {}", path.display(), e))
    })?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("could not determine data directory".to_string()))?;

    Ok(data_dir.join("tasksync").join("sync.db"))
  }

  fn run_migrations(&self) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))
  }
}

/// Schema for sync tables.
const SCHEMA: &str = r#"
-- Pending mutations in submission order
CREATE TABLE IF NOT EXISTS mutation_queue (
    position INTEGER NOT NULL,
    id TEXT PRIMARY KEY,
    mutation TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_position
    ON mutation_queue(position);

-- Last persisted query results, one row per query key
CREATE TABLE IF NOT EXISTS query_snapshot (
    query_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);

-- Named flags shared across contexts
CREATE TABLE IF NOT EXISTS sync_flags (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

impl SyncStorage for SqliteStorage {
  fn save_queue(&self, items: &[QueuedMutation]) -> SyncResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM mutation_queue", [])?;
    for (position, item) in items.iter().enumerate() {
      let mutation = serde_json::to_string(&item.mutation)?;
      tx.execute(
        "INSERT INTO mutation_queue (position, id, mutation, enqueued_at, retry_count)
         VALUES (?, ?, ?, ?, ?)",
        params![
          position as i64,
          item.id,
          mutation,
          item.enqueued_at.to_rfc3339(),
          item.retry_count,
        ],
      )?;
    }

    tx.commit()?;
    Ok(())
  }

  fn load_queue(&self) -> SyncResult<Vec<QueuedMutation>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, mutation, enqueued_at, retry_count FROM mutation_queue ORDER BY position",
    )?;

    let rows: Vec<(String, String, String, u32)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })?
      .collect::<Result<_, _>>()?;

    // A queued write the app was promised must not silently vanish, so a
    // row that no longer parses is an error rather than a skip.
    let mut items = Vec::with_capacity(rows.len());
    for (id, mutation, enqueued_at, retry_count) in rows {
      items.push(QueuedMutation {
        id,
        mutation: serde_json::from_str(&mutation)?,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        retry_count,
      });
    }

    Ok(items)
  }

  fn save_snapshot(&self, entries: &[SnapshotEntry]) -> SyncResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM query_snapshot", [])?;
    for entry in entries {
      let data = serde_json::to_vec(&entry.value)?;
      tx.execute(
        "INSERT INTO query_snapshot (query_key, data, fetched_at) VALUES (?, ?, ?)",
        params![entry.key, data, entry.fetched_at.to_rfc3339()],
      )?;
    }

    tx.commit()?;
    Ok(())
  }

  fn load_snapshot(&self) -> SyncResult<Vec<SnapshotEntry>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT query_key, data, fetched_at FROM query_snapshot")?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })?
      .collect::<Result<_, _>>()?;

    // Snapshot entries are only a warm-start optimization; drop the ones
    // that no longer parse instead of failing startup.
    let entries = rows
      .into_iter()
      .filter_map(|(key, data, fetched_at)| {
        let value = match serde_json::from_slice(&data) {
          Ok(value) => value,
          Err(e) => {
            warn!(key = %key, error = %e, "skipping unreadable snapshot entry");
            return None;
          }
        };
        let fetched_at = match parse_timestamp(&fetched_at) {
          Ok(ts) => ts,
          Err(e) => {
            warn!(key = %key, error = %e, "skipping unreadable snapshot entry");
            return None;
          }
        };
        Some(SnapshotEntry {
          key,
          value,
          fetched_at,
        })
      })
      .collect();

    Ok(entries)
  }

  fn set_flag(&self, name: &str, value: bool) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO sync_flags (name, value) VALUES (?, ?)",
      params![name, value as i64],
    )?;
    Ok(())
  }

  fn get_flag(&self, name: &str) -> SyncResult<bool> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT value FROM sync_flags WHERE name = ?")?;
    let value: Option<i64> = stmt
      .query_row(params![name], |row| row.get(0))
      .optional()?;
    Ok(value.unwrap_or(0) != 0)
  }
}

/// Parse an RFC 3339 timestamp written by `save_queue`/`save_snapshot`.
fn parse_timestamp(s: &str) -> SyncResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| SyncError::Storage(format!("failed to parse timestamp '{}': {}", s, e)))
}
