//! Versioned response cache backing the request gateway.
//!
//! Every cached response is keyed by (gateway version, request key). A new
//! version installs its rows in one transaction, so a half-finished install
//! never leaves a partially cached version behind; activation deletes every
//! other version's rows.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::net::FetchResponse;

/// SQLite-backed response cache. Separate database from the sync store; the
/// gateway owns it exclusively.
pub struct ResponseStore {
  conn: Mutex<Connection>,
}

impl ResponseStore {
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

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("could not determine data directory".to_string()))?;

    Ok(data_dir.join("tasksync").join("gateway.db"))
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

  /// Store one response under a version.
  pub fn put(&self, version: &str, key: &str, resp: &FetchResponse) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO response_cache (version, request_key, status, content_type, body, stored_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![version, key, resp.status as i64, resp.content_type, resp.body],
    )?;
    Ok(())
  }

  /// Store a whole shell's responses in one transaction. Either every entry
  /// lands or none do.
  pub fn put_all(&self, version: &str, entries: &[(String, FetchResponse)]) -> SyncResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    for (key, resp) in entries {
      tx.execute(
        "INSERT OR REPLACE INTO response_cache (version, request_key, status, content_type, body, stored_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![version, key, resp.status as i64, resp.content_type, resp.body],
      )?;
    }

    tx.commit()?;
    Ok(())
  }

  /// Look up a cached response under a version.
  pub fn get(&self, version: &str, key: &str) -> SyncResult<Option<FetchResponse>> {
    let conn = self.lock()?;
    let row: Option<(i64, Option<String>, Vec<u8>)> = conn
      .query_row(
        "SELECT status, content_type, body FROM response_cache
         WHERE version = ? AND request_key = ?",
        params![version, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((status, content_type, body)) = row else {
      return Ok(None);
    };

    let status = u16::try_from(status)
      .map_err(|_| SyncError::CacheCorruption(format!("stored status {} out of range", status)))?;

    Ok(Some(FetchResponse {
      status,
      content_type,
      body,
    }))
  }

  /// Delete every version's rows except `keep`. Returns the number of rows
  /// removed.
  pub fn purge_except(&self, keep: &str) -> SyncResult<usize> {
    let conn = self.lock()?;
    let purged = conn.execute(
      "DELETE FROM response_cache WHERE version != ?",
      params![keep],
    )?;
    Ok(purged)
  }

  /// Number of responses cached under a version.
  pub fn count(&self, version: &str) -> SyncResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM response_cache WHERE version = ?",
      params![version],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// Schema for the response cache.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    version TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (version, request_key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_version
    ON response_cache(version);
"#;

#[cfg(test)]
mod tests {
  use super::*;

  fn open_temp() -> (tempfile::TempDir, ResponseStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ResponseStore::open_at(&dir.path().join("gateway.db")).unwrap();
    (dir, store)
  }

  fn html(body: &str) -> FetchResponse {
    FetchResponse {
      status: 200,
      content_type: Some("text/html".to_string()),
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_roundtrip_and_miss() {
    let (_dir, store) = open_temp();

    store.put("v1", "key-a", &html("<p>hello</p>")).unwrap();

    let hit = store.get("v1", "key-a").unwrap().unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.content_type.as_deref(), Some("text/html"));
    assert_eq!(hit.body, b"<p>hello</p>");

    assert!(store.get("v1", "key-b").unwrap().is_none());
    assert!(store.get("v2", "key-a").unwrap().is_none());
  }

  #[test]
  fn test_put_all_stores_every_entry() {
    let (_dir, store) = open_temp();

    let entries = vec![
      ("key-a".to_string(), html("a")),
      ("key-b".to_string(), html("b")),
    ];
    store.put_all("v1", &entries).unwrap();

    assert_eq!(store.count("v1").unwrap(), 2);
    assert_eq!(store.get("v1", "key-b").unwrap().unwrap().body, b"b");
  }

  #[test]
  fn test_purge_except_keeps_only_named_version() {
    let (_dir, store) = open_temp();

    store.put("v1", "key-a", &html("old")).unwrap();
    store.put("v1", "key-b", &html("old")).unwrap();
    store.put("v2", "key-a", &html("new")).unwrap();

    let purged = store.purge_except("v2").unwrap();
    assert_eq!(purged, 2);
    assert_eq!(store.count("v1").unwrap(), 0);
    assert_eq!(store.get("v2", "key-a").unwrap().unwrap().body, b"new");
  }

  #[test]
  fn test_put_overwrites_previous_response() {
    let (_dir, store) = open_temp();

    store.put("v1", "key-a", &html("first")).unwrap();
    store.put("v1", "key-a", &html("second")).unwrap();

    assert_eq!(store.count("v1").unwrap(), 1);
    assert_eq!(store.get("v1", "key-a").unwrap().unwrap().body, b"second");
  }

  #[test]
  fn test_out_of_range_status_reads_as_corruption() {
    let (_dir, store) = open_temp();

    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO response_cache (version, request_key, status, content_type, body, stored_at)
           VALUES ('v1', 'key-a', 99999, NULL, X'00', datetime('now'))",
          [],
        )
        .unwrap();
    }

    assert!(matches!(
      store.get("v1", "key-a"),
      Err(SyncError::CacheCorruption(_))
    ));
  }
}
