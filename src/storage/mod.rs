//! Durable storage backends for the sync engine.
//!
//! One store holds everything a context needs to survive a restart: the
//! pending mutation queue, the last query snapshot, and named boolean flags
//! shared across contexts (e.g. push subscription state).

mod sqlite;

pub use sqlite::SqliteStorage;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::SyncResult;
use crate::queue::QueuedMutation;

/// One persisted query result inside a snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotEntry {
  /// Stable cache key of the query.
  pub key: String,
  /// The successful response payload.
  pub value: serde_json::Value,
  /// When the payload was fetched from the network.
  pub fetched_at: DateTime<Utc>,
}

/// Trait for sync storage backends.
pub trait SyncStorage: Send + Sync {
  /// Replace the persisted mutation queue with `items`, preserving order.
  fn save_queue(&self, items: &[QueuedMutation]) -> SyncResult<()>;

  /// Load the persisted mutation queue in submission order.
  fn load_queue(&self) -> SyncResult<Vec<QueuedMutation>>;

  /// Replace the persisted query snapshot.
  fn save_snapshot(&self, entries: &[SnapshotEntry]) -> SyncResult<()>;

  /// Load the persisted query snapshot. Unreadable entries are skipped.
  fn load_snapshot(&self) -> SyncResult<Vec<SnapshotEntry>>;

  /// Set a named cross-context flag.
  fn set_flag(&self, name: &str, value: bool) -> SyncResult<()>;

  /// Read a named flag. Missing flags read as false.
  fn get_flag(&self, name: &str) -> SyncResult<bool>;
}

/// In-memory storage backend.
/// State is lost on drop; useful for tests and ephemeral contexts.
#[derive(Default)]
pub struct MemoryStorage {
  inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
  queue: Vec<QueuedMutation>,
  snapshot: Vec<SnapshotEntry>,
  flags: HashMap<String, bool>,
}

impl SyncStorage for MemoryStorage {
  fn save_queue(&self, items: &[QueuedMutation]) -> SyncResult<()> {
    self.inner.lock().queue = items.to_vec();
    Ok(())
  }

  fn load_queue(&self) -> SyncResult<Vec<QueuedMutation>> {
    Ok(self.inner.lock().queue.clone())
  }

  fn save_snapshot(&self, entries: &[SnapshotEntry]) -> SyncResult<()> {
    self.inner.lock().snapshot = entries.to_vec();
    Ok(())
  }

  fn load_snapshot(&self) -> SyncResult<Vec<SnapshotEntry>> {
    Ok(self.inner.lock().snapshot.clone())
  }

  fn set_flag(&self, name: &str, value: bool) -> SyncResult<()> {
    self.inner.lock().flags.insert(name.to_string(), value);
    Ok(())
  }

  fn get_flag(&self, name: &str) -> SyncResult<bool> {
    Ok(self.inner.lock().flags.get(name).copied().unwrap_or(false))
  }
}
