//! Durable, strictly ordered queue of pending write operations.
//!
//! Mutations are appended while offline (or whenever a write fails fast) and
//! replayed in submission order once connectivity returns. The queue is
//! flushed to durable storage on every change, so a crash immediately after
//! `enqueue` never loses a write.

mod mutation;

pub use mutation::{CategoryMutation, Mutation, MutationKind, NoteMutation, TaskMutation};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::net::NetworkMonitor;
use crate::storage::SyncStorage;

/// A mutation stops retrying after this many failed delivery attempts.
pub const MAX_RETRIES: u32 = 3;

/// Past this depth the queue keeps accepting writes but logs a warning so the
/// embedding app can surface the backlog.
const QUEUE_SOFT_LIMIT: usize = 1000;

/// A write operation waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: String,
  pub mutation: Mutation,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueuedMutation {
  pub fn kind(&self) -> MutationKind {
    self.mutation.kind()
  }

  pub fn entity_type(&self) -> &'static str {
    self.mutation.entity_type()
  }
}

/// Delivers one mutation to the remote API. Implementations own timeouts;
/// once `execute` has started it runs to completion or failure.
pub trait MutationExecutor: Send + Sync {
  fn execute<'a>(&'a self, mutation: &'a QueuedMutation) -> BoxFuture<'a, SyncResult<()>>;
}

/// Queue lifecycle notifications for UI surfaces.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// A drain finished with every pending mutation resolved.
  DrainCompleted { delivered: usize, dropped: usize },
  /// A delivery attempt failed; the mutation stays queued for retry.
  MutationFailed { id: String, error: SyncError },
  /// A mutation was removed without being delivered (retries exhausted or
  /// definitively rejected).
  MutationDropped { id: String, error: SyncError },
}

/// Result of a [`MutationQueue::drain`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
  /// Another drain is already running; this call was a no-op.
  AlreadyRunning,
  /// The queue was fully processed.
  Completed { delivered: usize, dropped: usize },
  /// The drain stopped early; remaining mutations are intact for the next
  /// drain.
  Aborted {
    delivered: usize,
    dropped: usize,
    error: SyncError,
  },
}

/// Durable FIFO queue of pending mutations.
///
/// Owned by exactly one execution context. Replays are strictly in
/// submission order; same-entity mutations are never reordered, coalesced,
/// or deduplicated.
pub struct MutationQueue<S: SyncStorage> {
  storage: Arc<S>,
  network: NetworkMonitor,
  pending: Mutex<VecDeque<QueuedMutation>>,
  draining: AtomicBool,
  last_error: Mutex<Option<SyncError>>,
  seq: AtomicU64,
  events: broadcast::Sender<SyncEvent>,
}

impl<S: SyncStorage> MutationQueue<S> {
  /// Load the persisted queue from storage.
  pub fn new(storage: Arc<S>, network: NetworkMonitor) -> SyncResult<Self> {
    let pending: VecDeque<QueuedMutation> = storage.load_queue()?.into();
    if !pending.is_empty() {
      info!(pending = pending.len(), "mutation queue loaded from storage");
    }
    let (events, _) = broadcast::channel(64);

    Ok(Self {
      storage,
      network,
      pending: Mutex::new(pending),
      draining: AtomicBool::new(false),
      last_error: Mutex::new(None),
      seq: AtomicU64::new(0),
      events,
    })
  }

  /// Append a mutation to the tail of the queue. The new queue state is
  /// flushed to durable storage before this returns.
  pub fn enqueue(&self, mutation: Mutation) -> SyncResult<String> {
    let queued = QueuedMutation {
      id: self.next_id(&mutation),
      mutation,
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    let id = queued.id.clone();

    let mut pending = self.pending.lock();
    pending.push_back(queued);
    if let Err(e) = self.persist(&pending) {
      // Not durably recorded: undo the in-memory append so the caller can
      // see the write was rejected.
      pending.pop_back();
      return Err(e);
    }

    debug!(id = %id, len = pending.len(), "mutation enqueued");
    if pending.len() == QUEUE_SOFT_LIMIT {
      warn!(
        len = pending.len(),
        "mutation queue past soft limit; has the device been offline long?"
      );
    }
    Ok(id)
  }

  /// Replay queued mutations in FIFO order through `executor`.
  ///
  /// Re-entrant calls while a drain is running are no-ops. A retryable
  /// failure stops the drain at the failing mutation so same-entity order is
  /// preserved; the next drain picks up from the head.
  pub async fn drain<E: MutationExecutor>(&self, executor: &E) -> SyncResult<DrainOutcome> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Ok(DrainOutcome::AlreadyRunning);
    }

    let outcome = self.drain_inner(executor).await;
    self.draining.store(false, Ordering::SeqCst);
    outcome
  }

  async fn drain_inner<E: MutationExecutor>(&self, executor: &E) -> SyncResult<DrainOutcome> {
    let mut delivered = 0usize;
    let mut dropped = 0usize;

    loop {
      if !self.network.is_online() {
        return Ok(self.abort(delivered, dropped, SyncError::NetworkUnavailable));
      }

      // Clone the head instead of holding the lock across the executor call.
      let Some(head) = self.pending.lock().front().cloned() else {
        break;
      };

      match executor.execute(&head).await {
        Ok(()) => {
          self.pop_head(&head.id)?;
          delivered += 1;
          debug!(id = %head.id, "mutation delivered");
        }
        Err(err @ SyncError::ServerError { .. }) => {
          if self.record_retry_failure(&head.id, &err)? {
            dropped += 1;
            continue;
          }
          self.emit(SyncEvent::MutationFailed {
            id: head.id.clone(),
            error: err.clone(),
          });
          return Ok(self.abort(delivered, dropped, err));
        }
        Err(err @ (SyncError::ClientError { .. } | SyncError::Serialization(_))) => {
          // Definitive rejection: a retry can't change the answer.
          self.reject(&head.id, &err)?;
          dropped += 1;
          *self.last_error.lock() = Some(err);
        }
        Err(err) => {
          // Unauthorized, offline mid-flight, storage trouble: leave the
          // head untouched and wait for conditions to change.
          return Ok(self.abort(delivered, dropped, err));
        }
      }
    }

    if dropped == 0 {
      *self.last_error.lock() = None;
    }
    self.emit(SyncEvent::DrainCompleted { delivered, dropped });
    if delivered > 0 || dropped > 0 {
      info!(delivered, dropped, "mutation queue drained");
    }
    Ok(DrainOutcome::Completed { delivered, dropped })
  }

  /// Remove a not-yet-attempted mutation, preventing future delivery.
  /// Returns false if the id is unknown or currently in flight.
  pub fn remove(&self, id: &str) -> SyncResult<bool> {
    let mut pending = self.pending.lock();
    let Some(pos) = pending.iter().position(|m| m.id == id) else {
      return Ok(false);
    };
    if pos == 0 && self.draining.load(Ordering::SeqCst) {
      // The head may already be executing; it runs to completion.
      return Ok(false);
    }
    pending.remove(pos);
    self.persist(&pending)?;
    debug!(id = %id, "mutation removed before delivery");
    Ok(true)
  }

  pub fn len(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.lock().is_empty()
  }

  /// Snapshot of the pending mutations in submission order.
  pub fn pending(&self) -> Vec<QueuedMutation> {
    self.pending.lock().iter().cloned().collect()
  }

  /// Error from the most recent failed delivery, cleared by the next fully
  /// successful drain.
  pub fn last_error(&self) -> Option<SyncError> {
    self.last_error.lock().clone()
  }

  /// Subscribe to queue lifecycle events.
  pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  fn abort(&self, delivered: usize, dropped: usize, error: SyncError) -> DrainOutcome {
    warn!(error = %error, "drain aborted; remaining mutations kept");
    *self.last_error.lock() = Some(error.clone());
    DrainOutcome::Aborted {
      delivered,
      dropped,
      error,
    }
  }

  fn pop_head(&self, expected_id: &str) -> SyncResult<()> {
    let mut pending = self.pending.lock();
    if pending.front().map(|m| m.id.as_str()) == Some(expected_id) {
      pending.pop_front();
    }
    self.persist(&pending)
  }

  /// Record a retryable failure against the head. Returns true when the
  /// retry bound is reached and the mutation has been dropped.
  fn record_retry_failure(&self, id: &str, error: &SyncError) -> SyncResult<bool> {
    let mut pending = self.pending.lock();
    let Some(head) = pending.front_mut() else {
      return Ok(false);
    };
    if head.id != id {
      return Ok(false);
    }

    head.retry_count += 1;
    let attempts = head.retry_count;
    if attempts < MAX_RETRIES {
      self.persist(&pending)?;
      debug!(id = %id, attempts, error = %error, "delivery failed; will retry");
      return Ok(false);
    }

    pending.pop_front();
    self.persist(&pending)?;
    warn!(id = %id, attempts, error = %error, "mutation dropped after exhausting retries");
    *self.last_error.lock() = Some(error.clone());
    self.emit(SyncEvent::MutationDropped {
      id: id.to_string(),
      error: error.clone(),
    });
    Ok(true)
  }

  /// Drop the head after a definitive (non-retryable) rejection.
  fn reject(&self, id: &str, error: &SyncError) -> SyncResult<()> {
    let mut pending = self.pending.lock();
    if pending.front().map(|m| m.id.as_str()) != Some(id) {
      return Ok(());
    }
    pending.pop_front();
    self.persist(&pending)?;
    warn!(id = %id, error = %error, "mutation rejected by server");
    self.emit(SyncEvent::MutationDropped {
      id: id.to_string(),
      error: error.clone(),
    });
    Ok(())
  }

  fn persist(&self, pending: &VecDeque<QueuedMutation>) -> SyncResult<()> {
    let items: Vec<QueuedMutation> = pending.iter().cloned().collect();
    self.storage.save_queue(&items)
  }

  fn emit(&self, event: SyncEvent) {
    // Nobody listening is fine.
    let _ = self.events.send(event);
  }

  fn next_id(&self, mutation: &Mutation) -> String {
    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
    format!(
      "{}-{}-{}-{}",
      mutation.entity_type(),
      mutation.kind().as_str(),
      Utc::now().timestamp_millis(),
      seq
    )
  }
}
