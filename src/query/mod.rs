//! Keyed read cache with stale-while-revalidate semantics.
//!
//! Inspired by TanStack Query: every read goes through [`QueryCache::get`],
//! which serves cached data when it is fresh, serves stale data immediately
//! while revalidating in the background, and falls back to whatever is
//! cached when the device is offline.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new(network.clone());
//! let key = request_key(HttpMethod::Get, &url);
//!
//! let api = api.clone();
//! let result = cache
//!     .get(&key, move || {
//!         let api = api.clone();
//!         async move { api.list_tasks().await }
//!     })
//!     .await?;
//!
//! render(result.value, result.stale);
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::net::NetworkMonitor;
use crate::storage::SnapshotEntry;

/// Data is served without revalidation for this long after a fetch.
const DEFAULT_STALE_AFTER: i64 = 5 * 60;

/// Entries unused past this horizon are dropped entirely.
const DEFAULT_GC_HORIZON: i64 = 24 * 60 * 60;

/// A cache read result.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  pub value: T,
  /// When the value was fetched from the network.
  pub fetched_at: DateTime<Utc>,
  /// True when the value is past its freshness window. A background
  /// revalidation has been started unless the device is offline.
  pub stale: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
  value: serde_json::Value,
  fetched_at: DateTime<Utc>,
}

struct QueryCacheInner {
  network: NetworkMonitor,
  entries: Mutex<HashMap<String, CacheEntry>>,
  /// Keys with a background revalidation in flight.
  revalidating: Mutex<HashSet<String>>,
  /// Signalled on entry updates so snapshot writers can persist promptly.
  dirty: Notify,
  stale_after: Duration,
  gc_horizon: Duration,
}

/// Shared, keyed query cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<QueryCacheInner>,
}

impl QueryCache {
  pub fn new(network: NetworkMonitor) -> Self {
    Self {
      inner: Arc::new(QueryCacheInner {
        network,
        entries: Mutex::new(HashMap::new()),
        revalidating: Mutex::new(HashSet::new()),
        dirty: Notify::new(),
        stale_after: Duration::seconds(DEFAULT_STALE_AFTER),
        gc_horizon: Duration::seconds(DEFAULT_GC_HORIZON),
      }),
    }
  }

  /// Override the freshness window.
  pub fn with_stale_after(self, stale_after: Duration) -> Self {
    let inner = QueryCacheInner {
      stale_after,
      ..self.into_inner()
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  /// Override the garbage collection horizon.
  pub fn with_gc_horizon(self, gc_horizon: Duration) -> Self {
    let inner = QueryCacheInner {
      gc_horizon,
      ..self.into_inner()
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  fn into_inner(self) -> QueryCacheInner {
    match Arc::try_unwrap(self.inner) {
      Ok(inner) => inner,
      // Builder methods are called before the cache is shared.
      Err(shared) => QueryCacheInner {
        network: shared.network.clone(),
        entries: Mutex::new(shared.entries.lock().clone()),
        revalidating: Mutex::new(HashSet::new()),
        dirty: Notify::new(),
        stale_after: shared.stale_after,
        gc_horizon: shared.gc_horizon,
      },
    }
  }

  /// Read through the cache.
  ///
  /// Fresh data is returned without touching the network. Stale data is
  /// returned immediately and revalidated in the background (at most one
  /// revalidation per key at a time). A miss fetches in the foreground.
  /// Offline, any cached value is served regardless of age; a miss fails
  /// with [`SyncError::NetworkUnavailable`].
  pub async fn get<T, F, Fut>(&self, key: &str, fetcher: F) -> SyncResult<QueryResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
  {
    self.prune_expired();

    let cached = self.inner.entries.lock().get(key).cloned();
    let online = self.inner.network.is_online();

    if let Some(entry) = cached {
      let age = Utc::now() - entry.fetched_at;
      let stale = age > self.inner.stale_after;

      if stale && online {
        self.spawn_revalidation(key, fetcher);
      }
      let value = serde_json::from_value(entry.value)?;
      return Ok(QueryResult {
        value,
        fetched_at: entry.fetched_at,
        stale: stale || !online,
      });
    }

    if !online {
      return Err(SyncError::NetworkUnavailable);
    }

    let value = self.fetch_and_store(key, &fetcher).await?;
    Ok(QueryResult {
      value: serde_json::from_value(value)?,
      fetched_at: Utc::now(),
      stale: false,
    })
  }

  /// Drop a cached entry so the next read fetches from the network.
  pub fn invalidate(&self, key: &str) {
    if self.inner.entries.lock().remove(key).is_some() {
      self.inner.dirty.notify_one();
    }
  }

  /// Resolves after the next entry update. A permit is held while updates
  /// are unobserved, so a burst of updates wakes the waiter at least once.
  pub async fn changed(&self) {
    self.inner.dirty.notified().await;
  }

  pub fn len(&self) -> usize {
    self.inner.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.entries.lock().is_empty()
  }

  /// Export all live entries for persistence.
  pub fn dehydrate(&self) -> Vec<SnapshotEntry> {
    self.prune_expired();
    let entries = self.inner.entries.lock();
    let mut snapshot: Vec<SnapshotEntry> = entries
      .iter()
      .map(|(key, entry)| SnapshotEntry {
        key: key.clone(),
        value: entry.value.clone(),
        fetched_at: entry.fetched_at,
      })
      .collect();
    snapshot.sort_by(|a, b| a.key.cmp(&b.key));
    snapshot
  }

  /// Seed the cache from a persisted snapshot. Entries past the garbage
  /// collection horizon are skipped; live in-memory entries win over the
  /// snapshot.
  pub fn rehydrate(&self, snapshot: Vec<SnapshotEntry>) {
    let now = Utc::now();
    let mut entries = self.inner.entries.lock();
    let mut restored = 0usize;
    for item in snapshot {
      if now - item.fetched_at > self.inner.gc_horizon {
        continue;
      }
      entries.entry(item.key).or_insert(CacheEntry {
        value: item.value,
        fetched_at: item.fetched_at,
      });
      restored += 1;
    }
    if restored > 0 {
      debug!(restored, "query cache rehydrated");
    }
  }

  fn spawn_revalidation<T, F, Fut>(&self, key: &str, fetcher: F)
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
  {
    // One revalidation per key; overlapping reads share its result.
    if !self.inner.revalidating.lock().insert(key.to_string()) {
      return;
    }

    let this = self.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      // Revalidation failures are swallowed; the stale value stays served
      // and the next stale read tries again.
      if let Err(e) = this.fetch_and_store(&key, &fetcher).await {
        debug!(key = %key, error = %e, "background revalidation failed");
      }
      this.inner.revalidating.lock().remove(&key);
    });
  }

  /// Run the fetcher under the retry policy and cache a successful result.
  async fn fetch_and_store<T, F, Fut>(&self, key: &str, fetcher: &F) -> SyncResult<serde_json::Value>
  where
    T: Serialize,
    F: Fn() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
  {
    let attempt = || async {
      if !self.inner.network.is_online() {
        return Err(SyncError::NetworkUnavailable);
      }
      let value = fetcher().await?;
      Ok(serde_json::to_value(&value)?)
    };

    let result = attempt
      .retry(retry_policy())
      .when(|e: &SyncError| e.is_retryable())
      .notify(|err: &SyncError, dur: std::time::Duration| {
        debug!(error = %err, backoff = ?dur, "query fetch failed; retrying");
      })
      .await;

    match result {
      Ok(value) => {
        self.inner.entries.lock().insert(
          key.to_string(),
          CacheEntry {
            value: value.clone(),
            fetched_at: Utc::now(),
          },
        );
        self.inner.dirty.notify_one();
        Ok(value)
      }
      Err(e) => {
        warn!(key = %key, error = %e, "query fetch failed");
        Err(e)
      }
    }
  }

  fn prune_expired(&self) {
    let horizon = self.inner.gc_horizon;
    let now = Utc::now();
    let mut entries = self.inner.entries.lock();
    let before = entries.len();
    entries.retain(|_, entry| now - entry.fetched_at <= horizon);
    let pruned = before - entries.len();
    if pruned > 0 {
      debug!(pruned, "expired query cache entries dropped");
    }
  }
}

/// Exponential backoff starting at 1s, capped at 30s, three attempts total.
fn retry_policy() -> ExponentialBuilder {
  ExponentialBuilder::default()
    .with_min_delay(std::time::Duration::from_secs(1))
    .with_max_delay(std::time::Duration::from_secs(30))
    .with_max_times(2)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_fetcher(
    counter: Arc<AtomicUsize>,
    result: SyncResult<Vec<u32>>,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, SyncResult<Vec<u32>>> + Send + Sync {
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      let result = result.clone();
      Box::pin(async move { result })
    }
  }

  /// Counts like [`counting_fetcher`] but holds the fetch open until the
  /// gate is released.
  fn gated_fetcher(
    counter: Arc<AtomicUsize>,
    gate: Arc<Notify>,
    result: SyncResult<Vec<u32>>,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, SyncResult<Vec<u32>>> + Send + Sync {
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      let gate = Arc::clone(&gate);
      let result = result.clone();
      Box::pin(async move {
        gate.notified().await;
        result
      })
    }
  }

  async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
      if cond() {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[tokio::test]
  async fn test_miss_fetches_then_fresh_hit_skips_network() {
    let cache = QueryCache::new(NetworkMonitor::new(true));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1, 2])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![1, 2]);
    assert!(!result.stale);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Within the freshness window the fetcher is not called again.
    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![9])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_hit_serves_old_value_and_revalidates() {
    let cache = QueryCache::new(NetworkMonitor::new(true)).with_stale_after(Duration::zero());
    let calls = Arc::new(AtomicUsize::new(0));

    cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await
      .unwrap();

    // Stale read: old value comes back immediately, refetch runs behind it.
    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![2])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![1]);
    assert!(result.stale);

    wait_for(|| calls.load(Ordering::SeqCst) == 2).await;
    wait_for(|| cache.inner.revalidating.lock().is_empty()).await;

    // The revalidated value is what later reads see.
    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![3])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![2]);
  }

  #[tokio::test]
  async fn test_concurrent_stale_reads_share_one_revalidation() {
    let cache = QueryCache::new(NetworkMonitor::new(true)).with_stale_after(Duration::zero());
    let calls = Arc::new(AtomicUsize::new(0));

    cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await
      .unwrap();

    // Hold the refetch open while both stale reads pass through.
    let gate = Arc::new(Notify::new());
    let (a, b) = tokio::join!(
      cache.get(
        "k",
        gated_fetcher(Arc::clone(&calls), Arc::clone(&gate), Ok(vec![2]))
      ),
      cache.get(
        "k",
        gated_fetcher(Arc::clone(&calls), Arc::clone(&gate), Ok(vec![2]))
      ),
    );
    assert_eq!(a.unwrap().value, vec![1]);
    assert_eq!(b.unwrap().value, vec![1]);

    // Exactly one of the two reads started a refetch.
    wait_for(|| calls.load(Ordering::SeqCst) == 2).await;
    gate.notify_one();
    wait_for(|| cache.inner.revalidating.lock().is_empty()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // And its result is what later reads see.
    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![9])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![2]);
  }

  #[tokio::test]
  async fn test_offline_serves_cached_without_fetching() {
    let network = NetworkMonitor::new(true);
    let cache = QueryCache::new(network.clone()).with_stale_after(Duration::zero());
    let calls = Arc::new(AtomicUsize::new(0));

    cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await
      .unwrap();

    network.set_online(false);
    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![2])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![1]);
    assert!(result.stale);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_offline_miss_is_an_error() {
    let cache = QueryCache::new(NetworkMonitor::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let result: SyncResult<QueryResult<Vec<u32>>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await;
    assert_eq!(result.unwrap_err(), SyncError::NetworkUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_retry_up_to_three_attempts() {
    let cache = QueryCache::new(NetworkMonitor::new(true));
    let calls = Arc::new(AtomicUsize::new(0));

    let result: SyncResult<QueryResult<Vec<u32>>> = cache
      .get(
        "k",
        counting_fetcher(Arc::clone(&calls), Err(SyncError::ServerError { status: 503 })),
      )
      .await;
    assert_eq!(result.unwrap_err(), SyncError::ServerError { status: 503 });
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_client_errors_do_not_retry() {
    let cache = QueryCache::new(NetworkMonitor::new(true));
    let calls = Arc::new(AtomicUsize::new(0));

    let result: SyncResult<QueryResult<Vec<u32>>> = cache
      .get(
        "k",
        counting_fetcher(Arc::clone(&calls), Err(SyncError::ClientError { status: 404 })),
      )
      .await;
    assert_eq!(result.unwrap_err(), SyncError::ClientError { status: 404 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_dehydrate_rehydrate_roundtrip() {
    let cache = QueryCache::new(NetworkMonitor::new(true));
    let calls = Arc::new(AtomicUsize::new(0));

    cache
      .get("k1", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await
      .unwrap();
    cache
      .get("k2", counting_fetcher(Arc::clone(&calls), Ok(vec![2])))
      .await
      .unwrap();

    let snapshot = cache.dehydrate();
    assert_eq!(snapshot.len(), 2);

    // A fresh cache seeded from the snapshot serves hits without fetching.
    let restored = QueryCache::new(NetworkMonitor::new(true));
    restored.rehydrate(snapshot);
    let result: QueryResult<Vec<u32>> = restored
      .get("k1", counting_fetcher(Arc::clone(&calls), Ok(vec![9])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_entries_past_gc_horizon_are_dropped() {
    let cache = QueryCache::new(NetworkMonitor::new(true));

    cache.rehydrate(vec![
      SnapshotEntry {
        key: "old".to_string(),
        value: serde_json::json!([1]),
        fetched_at: Utc::now() - Duration::hours(25),
      },
      SnapshotEntry {
        key: "live".to_string(),
        value: serde_json::json!([2]),
        fetched_at: Utc::now(),
      },
    ]);

    // The expired entry never made it in.
    assert_eq!(cache.len(), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let result = cache
      .get("old", counting_fetcher(Arc::clone(&calls), Ok(vec![7])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![7]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let cache = QueryCache::new(NetworkMonitor::new(true));
    let calls = Arc::new(AtomicUsize::new(0));

    cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![1])))
      .await
      .unwrap();
    cache.invalidate("k");

    let result: QueryResult<Vec<u32>> = cache
      .get("k", counting_fetcher(Arc::clone(&calls), Ok(vec![2])))
      .await
      .unwrap();
    assert_eq!(result.value, vec![2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
