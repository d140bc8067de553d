//! Per-context composition of the sync engine.
//!
//! A [`SyncContext`] is the page-side entry point: it owns the mutation
//! queue, the query cache, and the background tasks that keep them honest.
//! Every isolated execution context (each app window, the CLI) builds its
//! own; nothing here is global. All contexts over the same storage see each
//! other's durable state.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::types::{Category, Note, Task};
use crate::api::{ApiClient, ApiExecutor};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::net::{request_key, HttpMethod, NetworkMonitor};
use crate::query::{QueryCache, QueryResult};
use crate::queue::{DrainOutcome, Mutation, MutationQueue, SyncEvent};
use crate::storage::SyncStorage;

/// Tuning knobs for a context's background behavior.
#[derive(Debug, Clone)]
pub struct ContextOptions {
  /// Freshness window for cached reads.
  pub stale_after: ChronoDuration,
  /// Age past which unused cached reads are dropped.
  pub gc_horizon: ChronoDuration,
  /// How often the query cache is snapshotted to storage.
  pub snapshot_interval: std::time::Duration,
}

impl Default for ContextOptions {
  fn default() -> Self {
    Self {
      stale_after: ChronoDuration::minutes(5),
      gc_horizon: ChronoDuration::hours(24),
      snapshot_interval: std::time::Duration::from_secs(30),
    }
  }
}

impl ContextOptions {
  /// Derive options from the config file's `sync` section.
  pub fn from_config(sync: &SyncConfig) -> Self {
    Self {
      stale_after: ChronoDuration::seconds(sync.stale_after_secs as i64),
      gc_horizon: ChronoDuration::hours(sync.gc_horizon_hours as i64),
      snapshot_interval: std::time::Duration::from_secs(sync.snapshot_interval_secs),
    }
  }
}

/// One execution context's view of the sync engine.
///
/// Dropping the context stops its background tasks and persists a final
/// query snapshot.
pub struct SyncContext<S: SyncStorage> {
  network: NetworkMonitor,
  storage: Arc<S>,
  queue: Arc<MutationQueue<S>>,
  cache: QueryCache,
  api: ApiClient,
  executor: Arc<ApiExecutor>,
  tasks: Vec<JoinHandle<()>>,
}

impl<S: SyncStorage + 'static> SyncContext<S> {
  /// Build a context over `storage`, restoring the persisted queue and
  /// query snapshot. Must be called from within a tokio runtime; the
  /// context spawns its auto-drain and snapshot tasks immediately.
  pub fn new(api: ApiClient, storage: Arc<S>, network: NetworkMonitor) -> SyncResult<Self> {
    Self::with_options(api, storage, network, ContextOptions::default())
  }

  pub fn with_options(
    api: ApiClient,
    storage: Arc<S>,
    network: NetworkMonitor,
    options: ContextOptions,
  ) -> SyncResult<Self> {
    let queue = Arc::new(MutationQueue::new(Arc::clone(&storage), network.clone())?);
    let cache = QueryCache::new(network.clone())
      .with_stale_after(options.stale_after)
      .with_gc_horizon(options.gc_horizon);
    cache.rehydrate(storage.load_snapshot()?);

    let executor = Arc::new(ApiExecutor::new(api.clone()));

    let mut context = Self {
      network,
      storage,
      queue,
      cache,
      api,
      executor,
      tasks: Vec::new(),
    };
    context.spawn_auto_drain();
    context.spawn_snapshot_task(options.snapshot_interval);
    Ok(context)
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.network
  }

  pub fn queue(&self) -> &MutationQueue<S> {
    &self.queue
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  /// Record a write. Offline or online, the mutation is queued durably and
  /// delivered by the next drain.
  pub fn submit(&self, mutation: Mutation) -> SyncResult<String> {
    self.queue.enqueue(mutation)
  }

  /// Drain the mutation queue immediately.
  pub async fn sync_now(&self) -> SyncResult<DrainOutcome> {
    self.queue.drain(self.executor.as_ref()).await
  }

  /// Queue lifecycle events (delivery, drops, completed drains).
  pub fn events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
    self.queue.events()
  }

  /// Cached read of all tasks.
  pub async fn tasks(&self) -> SyncResult<QueryResult<Vec<Task>>> {
    let api = self.api.clone();
    self
      .read("api/tasks", move || {
        let api = api.clone();
        async move { api.list_tasks().await }
      })
      .await
  }

  /// Cached read of all categories.
  pub async fn categories(&self) -> SyncResult<QueryResult<Vec<Category>>> {
    let api = self.api.clone();
    self
      .read("api/categories", move || {
        let api = api.clone();
        async move { api.list_categories().await }
      })
      .await
  }

  /// Cached read of one task's notes.
  pub async fn notes(&self, task_id: &str) -> SyncResult<QueryResult<Vec<Note>>> {
    let api = self.api.clone();
    let task_id = task_id.to_string();
    self
      .read(&format!("api/tasks/{}/notes", task_id), move || {
        let api = api.clone();
        let task_id = task_id.clone();
        async move { api.list_notes(&task_id).await }
      })
      .await
  }

  /// Persist the query cache now instead of waiting for the next interval.
  pub fn persist_snapshot(&self) -> SyncResult<()> {
    self.storage.save_snapshot(&self.cache.dehydrate())
  }

  async fn read<T, F, Fut>(&self, path: &str, fetcher: F) -> SyncResult<QueryResult<T>>
  where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = SyncResult<T>> + Send + 'static,
  {
    let key = self.query_key(path)?;
    self.cache.get(&key, fetcher).await
  }

  /// Cache keys are derived from the full request URL, so every context
  /// using the same API sees the same entries.
  fn query_key(&self, path: &str) -> SyncResult<String> {
    let url = self
      .api
      .base_url()
      .join(path)
      .map_err(|e| crate::error::SyncError::InvalidRequest(format!("bad path '{}': {}", path, e)))?;
    Ok(request_key(HttpMethod::Get, &url))
  }

  /// Drain whenever connectivity comes (or starts) up.
  fn spawn_auto_drain(&mut self) {
    let mut watch = self.network.watch();
    let queue = Arc::clone(&self.queue);
    let executor = Arc::clone(&self.executor);

    self.tasks.push(tokio::spawn(async move {
      loop {
        let online = *watch.borrow_and_update();
        if online && !queue.is_empty() {
          info!(pending = queue.len(), "connectivity up; draining queue");
          match queue.drain(executor.as_ref()).await {
            Ok(outcome) => debug!(?outcome, "auto drain finished"),
            Err(e) => warn!(error = %e, "auto drain failed"),
          }
        }
        if watch.changed().await.is_err() {
          break;
        }
      }
    }));
  }

  /// Persist the query snapshot on a timer and promptly after entry
  /// updates, so a crash loses at most the writes since the last signal.
  fn spawn_snapshot_task(&mut self, every: std::time::Duration) {
    let cache = self.cache.clone();
    let storage = Arc::clone(&self.storage);

    self.tasks.push(tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = interval.tick() => {}
          _ = cache.changed() => {}
        }
        if let Err(e) = storage.save_snapshot(&cache.dehydrate()) {
          warn!(error = %e, "failed to persist query snapshot");
        }
      }
    }));
  }
}

impl<S: SyncStorage> Drop for SyncContext<S> {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
    if let Err(e) = self.storage.save_snapshot(&self.cache.dehydrate()) {
      warn!(error = %e, "failed to persist query snapshot on shutdown");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{NewTask, TaskPatch};
  use crate::net::mock::MockFetch;
  use crate::net::Fetch;
  use crate::queue::TaskMutation;
  use crate::storage::MemoryStorage;
  use url::Url;

  fn api(mock: &Arc<MockFetch>) -> ApiClient {
    ApiClient::new(
      Arc::clone(mock) as Arc<dyn Fetch>,
      Url::parse("https://tasks.test/").unwrap(),
    )
  }

  fn create(id: &str) -> Mutation {
    Mutation::Task(TaskMutation::Create(NewTask {
      id: id.to_string(),
      title: format!("task {}", id),
      description: None,
      due_at: None,
      category_id: None,
    }))
  }

  fn toggle(id: &str) -> Mutation {
    Mutation::Task(TaskMutation::Update {
      id: id.to_string(),
      patch: TaskPatch {
        completed: Some(true),
        ..Default::default()
      },
    })
  }

  async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
      if cond() {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[test]
  fn test_options_derive_from_config() {
    let sync: SyncConfig = serde_yaml::from_str(
      "stale_after_secs: 600\ngc_horizon_hours: 48\nsnapshot_interval_secs: 5\n",
    )
    .unwrap();

    let options = ContextOptions::from_config(&sync);
    assert_eq!(options.stale_after, ChronoDuration::minutes(10));
    assert_eq!(options.gc_horizon, ChronoDuration::hours(48));
    assert_eq!(options.snapshot_interval, std::time::Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_offline_writes_flush_when_connectivity_returns() {
    let mock = Arc::new(MockFetch::new());
    let network = NetworkMonitor::new(false);
    let context =
      SyncContext::new(api(&mock), Arc::new(MemoryStorage::default()), network.clone()).unwrap();

    context.submit(create("t-1")).unwrap();
    context.submit(toggle("t-1")).unwrap();
    assert_eq!(context.queue().len(), 2);
    assert!(mock.calls().is_empty());

    network.set_online(true);
    wait_for(|| context.queue().is_empty()).await;

    assert_eq!(
      mock.calls(),
      vec![
        (HttpMethod::Post, "/api/tasks".to_string()),
        (HttpMethod::Put, "/api/tasks/t-1".to_string()),
      ]
    );
    assert_eq!(context.queue().last_error(), None);
  }

  #[tokio::test]
  async fn test_persisted_queue_drains_at_startup() {
    let storage = Arc::new(MemoryStorage::default());
    let mock = Arc::new(MockFetch::new());

    // A previous session left a write behind.
    {
      let offline = NetworkMonitor::new(false);
      let context = SyncContext::new(api(&mock), Arc::clone(&storage), offline).unwrap();
      context.submit(create("t-1")).unwrap();
    }

    // The next session starts online and flushes it without being asked.
    let context =
      SyncContext::new(api(&mock), Arc::clone(&storage), NetworkMonitor::new(true)).unwrap();
    wait_for(|| context.queue().is_empty()).await;
    assert_eq!(mock.call_count("/api/tasks"), 1);
  }

  #[tokio::test]
  async fn test_sync_now_drains_explicitly() {
    let mock = Arc::new(MockFetch::new());
    let context = SyncContext::new(
      api(&mock),
      Arc::new(MemoryStorage::default()),
      NetworkMonitor::new(true),
    )
    .unwrap();

    context.submit(create("t-1")).unwrap();
    let outcome = context.sync_now().await.unwrap();
    // The auto-drain task may have taken the write first; either way the
    // drain is clean and the write goes out exactly once.
    assert!(matches!(
      outcome,
      DrainOutcome::Completed { .. } | DrainOutcome::AlreadyRunning
    ));
    wait_for(|| context.queue().is_empty()).await;
    assert_eq!(mock.call_count("/api/tasks"), 1);
  }

  #[tokio::test]
  async fn test_cached_reads_survive_a_restart_offline() {
    let storage = Arc::new(MemoryStorage::default());
    let mock = Arc::new(MockFetch::new());
    mock.respond_json(
      HttpMethod::Get,
      "/api/tasks",
      r#"[{"id":"t-1","title":"buy milk","completed":false,"updated_at":"2024-05-01T10:00:00Z"}]"#,
    );

    {
      let context =
        SyncContext::new(api(&mock), Arc::clone(&storage), NetworkMonitor::new(true)).unwrap();
      let tasks = context.tasks().await.unwrap();
      assert_eq!(tasks.value.len(), 1);
      // Dropping the context persists the snapshot.
    }

    let context =
      SyncContext::new(api(&mock), Arc::clone(&storage), NetworkMonitor::new(false)).unwrap();
    let tasks = context.tasks().await.unwrap();
    assert_eq!(tasks.value[0].id, "t-1");
    assert!(tasks.stale);
    // Only the first session's fetch hit the network.
    assert_eq!(mock.call_count("/api/tasks"), 1);
  }
}
