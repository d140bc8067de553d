//! # tasksync
//!
//! Offline-first sync engine for the task scheduler. Reads are served from a
//! local cache and revalidated in the background; writes are queued durably
//! and delivered when connectivity allows.
//!
//! ## Core Concepts
//!
//! - **Context**: Each window or process builds its own [`SyncContext`]
//! - **Queue**: Durable FIFO of pending writes, drained in order
//! - **Query cache**: Stale-while-revalidate reads with a persisted snapshot
//! - **Gateway**: Versioned response cache serving the app shell offline
//! - **Push**: Subscription lifecycle with rollback on partial failure
//!
//! ## Example
//!
//! ```ignore
//! use tasksync::{ApiClient, NetworkMonitor, SyncContext, SqliteStorage};
//!
//! let network = NetworkMonitor::new(true);
//! let storage = Arc::new(SqliteStorage::open()?);
//! let context = SyncContext::new(api, storage, network.clone())?;
//!
//! // Queued offline, delivered automatically once online.
//! context.submit(Mutation::Task(TaskMutation::Create(new_task)))?;
//!
//! // Served from cache when offline or fresh, revalidated when stale.
//! let tasks = context.tasks().await?;
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod net;
pub mod push;
pub mod query;
pub mod queue;
pub mod storage;

// Re-exports
pub use api::{ApiClient, ApiExecutor};
pub use context::{ContextOptions, SyncContext};
pub use error::{SyncError, SyncResult};
pub use gateway::{
  spawn as spawn_gateway, GatewayHandle, GatewayManifest, GatewayState, GatewayStatus,
  ResponseStore,
};
pub use net::{
  request_key, Fetch, FetchRequest, FetchResponse, HttpMethod, NetFetcher, NetworkMonitor,
};
pub use push::{PushManager, PushPlatform, PushState, PUSH_FLAG};
pub use query::{QueryCache, QueryResult};
pub use queue::{
  CategoryMutation, DrainOutcome, Mutation, MutationExecutor, MutationKind, MutationQueue,
  NoteMutation, QueuedMutation, SyncEvent, TaskMutation, MAX_RETRIES,
};
pub use storage::{MemoryStorage, SnapshotEntry, SqliteStorage, SyncStorage};
