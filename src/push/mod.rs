//! Push notification subscription lifecycle.
//!
//! Subscribing is a multi-step handshake: ask the user for permission, fetch
//! the server's public key, mint a platform subscription, then register it
//! with the backend. A failure at any step rolls the earlier steps back, so
//! the device never ends up half-subscribed. The resulting state is persisted
//! as a storage flag that other contexts can observe.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::types::PushSubscriptionRecord;
use crate::api::ApiClient;
use crate::error::{SyncError, SyncResult};
use crate::storage::SyncStorage;

/// Storage flag mirrored by every context's [`PushManager`].
pub const PUSH_FLAG: &str = "push_subscribed";

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
  Unsubscribed,
  /// The subscribe handshake is running. No second handshake may start.
  Pending,
  Subscribed,
}

/// Platform integration seam: permission prompts and the device-side push
/// registration live behind this trait.
pub trait PushPlatform: Send + Sync {
  /// Prompt the user for notification permission. `false` means denied or
  /// dismissed.
  fn request_permission(&self) -> BoxFuture<'_, SyncResult<bool>>;

  /// Create a device subscription bound to the server's public key.
  fn subscribe<'a>(&'a self, server_key: &'a str)
    -> BoxFuture<'a, SyncResult<PushSubscriptionRecord>>;

  /// Revoke the device subscription. Succeeds when none exists.
  fn unsubscribe(&self) -> BoxFuture<'_, SyncResult<()>>;

  /// The device subscription currently held by the platform, if any.
  fn current(&self) -> BoxFuture<'_, SyncResult<Option<PushSubscriptionRecord>>>;
}

/// Drives the subscribe/unsubscribe handshakes and keeps the persisted
/// subscription flag consistent with reality.
pub struct PushManager<S: SyncStorage> {
  platform: Arc<dyn PushPlatform>,
  api: ApiClient,
  storage: Arc<S>,
  state: Mutex<PushState>,
  record: Mutex<Option<PushSubscriptionRecord>>,
  flag: watch::Sender<bool>,
}

impl<S: SyncStorage> PushManager<S> {
  /// Restore the manager from the persisted flag.
  pub fn new(
    platform: Arc<dyn PushPlatform>,
    api: ApiClient,
    storage: Arc<S>,
  ) -> SyncResult<Self> {
    let subscribed = storage.get_flag(PUSH_FLAG)?;
    let state = if subscribed {
      PushState::Subscribed
    } else {
      PushState::Unsubscribed
    };
    let (flag, _) = watch::channel(subscribed);

    Ok(Self {
      platform,
      api,
      storage,
      state: Mutex::new(state),
      record: Mutex::new(None),
      flag,
    })
  }

  pub fn state(&self) -> PushState {
    *self.state.lock()
  }

  pub fn is_subscribed(&self) -> bool {
    self.state() == PushState::Subscribed
  }

  /// Observe the subscribed flag; other contexts watch this to mirror
  /// subscription changes.
  pub fn subscribed_watch(&self) -> watch::Receiver<bool> {
    self.flag.subscribe()
  }

  /// Run the subscribe handshake.
  ///
  /// Permission is requested before anything touches the network; a denied
  /// prompt means zero backend calls. Already subscribed is a no-op. Any
  /// later failure revokes whatever the handshake created.
  pub async fn subscribe(&self) -> SyncResult<()> {
    {
      let mut state = self.state.lock();
      match *state {
        PushState::Subscribed => return Ok(()),
        PushState::Pending => {
          return Err(SyncError::InvalidRequest(
            "push subscription already in progress".to_string(),
          ))
        }
        PushState::Unsubscribed => *state = PushState::Pending,
      }
    }

    let result = self.subscribe_inner().await;
    if result.is_err() {
      self.set_state(PushState::Unsubscribed);
    }
    result
  }

  async fn subscribe_inner(&self) -> SyncResult<()> {
    if !self.platform.request_permission().await? {
      debug!("push permission denied; nothing was created");
      return Err(SyncError::PermissionDenied);
    }

    let server_key = self.api.push_server_key().await?;
    let record = self.platform.subscribe(&server_key).await?;

    if let Err(e) = self.api.register_push_subscription(&record).await {
      // The platform subscription exists but the backend never heard of
      // it; revoke it so the device is back where it started.
      self.revoke_platform().await;
      return Err(e);
    }

    if let Err(e) = self.storage.set_flag(PUSH_FLAG, true) {
      // A subscription we cannot record must not exist at all.
      if let Err(be) = self.api.remove_push_subscription(&record.endpoint).await {
        warn!(error = %be, "backend rollback failed");
      }
      self.revoke_platform().await;
      return Err(e);
    }

    *self.record.lock() = Some(record);
    self.set_state(PushState::Subscribed);
    info!("push subscription active");
    Ok(())
  }

  /// Tear the subscription down. Safe to call in any state and safe to
  /// repeat; with no active subscription it is a no-op that touches
  /// neither the platform nor the network.
  pub async fn unsubscribe(&self) -> SyncResult<()> {
    if self.state() == PushState::Pending {
      return Err(SyncError::InvalidRequest(
        "push subscription in progress".to_string(),
      ));
    }

    let record = self.record.lock().clone();
    // The storage flag, not in-process state, decides: another context may
    // have subscribed since this manager was built.
    if record.is_none() && !self.storage.get_flag(PUSH_FLAG)? {
      debug!("no push subscription to remove");
      return Ok(());
    }

    let record = match record {
      // Flag set but the record was created by an earlier process; the
      // platform still knows it.
      Some(record) => Some(record),
      None => self.platform.current().await?,
    };

    self.platform.unsubscribe().await?;

    if let Some(record) = record {
      // Best effort: a dead device record on the server gets pruned when
      // the next push to it fails.
      if let Err(e) = self.api.remove_push_subscription(&record.endpoint).await {
        warn!(error = %e, "backend unsubscribe failed; stale record left for server-side pruning");
      }
    }

    self.storage.set_flag(PUSH_FLAG, false)?;
    *self.record.lock() = None;
    self.set_state(PushState::Unsubscribed);
    Ok(())
  }

  async fn revoke_platform(&self) {
    if let Err(e) = self.platform.unsubscribe().await {
      warn!(error = %e, "failed to revoke platform subscription during rollback");
    }
  }

  fn set_state(&self, next: PushState) {
    let mut state = self.state.lock();
    if *state != next {
      debug!(from = ?*state, to = ?next, "push state");
    }
    *state = next;
    drop(state);
    self.flag.send_replace(next == PushState::Subscribed);
  }
}
