//! Request gateway: an isolated worker that fronts all network traffic.
//!
//! The gateway runs on its own task with its own response database and is
//! reached only through message passing, mirroring how it would sit in a
//! separate process. It intercepts every request made through its handle and
//! applies one of three strategies:
//!
//! * shell assets and navigations: cache-first, with an offline fallback
//!   document for navigations when the network is down
//! * API reads: serve cached immediately, revalidate in the background
//! * everything else: straight to the network, never cached
//!
//! Versions move through install / activate explicitly. An install fetches
//! the entire shell before writing anything, so a failed install leaves no
//! trace; activation purges every older version's cached responses.

mod store;

pub use store::ResponseStore;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::net::{request_key, Fetch, FetchRequest, FetchResponse, HttpMethod};

/// Lifecycle states of one gateway version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
  /// Fetching and storing the shell.
  Installing,
  /// Shell stored; not yet serving.
  Installed,
  /// Purging older versions.
  Activating,
  /// Serving requests.
  Active,
  /// Replaced by a newer version.
  Redundant,
}

/// Everything one version needs to serve: its identity, the shell it
/// precached, and how to recognize API reads.
#[derive(Debug, Clone)]
pub struct GatewayManifest {
  /// Version label; changing it triggers a fresh install on update.
  pub version: String,
  /// Shell URLs fetched and cached in full at install time.
  pub shell: Vec<Url>,
  /// Path prefix identifying API reads (revalidated in the background).
  pub api_prefix: String,
  /// Document served to navigations when the network is down. Cached at
  /// install time like the shell.
  pub offline_fallback: Option<Url>,
}

/// Point-in-time view of the worker for status surfaces.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
  pub version: Option<String>,
  pub state: Option<GatewayState>,
}

/// State machine for one version. Transitions are strictly forward;
/// anything may become redundant.
#[derive(Debug)]
struct Lifecycle {
  version: String,
  state: GatewayState,
}

impl Lifecycle {
  fn begin(version: &str) -> Self {
    info!(version = %version, "gateway install started");
    Self {
      version: version.to_string(),
      state: GatewayState::Installing,
    }
  }

  fn advance(&mut self, next: GatewayState) -> SyncResult<()> {
    use GatewayState::*;
    let legal = matches!(
      (self.state, next),
      (Installing, Installed) | (Installed, Activating) | (Activating, Active)
    ) || next == Redundant;

    if !legal {
      return Err(SyncError::InvalidRequest(format!(
        "illegal gateway transition {:?} -> {:?}",
        self.state, next
      )));
    }
    debug!(version = %self.version, from = ?self.state, to = ?next, "gateway state");
    self.state = next;
    Ok(())
  }
}

/// How a single request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
  CacheFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

/// A version that finished installing: what serve decisions are made from.
struct ActiveVersion {
  version: String,
  shell_keys: HashSet<String>,
  fallback_key: Option<String>,
  api_prefix: String,
}

impl ActiveVersion {
  fn classify(&self, req: &FetchRequest) -> Strategy {
    if req.navigation || self.shell_keys.contains(&req.key()) {
      Strategy::CacheFirst
    } else if req.method == HttpMethod::Get && req.url.path().starts_with(&self.api_prefix) {
      Strategy::StaleWhileRevalidate
    } else {
      Strategy::NetworkOnly
    }
  }
}

enum GatewayMsg {
  Fetch {
    req: FetchRequest,
    reply: oneshot::Sender<SyncResult<FetchResponse>>,
  },
  Update {
    manifest: GatewayManifest,
    reply: oneshot::Sender<SyncResult<()>>,
  },
  Status {
    reply: oneshot::Sender<GatewayStatus>,
  },
}

/// Page-side handle to the gateway worker. Cheap to clone.
///
/// The handle fails open: if the worker has stopped, reads go straight to
/// the network instead of erroring.
#[derive(Clone)]
pub struct GatewayHandle {
  tx: mpsc::Sender<GatewayMsg>,
  direct: Arc<dyn Fetch>,
}

impl GatewayHandle {
  /// Install and activate a new version. Returns once the swap is complete;
  /// on failure the previous version keeps serving.
  pub async fn update(&self, manifest: GatewayManifest) -> SyncResult<()> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(GatewayMsg::Update { manifest, reply })
      .await
      .map_err(|_| SyncError::GatewayUnavailable)?;
    rx.await.map_err(|_| SyncError::GatewayUnavailable)?
  }

  pub async fn status(&self) -> SyncResult<GatewayStatus> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(GatewayMsg::Status { reply })
      .await
      .map_err(|_| SyncError::GatewayUnavailable)?;
    rx.await.map_err(|_| SyncError::GatewayUnavailable)
  }
}

impl Fetch for GatewayHandle {
  fn fetch(&self, req: FetchRequest) -> BoxFuture<'_, SyncResult<FetchResponse>> {
    Box::pin(async move {
      let (reply, rx) = oneshot::channel();
      let msg = GatewayMsg::Fetch {
        req: req.clone(),
        reply,
      };
      if self.tx.send(msg).await.is_err() {
        warn!("gateway worker gone; fetching directly");
        return self.direct.fetch(req).await;
      }
      match rx.await {
        Ok(result) => result,
        Err(_) => {
          warn!("gateway dropped a request; fetching directly");
          self.direct.fetch(req).await
        }
      }
    })
  }
}

/// Start the gateway worker. The initial manifest is installed before any
/// queued request is served; if that install fails the worker stays up and
/// passes requests through to the network untouched.
pub fn spawn(
  store: ResponseStore,
  net: Arc<dyn Fetch>,
  manifest: GatewayManifest,
) -> (GatewayHandle, JoinHandle<()>) {
  let (tx, rx) = mpsc::channel(32);
  let worker = Arc::new(GatewayWorker {
    store: Arc::new(store),
    net: Arc::clone(&net),
    active: Mutex::new(None),
    lifecycle: Mutex::new(None),
  });
  let handle = GatewayHandle { tx, direct: net };
  let join = tokio::spawn(run(worker, manifest, rx));
  (handle, join)
}

async fn run(
  worker: Arc<GatewayWorker>,
  manifest: GatewayManifest,
  mut rx: mpsc::Receiver<GatewayMsg>,
) {
  if let Err(e) = worker.update(manifest).await {
    warn!(error = %e, "initial gateway install failed; passing requests through");
  }

  while let Some(msg) = rx.recv().await {
    match msg {
      GatewayMsg::Fetch { req, reply } => {
        // Requests in flight keep the version they started with; an update
        // landing mid-request does not affect them.
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
          let _ = reply.send(worker.serve(req).await);
        });
      }
      GatewayMsg::Update { manifest, reply } => {
        let _ = reply.send(worker.update(manifest).await);
      }
      GatewayMsg::Status { reply } => {
        let _ = reply.send(worker.status());
      }
    }
  }
}

struct GatewayWorker {
  store: Arc<ResponseStore>,
  net: Arc<dyn Fetch>,
  active: Mutex<Option<Arc<ActiveVersion>>>,
  lifecycle: Mutex<Option<Lifecycle>>,
}

impl GatewayWorker {
  /// Install `manifest` and swap it in. No-op when the version is already
  /// active. On any failure the store and the serving version are untouched.
  async fn update(&self, manifest: GatewayManifest) -> SyncResult<()> {
    if self
      .active
      .lock()
      .as_ref()
      .is_some_and(|a| a.version == manifest.version)
    {
      debug!(version = %manifest.version, "gateway version already active");
      return Ok(());
    }

    let mut lifecycle = Lifecycle::begin(&manifest.version);
    let installed = self.install(&manifest).await?;
    lifecycle.advance(GatewayState::Installed)?;

    lifecycle.advance(GatewayState::Activating)?;
    let purged = self.store.purge_except(&manifest.version)?;
    lifecycle.advance(GatewayState::Active)?;
    if purged > 0 {
      info!(purged, "previous gateway versions purged");
    }

    let previous = self.active.lock().replace(Arc::new(installed));
    if let Some(previous) = previous {
      info!(version = %previous.version, "gateway version now redundant");
    }

    let mut slot = self.lifecycle.lock();
    if let Some(old) = slot.as_mut() {
      let _ = old.advance(GatewayState::Redundant);
    }
    *slot = Some(lifecycle);

    info!(version = %manifest.version, "gateway version active");
    Ok(())
  }

  /// Fetch the entire shell, then write it in one transaction. Any fetch
  /// failure aborts the install with nothing written.
  async fn install(&self, manifest: &GatewayManifest) -> SyncResult<ActiveVersion> {
    let mut entries: Vec<(String, FetchResponse)> = Vec::new();
    let mut shell_keys = HashSet::new();

    for url in manifest.shell.iter().chain(manifest.offline_fallback.iter()) {
      let req = FetchRequest::get(url.clone());
      let key = req.key();
      let resp = self.net.fetch(req).await?;
      if let Some(err) = resp.error() {
        warn!(
          version = %manifest.version,
          url = %url,
          status = resp.status,
          "shell fetch failed; install aborted"
        );
        return Err(err);
      }
      shell_keys.insert(key.clone());
      entries.push((key, resp));
    }

    self.store.put_all(&manifest.version, &entries)?;

    let fallback_key = manifest
      .offline_fallback
      .as_ref()
      .map(|url| request_key(HttpMethod::Get, url));

    Ok(ActiveVersion {
      version: manifest.version.clone(),
      shell_keys,
      fallback_key,
      api_prefix: manifest.api_prefix.clone(),
    })
  }

  async fn serve(&self, req: FetchRequest) -> SyncResult<FetchResponse> {
    let active = self.active.lock().clone();
    let Some(active) = active else {
      // No version has activated yet; the gateway adds nothing.
      return self.net.fetch(req).await;
    };

    match active.classify(&req) {
      Strategy::CacheFirst => self.serve_cache_first(&active, req).await,
      Strategy::StaleWhileRevalidate => self.serve_swr(&active, req).await,
      Strategy::NetworkOnly => self.net.fetch(req).await,
    }
  }

  async fn serve_cache_first(
    &self,
    active: &Arc<ActiveVersion>,
    req: FetchRequest,
  ) -> SyncResult<FetchResponse> {
    let key = req.key();

    match self.store.get(&active.version, &key) {
      Ok(Some(cached)) => return Ok(cached),
      Ok(None) => {}
      // A bad row must not take the request down; the network still works.
      Err(e) => warn!(error = %e, "cache read failed; trying the network"),
    }

    let navigation = req.navigation;
    match self.net.fetch(req).await {
      Ok(resp) => {
        if resp.is_success() {
          if let Err(e) = self.store.put(&active.version, &key, &resp) {
            warn!(error = %e, "failed to cache response");
          }
        }
        Ok(resp)
      }
      Err(e) if navigation => {
        if let Some(doc) = self.offline_fallback(active) {
          debug!("serving offline fallback document");
          Ok(doc)
        } else {
          Err(e)
        }
      }
      Err(e) => Err(e),
    }
  }

  async fn serve_swr(
    &self,
    active: &Arc<ActiveVersion>,
    req: FetchRequest,
  ) -> SyncResult<FetchResponse> {
    let key = req.key();

    match self.store.get(&active.version, &key) {
      Ok(Some(cached)) => {
        self.spawn_revalidation(Arc::clone(active), req);
        return Ok(cached);
      }
      Ok(None) => {}
      Err(e) => warn!(error = %e, "cache read failed; trying the network"),
    }

    let resp = self.net.fetch(req).await?;
    if resp.is_success() {
      if let Err(e) = self.store.put(&active.version, &key, &resp) {
        warn!(error = %e, "failed to cache response");
      }
    }
    Ok(resp)
  }

  fn offline_fallback(&self, active: &ActiveVersion) -> Option<FetchResponse> {
    let key = active.fallback_key.as_ref()?;
    match self.store.get(&active.version, key) {
      Ok(doc) => doc,
      Err(e) => {
        warn!(error = %e, "offline fallback unreadable");
        None
      }
    }
  }

  fn spawn_revalidation(&self, active: Arc<ActiveVersion>, req: FetchRequest) {
    let net = Arc::clone(&self.net);
    let store = Arc::clone(&self.store);
    let store_key = req.key();
    // The caller already has the cached response; this refresh is best
    // effort and its failures never surface.
    let version = active.version.clone();
    tokio::spawn(async move {
      match net.fetch(req).await {
        Ok(resp) if resp.is_success() => {
          if let Err(e) = store.put(&version, &store_key, &resp) {
            warn!(error = %e, "failed to store revalidated response");
          }
        }
        Ok(resp) => debug!(status = resp.status, "revalidation got error status"),
        Err(e) => debug!(error = %e, "revalidation failed"),
      }
    });
  }

  fn status(&self) -> GatewayStatus {
    let lifecycle = self.lifecycle.lock();
    GatewayStatus {
      version: lifecycle.as_ref().map(|l| l.version.clone()),
      state: lifecycle.as_ref().map(|l| l.state),
    }
  }
}
