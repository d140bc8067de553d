//! Connectivity tracking and the low-level fetch seam.
//!
//! [`NetworkMonitor`] is the single source of truth for online/offline state;
//! every component consults it before attempting network I/O. [`Fetch`] is the
//! seam all traffic flows through: the direct [`NetFetcher`] in plain setups,
//! or the cache gateway's handle when one is registered.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Single source of truth for connectivity state.
///
/// The state is fed by the embedding platform's connectivity signal via
/// [`set_online`](NetworkMonitor::set_online); the monitor performs no active
/// probing of its own. Cloning shares the underlying state.
#[derive(Clone)]
pub struct NetworkMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  /// Current connectivity as reported by the platform.
  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Ingest a platform connectivity signal. Repeated signals with the same
  /// value do not wake watchers.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|state| {
      if *state == online {
        false
      } else {
        *state = online;
        true
      }
    });

    if changed {
      if online {
        info!("network: online");
      } else {
        warn!("network: offline");
      }
    }
  }

  /// Subscribe to online/offline transitions.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

/// HTTP method subset the sync engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Delete => "DELETE",
    }
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// A request as seen by the fetch seam.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: HttpMethod,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Marks a top-level document request. Only navigations receive the
  /// offline fallback document when the network fails.
  pub navigation: bool,
}

impl FetchRequest {
  pub fn new(method: HttpMethod, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      navigation: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn navigation(url: Url) -> Self {
    let mut req = Self::new(HttpMethod::Get, url);
    req.navigation = true;
    req
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json_body<T: serde::Serialize>(mut self, body: &T) -> SyncResult<Self> {
    self.body = Some(serde_json::to_vec(body)?);
    self.headers.push(("content-type".to_string(), "application/json".to_string()));
    Ok(self)
  }

  /// Normalized request identity used as a cache key.
  pub fn key(&self) -> String {
    request_key(self.method, &self.url)
  }
}

/// Response snapshot produced by the fetch seam. Error statuses are carried
/// as responses, not errors; only transport-level failures surface as
/// [`SyncError`].
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn is_success(&self) -> bool {
    (200..400).contains(&self.status)
  }

  /// Classify the status into the error taxonomy, if it is a failure.
  pub fn error(&self) -> Option<SyncError> {
    SyncError::from_status(self.status)
  }

  pub fn json<T: serde::de::DeserializeOwned>(&self) -> SyncResult<T> {
    serde_json::from_slice(&self.body).map_err(Into::into)
  }
}

/// The seam all network traffic flows through.
pub trait Fetch: Send + Sync {
  fn fetch(&self, req: FetchRequest) -> BoxFuture<'_, SyncResult<FetchResponse>>;
}

/// Direct network fetcher over reqwest.
#[derive(Clone)]
pub struct NetFetcher {
  client: reqwest::Client,
}

impl NetFetcher {
  /// Build a fetcher with the given request timeout. Timeouts are this
  /// layer's responsibility, not the queue's or cache's.
  pub fn new(timeout: Duration) -> SyncResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::InvalidRequest(format!("failed to build http client: {}", e)))?;
    Ok(Self { client })
  }
}

impl Fetch for NetFetcher {
  fn fetch(&self, req: FetchRequest) -> BoxFuture<'_, SyncResult<FetchResponse>> {
    let client = self.client.clone();
    Box::pin(async move {
      let mut builder = client.request(req.method.into(), req.url.clone());
      for (name, value) in &req.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = req.body {
        builder = builder.body(body);
      }

      let resp = builder.send().await?;
      let status = resp.status().as_u16();
      let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
      let body = resp.bytes().await?.to_vec();

      Ok(FetchResponse {
        status,
        content_type,
        body,
      })
    })
  }
}

/// Normalized request identity: method plus URL with sorted query parameters
/// and no fragment, SHA-256 hashed for stable fixed-length keys.
pub fn request_key(method: HttpMethod, url: &Url) -> String {
  let input = format!("{} {}", method.as_str(), normalize_url(url));
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

fn normalize_url(url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let mut pairs: Vec<(String, String)> = normalized
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();

  if pairs.is_empty() {
    normalized.set_query(None);
  } else {
    pairs.sort();
    let query = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(pairs.iter())
      .finish();
    normalized.set_query(Some(&query));
  }

  normalized.to_string()
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transitions_reach_watchers() {
    let monitor = NetworkMonitor::new(true);
    let mut rx = monitor.watch();

    monitor.set_online(false);
    assert!(rx.has_changed().unwrap());
    rx.mark_unchanged();
    assert!(!monitor.is_online());

    // Duplicate signal: no wakeup.
    monitor.set_online(false);
    assert!(!rx.has_changed().unwrap());

    monitor.set_online(true);
    assert!(rx.has_changed().unwrap());
    assert!(monitor.is_online());
  }

  #[test]
  fn test_request_key_ignores_query_order_and_fragment() {
    let a = Url::parse("https://api.example.com/tasks?page=2&sort=due").unwrap();
    let b = Url::parse("https://api.example.com/tasks?sort=due&page=2#frag").unwrap();
    let c = Url::parse("https://api.example.com/tasks?sort=due&page=3").unwrap();

    assert_eq!(request_key(HttpMethod::Get, &a), request_key(HttpMethod::Get, &b));
    assert_ne!(request_key(HttpMethod::Get, &a), request_key(HttpMethod::Get, &c));
    assert_ne!(
      request_key(HttpMethod::Get, &a),
      request_key(HttpMethod::Delete, &a)
    );
  }
}
