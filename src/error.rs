//! Error taxonomy for the sync engine.
//!
//! Classification drives behavior: server-side failures are retried with
//! backoff, client-side failures surface immediately, and an offline network
//! monitor short-circuits before any request is attempted.

use thiserror::Error;

/// Result alias used throughout the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Failures surfaced by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// The network monitor reports offline, or the request never reached the
  /// server. Never retried; the caller waits for the next online transition.
  #[error("network unavailable")]
  NetworkUnavailable,

  /// 5xx response. Retried with exponential backoff up to the attempt bound.
  #[error("server error: HTTP {status}")]
  ServerError { status: u16 },

  /// 4xx response other than 401. Surfaced immediately, never retried.
  #[error("client error: HTTP {status}")]
  ClientError { status: u16 },

  /// 401 response. Surfaces as an authentication failure; never retried or
  /// requeued.
  #[error("authentication failed (HTTP 401)")]
  Unauthorized,

  /// The user refused the push-notification permission prompt.
  #[error("push permission denied")]
  PermissionDenied,

  /// A cached record could not be read back. Self-heals on the next
  /// install/activate cycle rather than failing the request.
  #[error("cache corruption: {0}")]
  CacheCorruption(String),

  /// A request could not even be constructed (e.g. malformed endpoint URL).
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The gateway worker is no longer running. Reads fall back to the
  /// network; control operations surface this directly.
  #[error("gateway unavailable")]
  GatewayUnavailable,

  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(String),
}

impl SyncError {
  /// Classify an HTTP status code. Returns `None` for success statuses.
  pub fn from_status(status: u16) -> Option<SyncError> {
    match status {
      200..=399 => None,
      401 => Some(SyncError::Unauthorized),
      400..=499 => Some(SyncError::ClientError { status }),
      _ => Some(SyncError::ServerError { status }),
    }
  }

  /// Whether a retry with backoff is warranted. Only server-side failures
  /// qualify; everything else either can't succeed on retry or must wait
  /// for connectivity.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::ServerError { .. })
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if let Some(status) = e.status() {
      // Statuses normally arrive via the response path; this covers
      // error_for_status-style conversions.
      SyncError::from_status(status.as_u16()).unwrap_or(SyncError::NetworkUnavailable)
    } else if e.is_decode() {
      SyncError::Serialization(e.to_string())
    } else {
      // Connect failures, timeouts, aborted requests: the response never
      // arrived, which is indistinguishable from being offline.
      SyncError::NetworkUnavailable
    }
  }
}
