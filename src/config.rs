use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::gateway::{GatewayManifest, ResponseStore};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Optional response-cache gateway; omit to run without one.
  pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Seconds before a cached read counts as stale
  #[serde(default = "default_stale_after_secs")]
  pub stale_after_secs: u64,
  /// Hours before an unused cached read is garbage collected
  #[serde(default = "default_gc_horizon_hours")]
  pub gc_horizon_hours: u64,
  /// Seconds between query snapshot writes
  #[serde(default = "default_snapshot_interval_secs")]
  pub snapshot_interval_secs: u64,
  /// Sync database location (defaults to the platform data directory)
  pub db_path: Option<PathBuf>,
}

fn default_stale_after_secs() -> u64 {
  300
}

fn default_gc_horizon_hours() -> u64 {
  24
}

fn default_snapshot_interval_secs() -> u64 {
  30
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: default_stale_after_secs(),
      gc_horizon_hours: default_gc_horizon_hours(),
      snapshot_interval_secs: default_snapshot_interval_secs(),
      db_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
  /// Cache version label; bump it to force a fresh install
  pub version: String,
  /// App shell URLs cached in full at install time
  pub shell: Vec<String>,
  /// Path prefix identifying API reads
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Document served to offline navigations
  pub offline_fallback: Option<String>,
  /// Gateway database location (defaults to the platform data directory)
  pub db_path: Option<PathBuf>,
}

fn default_api_prefix() -> String {
  "/api".to_string()
}

impl GatewayConfig {
  pub fn manifest(&self) -> Result<GatewayManifest> {
    let shell = self
      .shell
      .iter()
      .map(|s| Url::parse(s).map_err(|e| eyre!("Invalid gateway shell URL {}: {}", s, e)))
      .collect::<Result<Vec<_>>>()?;
    let offline_fallback = self
      .offline_fallback
      .as_deref()
      .map(|s| Url::parse(s).map_err(|e| eyre!("Invalid offline fallback URL {}: {}", s, e)))
      .transpose()?;

    Ok(GatewayManifest {
      version: self.version.clone(),
      shell,
      api_prefix: self.api_prefix.clone(),
      offline_fallback,
    })
  }

  /// Open the response store at the configured location, falling back to
  /// the platform data directory when `db_path` is unset.
  pub fn open_store(&self) -> Result<ResponseStore> {
    let store = match &self.db_path {
      Some(path) => ResponseStore::open_at(path)?,
      None => ResponseStore::open()?,
    };
    Ok(store)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tasksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tasksync/config.yaml
  /// 4. ~/.config/tasksync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tasksync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tasksync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tasksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn api_url(&self) -> Result<Url> {
    Url::parse(&self.api.url).map_err(|e| eyre!("Invalid API URL {}: {}", self.api.url, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks TASKSYNC_API_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("TASKSYNC_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the TASKSYNC_API_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_fills_defaults() {
    let config: Config = serde_yaml::from_str("api:\n  url: https://tasks.test/\n").unwrap();
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.sync.stale_after_secs, 300);
    assert_eq!(config.sync.gc_horizon_hours, 24);
    assert_eq!(config.sync.snapshot_interval_secs, 30);
    assert!(config.gateway.is_none());
  }

  #[test]
  fn test_gateway_section_builds_a_manifest() {
    let yaml = "\
api:
  url: https://tasks.test/
gateway:
  version: v2
  shell:
    - https://tasks.test/
    - https://tasks.test/app.js
  offline_fallback: https://tasks.test/offline.html
";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let manifest = config.gateway.unwrap().manifest().unwrap();
    assert_eq!(manifest.version, "v2");
    assert_eq!(manifest.shell.len(), 2);
    assert_eq!(manifest.api_prefix, "/api");
    assert!(manifest.offline_fallback.is_some());
  }

  #[test]
  fn test_bad_shell_url_is_rejected() {
    let yaml =
      "api:\n  url: https://tasks.test/\ngateway:\n  version: v1\n  shell: ['not a url']\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(config.gateway.unwrap().manifest().is_err());
  }

  #[test]
  fn test_gateway_store_opens_at_configured_path() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gateway.db");
    let yaml = format!(
      "api:\n  url: https://tasks.test/\ngateway:\n  version: v1\n  shell: []\n  db_path: {}\n",
      db_path.display()
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.gateway.unwrap().open_store().unwrap();
    assert!(db_path.exists());
  }
}
