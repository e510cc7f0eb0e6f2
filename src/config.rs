use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::outbox::OutboxKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// The app's own origin; requests to other hosts are third-party
  pub origin: Url,
  /// Version tag baked into cache generation names (e.g. "v2")
  pub version: String,
  /// Resources pre-cached at install, as paths or absolute URLs
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Path prefix of the emergency API namespace
  #[serde(default = "default_emergency_prefix")]
  pub emergency_prefix: String,
  /// Third-party resources that may be served from cache when offline
  #[serde(default)]
  pub third_party_fallbacks: Vec<String>,
  /// Cache generations activation never deletes
  #[serde(default)]
  pub pinned_caches: BTreeSet<String>,
  #[serde(default = "default_network_timeout_secs")]
  pub network_timeout_secs: u64,
  /// Activate right after install instead of waiting for SKIP_WAITING
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  #[serde(default)]
  pub outbox: OutboxConfig,
  /// Interval of the periodic sync trigger in `watch` mode
  #[serde(default = "default_periodic_sync_secs")]
  pub periodic_sync_secs: u64,
  /// Database file (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
  /// Delivery endpoint per item kind, as paths or absolute URLs
  #[serde(default = "default_endpoints")]
  pub endpoints: BTreeMap<OutboxKind, String>,
  /// Sync tag -> item kinds drained when that tag fires
  #[serde(default = "default_sync_tags")]
  pub sync_tags: BTreeMap<String, Vec<OutboxKind>>,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default = "default_max_concurrent_deliveries")]
  pub max_concurrent_deliveries: usize,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      endpoints: default_endpoints(),
      sync_tags: default_sync_tags(),
      retry: RetryConfig::default(),
      max_concurrent_deliveries: default_max_concurrent_deliveries(),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_base_delay_secs")]
  pub base_delay_secs: u64,
  #[serde(default = "default_max_delay_secs")]
  pub max_delay_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_secs: default_base_delay_secs(),
      max_delay_secs: default_max_delay_secs(),
    }
  }
}

fn default_manifest() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/manifest.json".to_string(),
    "/browserconfig.xml".to_string(),
  ]
}

fn default_emergency_prefix() -> String {
  "/api/emergency".to_string()
}

fn default_network_timeout_secs() -> u64 {
  10
}

fn default_true() -> bool {
  true
}

fn default_periodic_sync_secs() -> u64 {
  300
}

fn default_endpoints() -> BTreeMap<OutboxKind, String> {
  BTreeMap::from([
    (OutboxKind::Emergency, "/api/emergency/sync".to_string()),
    (OutboxKind::Location, "/api/location/sync".to_string()),
  ])
}

fn default_sync_tags() -> BTreeMap<String, Vec<OutboxKind>> {
  BTreeMap::from([
    ("sync-emergency".to_string(), vec![OutboxKind::Emergency]),
    ("sync-location".to_string(), vec![OutboxKind::Location]),
    (
      "sync-all".to_string(),
      vec![OutboxKind::Emergency, OutboxKind::Location],
    ),
  ])
}

fn default_max_concurrent_deliveries() -> usize {
  1
}

fn default_base_delay_secs() -> u64 {
  5
}

fn default_max_delay_secs() -> u64 {
  300
}

impl Config {
  /// Configuration with every optional key at its default.
  pub fn new(origin: Url, version: impl Into<String>) -> Self {
    Self {
      origin,
      version: version.into(),
      manifest: default_manifest(),
      emergency_prefix: default_emergency_prefix(),
      third_party_fallbacks: Vec::new(),
      pinned_caches: BTreeSet::new(),
      network_timeout_secs: default_network_timeout_secs(),
      skip_waiting: true,
      outbox: OutboxConfig::default(),
      periodic_sync_secs: default_periodic_sync_secs(),
      database: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./saferoute.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/saferoute/config.yaml
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
        "No configuration file found. Create one at ~/.config/saferoute/config.yaml\n\
                 or pass --config."
      )),
    }
  }

  /// First config file found in the default search locations.
  pub fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("saferoute.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("saferoute").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    Ok(config)
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, location: &str) -> Result<Url> {
    self
      .origin
      .join(location)
      .map_err(|e| eyre!("Invalid URL '{}': {}", location, e))
  }

  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.manifest.iter().map(|m| self.resolve(m)).collect()
  }

  pub fn fallback_urls(&self) -> Result<Vec<Url>> {
    self
      .third_party_fallbacks
      .iter()
      .map(|m| self.resolve(m))
      .collect()
  }

  pub fn endpoint_url(&self, kind: OutboxKind) -> Result<Url> {
    let endpoint = self
      .outbox
      .endpoints
      .get(&kind)
      .ok_or_else(|| eyre!("No delivery endpoint configured for {} items", kind))?;
    self.resolve(endpoint)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  pub fn periodic_sync_interval(&self) -> Duration {
    Duration::from_secs(self.periodic_sync_secs.max(1))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::db::default_path(),
    }
  }
}
