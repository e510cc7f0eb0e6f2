//! Cache generation naming, install-time population and activation-time
//! garbage collection.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::storage::CacheStore;
use super::traits::{CacheEntry, Purpose, RequestIdentity};
use crate::config::Config;
use crate::http::Request;
use crate::transport::{fetch_with_timeout, Transport};

/// Names of the generations belonging to one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
  version: String,
}

impl Generations {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, purpose: Purpose) -> String {
    format!("{}-{}", self.version, purpose.as_str())
  }

  /// One generation name per purpose.
  pub fn current(&self) -> Vec<String> {
    Purpose::ALL.iter().map(|p| self.name(*p)).collect()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  /// Generation the manifest was written to
  pub generation: String,
  /// Number of manifest entries stored
  pub cached: usize,
  /// Whether generations of an earlier version were present
  pub superseded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub kept: Vec<String>,
  pub deleted: Vec<String>,
}

/// Owns generation naming and deletion.
pub struct LifecycleManager {
  store: Arc<dyn CacheStore>,
  generations: Generations,
  manifest: Vec<Url>,
  pinned: BTreeSet<String>,
  timeout: Duration,
}

impl LifecycleManager {
  pub fn new(config: &Config, store: Arc<dyn CacheStore>) -> Result<Self> {
    Ok(Self {
      store,
      generations: Generations::new(config.version.clone()),
      manifest: config.manifest_urls()?,
      pinned: config.pinned_caches.clone(),
      timeout: config.network_timeout(),
    })
  }

  pub fn generations(&self) -> &Generations {
    &self.generations
  }

  /// Generations activation retains.
  pub fn keep_set(&self) -> BTreeSet<String> {
    self
      .generations
      .current()
      .into_iter()
      .chain(self.pinned.iter().cloned())
      .collect()
  }

  /// Whether this version has been installed into the store.
  pub fn is_installed(&self) -> Result<bool> {
    let static_name = self.generations.name(Purpose::Static);
    Ok(self.store.generations()?.contains(&static_name))
  }

  /// Whether this version completed activation, possibly in an earlier process.
  pub fn is_active(&self) -> Result<bool> {
    Ok(self.store.active_version()?.as_deref() == Some(self.generations.version()))
  }

  /// Fetch every manifest entry and write them to the static generation in
  /// one transaction. Any failed or non-cacheable entry fails the install
  /// and nothing is written.
  pub async fn install(&self, transport: &dyn Transport) -> Result<InstallReport> {
    let static_name = self.generations.name(Purpose::Static);
    info!(
      version = self.generations.version(),
      entries = self.manifest.len(),
      "Caching app shell"
    );

    let keep = self.keep_set();
    let superseded = self
      .store
      .generations()?
      .iter()
      .any(|name| !keep.contains(name));

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = fetch_with_timeout(transport, &request, self.timeout)
        .await
        .map_err(|e| eyre!("Failed to pre-cache {}: {}", url, e))?;
      if !response.is_cacheable() {
        return Err(eyre!(
          "Failed to pre-cache {}: got {} ({})",
          url,
          response.status,
          response.kind.as_str()
        ));
      }
      Ok(CacheEntry::new(RequestIdentity::get(url), response))
    });
    let entries = try_join_all(fetches).await?;

    self.store.put_all(&static_name, &entries)?;
    for purpose in [Purpose::Dynamic, Purpose::Emergency] {
      self.store.open_generation(&self.generations.name(purpose))?;
    }

    info!(generation = %static_name, cached = entries.len(), "Install complete");
    Ok(InstallReport {
      generation: static_name,
      cached: entries.len(),
      superseded,
    })
  }

  /// Delete every generation outside the keep set and record this version
  /// as active. A failed delete is logged and left for the next activation.
  pub fn activate(&self) -> Result<ActivationReport> {
    let keep = self.keep_set();
    let mut report = ActivationReport::default();

    for name in self.store.generations()? {
      if keep.contains(&name) {
        report.kept.push(name);
        continue;
      }

      match self.store.delete_generation(&name) {
        Ok(_) => {
          info!(generation = %name, "Deleting old cache");
          report.deleted.push(name);
        }
        Err(e) => warn!(generation = %name, error = %e, "Failed to delete old cache"),
      }
    }

    self.store.set_active_version(self.generations.version())?;
    Ok(report)
  }

  /// Delete every generation, current ones included.
  pub fn purge(&self) -> Result<usize> {
    let mut purged = 0;
    for name in self.store.generations()? {
      if self.store.delete_generation(&name)? {
        purged += 1;
      }
    }
    info!(purged, "Purged caches");
    Ok(purged)
  }
}
