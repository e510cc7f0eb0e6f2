//! Strategy resolver that serves intercepted requests from network and cache.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::lifecycle::Generations;
use super::storage::CacheStore;
use super::traits::{CacheEntry, Purpose, RequestIdentity, Served};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::router::{RequestClass, Route, Router};
use crate::transport::{fetch_with_timeout, Transport};

/// Outcome of intercepting one request.
#[derive(Debug, Clone)]
pub enum Intercept {
  /// Not handled; the host performs the request untouched
  PassThrough(Request),
  /// Answered by a strategy
  Respond(Served),
}

/// Routes each request to its strategy.
///
/// Strategy failures never escape: every intercepted request resolves to a
/// live response, a cached copy, or a synthesized offline response. Storage
/// errors are logged and treated as cache misses.
pub struct StrategyResolver {
  router: Router,
  store: Arc<dyn CacheStore>,
  transport: Arc<dyn Transport>,
  generations: Generations,
  root: RequestIdentity,
  fallbacks: HashSet<RequestIdentity>,
  timeout: Duration,
}

impl StrategyResolver {
  pub fn new(
    config: &Config,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let root = config.resolve("/")?;
    let fallbacks = config
      .fallback_urls()?
      .iter()
      .map(RequestIdentity::get)
      .collect();

    Ok(Self {
      router: Router::new(config),
      store,
      transport,
      generations: Generations::new(config.version.clone()),
      root: RequestIdentity::get(&root),
      fallbacks,
      timeout: config.network_timeout(),
    })
  }

  /// Intercept a request.
  pub async fn handle(&self, request: Request) -> Intercept {
    match self.router.route(&request) {
      Route::PassThrough => {
        debug!(method = %request.method, url = %request.url, "Passing through");
        Intercept::PassThrough(request)
      }
      Route::Intercept(class) => Intercept::Respond(self.resolve(class, &request).await),
    }
  }

  /// Apply the strategy for `class`.
  pub async fn resolve(&self, class: RequestClass, request: &Request) -> Served {
    let identity = RequestIdentity::new(&request.method, &request.url);
    debug!(?class, url = %request.url, "Resolving request");

    match class {
      RequestClass::Navigation => self.network_first(request, &identity).await,
      RequestClass::Emergency => self.network_first_with_capture(request, &identity).await,
      RequestClass::ThirdParty => self.network_only(request, &identity).await,
      RequestClass::Static => self.cache_first(request, &identity).await,
    }
  }

  /// Network, then latest cached copy, then the cached root document.
  async fn network_first(&self, request: &Request, identity: &RequestIdentity) -> Served {
    match self.fetch(request).await {
      Ok(response) => {
        self.store_copy(Purpose::Dynamic, identity, &response);
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Navigation offline, falling back to cache");
        if let Some(entry) = self.lookup_current(identity) {
          return Served::offline(entry);
        }
        match self.lookup_current(&self.root) {
          Some(entry) => Served::offline(entry),
          None => Served::synthesized(Response::offline()),
        }
      }
    }
  }

  /// Network, keeping a copy in the emergency generation for replay.
  async fn network_first_with_capture(
    &self,
    request: &Request,
    identity: &RequestIdentity,
  ) -> Served {
    match self.fetch(request).await {
      Ok(response) => {
        self.store_copy(Purpose::Emergency, identity, &response);
        Served::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Emergency request offline, serving captured copy");
        match self.lookup(Purpose::Emergency, identity) {
          Some(entry) => Served::offline(entry),
          None => Served::synthesized(Response::offline()),
        }
      }
    }
  }

  /// Network result passed through; cache only for allow-listed resources.
  async fn network_only(&self, request: &Request, identity: &RequestIdentity) -> Served {
    let allow_listed = self.fallbacks.contains(identity);

    match self.fetch(request).await {
      Ok(response) => {
        if allow_listed {
          self.store_copy(Purpose::Dynamic, identity, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, allow_listed, "Third-party request failed");
        let cached = if allow_listed {
          self.lookup_current(identity)
        } else {
          None
        };
        match cached {
          Some(entry) => Served::offline(entry),
          None => Served::synthesized(Response::offline()),
        }
      }
    }
  }

  /// Cached copy if present, otherwise network (storing cacheable results).
  async fn cache_first(&self, request: &Request, identity: &RequestIdentity) -> Served {
    if let Some(entry) = self.lookup_current(identity) {
      return Served::from_cache(entry);
    }

    match self.fetch(request).await {
      Ok(response) => {
        self.store_copy(Purpose::Dynamic, identity, &response);
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Static asset unavailable");
        Served::synthesized(Response::offline())
      }
    }
  }

  async fn fetch(&self, request: &Request) -> Result<Response> {
    fetch_with_timeout(self.transport.as_ref(), request, self.timeout).await
  }

  /// Persist a clone of `response` if it is cacheable. The original is left
  /// for the caller.
  fn store_copy(&self, purpose: Purpose, identity: &RequestIdentity, response: &Response) {
    if !response.is_cacheable() {
      debug!(
        url = identity.url(),
        status = %response.status,
        kind = response.kind.as_str(),
        "Not caching response"
      );
      return;
    }

    let generation = self.generations.name(purpose);
    let entry = CacheEntry::new(identity.clone(), response.clone());
    if let Err(e) = self.store.put(&generation, &entry) {
      warn!(generation = %generation, url = identity.url(), error = %e, "Failed to cache response");
    }
  }

  /// Most recent copy across this version's generations.
  fn lookup_current(&self, identity: &RequestIdentity) -> Option<CacheEntry> {
    self
      .store
      .lookup_latest(&self.generations.current(), identity)
      .unwrap_or_else(|e| {
        warn!(url = identity.url(), error = %e, "Cache lookup failed");
        None
      })
  }

  fn lookup(&self, purpose: Purpose, identity: &RequestIdentity) -> Option<CacheEntry> {
    self
      .store
      .lookup(&self.generations.name(purpose), identity)
      .unwrap_or_else(|e| {
        warn!(url = identity.url(), error = %e, "Cache lookup failed");
        None
      })
  }

  /// Whether `url` is on the third-party offline allow-list.
  pub fn is_allow_listed(&self, url: &Url) -> bool {
    self.fallbacks.contains(&RequestIdentity::get(url))
  }
}
