//! Core types for the response cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::Response;

/// What a cache generation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Purpose {
  /// App shell populated at install
  Static,
  /// Responses picked up at runtime
  Dynamic,
  /// Copies of emergency API responses kept for audit/replay
  Emergency,
}

impl Purpose {
  pub const ALL: [Purpose; 3] = [Purpose::Static, Purpose::Dynamic, Purpose::Emergency];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Emergency => "emergency",
    }
  }
}

/// Identity under which a response is cached: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  method: String,
  url: String,
}

impl RequestIdentity {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length storage key.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// One stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub identity: RequestIdentity,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(identity: RequestIdentity, response: Response) -> Self {
    Self {
      identity,
      response,
      stored_at: Utc::now(),
    }
  }
}

/// Response handed back by the resolver, with metadata about where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response to give to the caller
  pub response: Response,
  /// Where the response came from
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// A cache hit served without touching the network.
  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
      cached_at: Some(entry.stored_at),
    }
  }

  /// A cached copy served because the network failed.
  pub fn offline(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Offline,
      cached_at: Some(entry.stored_at),
    }
  }

  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network failed, serving a cached copy
  Offline,
  /// Network and cache both unavailable
  Synthesized,
}
