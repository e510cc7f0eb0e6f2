//! Request classification.

use reqwest::Method;
use url::Url;

use crate::config::Config;
use crate::http::Request;

/// Class of an intercepted request. Each class has exactly one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Accepts HTML: network-first, dynamic cache, root document floor
  Navigation,
  /// Emergency API namespace: network-first with offline capture
  Emergency,
  /// Another host: network-only with allow-listed cache fallback
  ThirdParty,
  /// Everything else: cache-first
  Static,
}

/// Routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; the host performs the request unmodified
  PassThrough,
  Intercept(RequestClass),
}

/// Classifies requests against the app origin and emergency prefix.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  emergency_prefix: String,
}

impl Router {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.clone(),
      emergency_prefix: config.emergency_prefix.trim_end_matches('/').to_string(),
    }
  }

  pub fn route(&self, request: &Request) -> Route {
    if request.method != Method::GET || !is_fetchable(&request.url) {
      return Route::PassThrough;
    }

    let class = if request.accepts_html() {
      RequestClass::Navigation
    } else if !self.is_own_host(&request.url) {
      RequestClass::ThirdParty
    } else if self.is_emergency_path(request.url.path()) {
      RequestClass::Emergency
    } else {
      RequestClass::Static
    };

    Route::Intercept(class)
  }

  fn is_own_host(&self, url: &Url) -> bool {
    url.host_str() == self.origin.host_str()
  }

  fn is_emergency_path(&self, path: &str) -> bool {
    if self.emergency_prefix.is_empty() {
      return false;
    }
    path == self.emergency_prefix
      || path
        .strip_prefix(self.emergency_prefix.as_str())
        .is_some_and(|rest| rest.starts_with('/'))
  }
}

/// Browser-internal schemes (extension:, data:, blob:, ...) are never fetched
/// through the cache.
fn is_fetchable(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn router() -> Router {
    Router::new(&Config::new(
      Url::parse("https://saferoute.app").unwrap(),
      "v1",
    ))
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_passes_through() {
    let request = Request::new(
      Method::POST,
      Url::parse("https://saferoute.app/api/emergency/report").unwrap(),
    );
    assert_eq!(router().route(&request), Route::PassThrough);
  }

  #[test]
  fn test_internal_schemes_pass_through() {
    assert_eq!(
      router().route(&get("chrome-extension://abcdef/script.js")),
      Route::PassThrough
    );
    assert_eq!(
      router().route(&get("data:text/plain,hello")),
      Route::PassThrough
    );
  }

  #[test]
  fn test_navigation_takes_precedence() {
    let request = Request::navigate(Url::parse("https://saferoute.app/api/emergency").unwrap());
    assert_eq!(
      router().route(&request),
      Route::Intercept(RequestClass::Navigation)
    );
  }

  #[test]
  fn test_emergency_prefix_matches_whole_segments() {
    let router = router();
    assert_eq!(
      router.route(&get("https://saferoute.app/api/emergency/contacts")),
      Route::Intercept(RequestClass::Emergency)
    );
    assert_eq!(
      router.route(&get("https://saferoute.app/api/emergency")),
      Route::Intercept(RequestClass::Emergency)
    );
    assert_eq!(
      router.route(&get("https://saferoute.app/api/emergencyx")),
      Route::Intercept(RequestClass::Static)
    );
  }

  #[test]
  fn test_other_host_is_third_party() {
    assert_eq!(
      router().route(&get("https://unpkg.com/leaflet@1.9.4/dist/leaflet.js")),
      Route::Intercept(RequestClass::ThirdParty)
    );
    assert_eq!(
      router().route(&get("https://tiles.example.org/api/emergency/x")),
      Route::Intercept(RequestClass::ThirdParty)
    );
  }

  #[test]
  fn test_default_is_static() {
    assert_eq!(
      router().route(&get("https://saferoute.app/css/app.css")),
      Route::Intercept(RequestClass::Static)
    );
  }
}
