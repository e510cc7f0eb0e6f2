//! Request and response values exchanged between the host, the strategy
//! resolver and the cache store.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  /// Shorthand for a plain GET.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET that declares it accepts HTML, as a browser navigation does.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_header("Accept", "text/html,application/xhtml+xml")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Whether the declared accept-type includes an HTML media type.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }
}

/// How a response may be treated with respect to caching, mirroring the
/// fetch response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Readable cross-origin response
  Cors,
  /// Cross-origin response whose status and body are hidden
  Opaque,
  /// Network error or synthesized failure
  Error,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "error" => Some(Self::Error),
      _ => None,
    }
  }
}

/// A fully buffered response. Cloning copies the body, so a response can be
/// both persisted and handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: StatusCode,
  pub kind: ResponseKind,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, kind: ResponseKind, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      kind,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// A same-origin 200 response.
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(StatusCode::OK, ResponseKind::Basic, body)
  }

  /// The synthesized response returned when neither network nor cache can
  /// answer.
  pub fn offline() -> Self {
    Self::new(
      StatusCode::SERVICE_UNAVAILABLE,
      ResponseKind::Error,
      "Offline: the resource is not available in the local cache",
    )
    .with_header("Content-Type", "text/plain; charset=utf-8")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Only successful, readable responses may be persisted.
  pub fn is_cacheable(&self) -> bool {
    self.status.is_success() && matches!(self.kind, ResponseKind::Basic | ResponseKind::Cors)
  }
}

/// Scheme, host and port equality.
pub fn same_origin(a: &Url, b: &Url) -> bool {
  a.scheme() == b.scheme()
    && a.host_str() == b.host_str()
    && a.port_or_known_default() == b.port_or_known_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_accepts_html() {
    let url = Url::parse("https://saferoute.app/").unwrap();
    assert!(Request::navigate(url.clone()).accepts_html());
    assert!(!Request::get(url.clone()).accepts_html());
    assert!(!Request::get(url).with_header("Accept", "image/png").accepts_html());
  }

  #[test]
  fn test_header_names_are_case_insensitive() {
    let url = Url::parse("https://saferoute.app/").unwrap();
    let request = Request::get(url).with_header("ACCEPT", "text/html");
    assert_eq!(request.header("Accept"), Some("text/html"));
  }

  #[test]
  fn test_cacheability() {
    assert!(Response::ok("x").is_cacheable());
    assert!(Response::new(StatusCode::OK, ResponseKind::Cors, "x").is_cacheable());
    assert!(!Response::new(StatusCode::OK, ResponseKind::Opaque, "").is_cacheable());
    assert!(!Response::new(StatusCode::NOT_FOUND, ResponseKind::Basic, "").is_cacheable());
    assert!(!Response::offline().is_cacheable());
  }

  #[test]
  fn test_same_origin() {
    let app = Url::parse("https://saferoute.app/index.html").unwrap();
    assert!(same_origin(
      &app,
      &Url::parse("https://saferoute.app:443/x").unwrap()
    ));
    assert!(!same_origin(
      &app,
      &Url::parse("http://saferoute.app/x").unwrap()
    ));
    assert!(!same_origin(
      &app,
      &Url::parse("https://unpkg.com/x").unwrap()
    ));
  }
}
