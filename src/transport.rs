//! Network fetch seam and its reqwest implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Url;

use crate::http::{same_origin, Headers, Request, Response, ResponseKind};

/// Attempts a network fetch. An `Err` means the network step failed
/// (unreachable, reset, timed out); HTTP error statuses are `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Run a fetch bounded by `timeout`; hitting the deadline is a network failure.
pub async fn fetch_with_timeout(
  transport: &dyn Transport,
  request: &Request,
  timeout: Duration,
) -> Result<Response> {
  match tokio::time::timeout(timeout, transport.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(eyre!(
      "Network request to {} timed out after {:?}",
      request.url,
      timeout
    )),
  }
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  origin: Url,
}

impl HttpTransport {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("saferoute/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let kind = if same_origin(response.url(), &self.origin) {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      kind,
      headers,
      body: body.to_vec(),
    })
  }
}
