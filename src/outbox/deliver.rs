//! Outbox delivery seam and its HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use url::Url;

use super::store::{OutboxItem, OutboxKind};
use crate::config::Config;

/// Sends one outbox item. `Ok` means the receiver acknowledged it.
#[async_trait]
pub trait Deliverer: Send + Sync {
  async fn deliver(&self, item: &OutboxItem) -> Result<()>;
}

/// Key a receiver uses to discard re-sends of an already accepted item.
pub fn idempotency_key(id: i64) -> String {
  format!("saferoute-outbox-{}", id)
}

/// POSTs the JSON payload to the endpoint configured for the item's kind.
#[derive(Clone)]
pub struct HttpDeliverer {
  client: reqwest::Client,
  endpoints: BTreeMap<OutboxKind, Url>,
}

impl HttpDeliverer {
  pub fn new(config: &Config, client: reqwest::Client) -> Result<Self> {
    let endpoints = config
      .outbox
      .endpoints
      .keys()
      .map(|kind| -> Result<(OutboxKind, Url)> { Ok((*kind, config.endpoint_url(*kind)?)) })
      .collect::<Result<_>>()?;

    Ok(Self { client, endpoints })
  }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
  async fn deliver(&self, item: &OutboxItem) -> Result<()> {
    let endpoint = self
      .endpoints
      .get(&item.kind)
      .ok_or_else(|| eyre!("No delivery endpoint for {} items", item.kind))?;

    let body = serde_json::to_vec(&item.payload)
      .map_err(|e| eyre!("Failed to serialize outbox item {}: {}", item.id, e))?;

    self
      .client
      .post(endpoint.clone())
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .header("Idempotency-Key", idempotency_key(item.id))
      .body(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to deliver outbox item {}: {}", item.id, e))?
      .error_for_status()
      .map_err(|e| eyre!("Outbox item {} rejected: {}", item.id, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoints_resolved_against_origin() {
    let config = Config::new(Url::parse("https://saferoute.app").unwrap(), "v1");
    let deliverer = HttpDeliverer::new(&config, reqwest::Client::new()).unwrap();

    assert_eq!(
      deliverer.endpoints[&OutboxKind::Emergency].as_str(),
      "https://saferoute.app/api/emergency/sync"
    );
    assert_eq!(
      deliverer.endpoints[&OutboxKind::Location].as_str(),
      "https://saferoute.app/api/location/sync"
    );
  }

  #[test]
  fn test_idempotency_key_is_stable() {
    assert_eq!(idempotency_key(42), "saferoute-outbox-42");
  }
}
