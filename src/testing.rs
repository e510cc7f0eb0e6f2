//! Test doubles for the network and delivery seams.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use url::Url;

use crate::http::{Request, Response};
use crate::outbox::{Deliverer, OutboxItem};
use crate::transport::Transport;

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
  Hang,
}

/// Transport answering from a fixed table. Unknown URLs fail like an
/// unreachable network.
#[derive(Default)]
pub struct MockTransport {
  routes: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<String>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.set(url, Reply::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Reply::Fail);
  }

  /// Never answer; only a timeout gets the caller out.
  pub fn hang(&self, url: &str) {
    self.set(url, Reply::Hang);
  }

  fn set(&self, url: &str, reply: Reply) {
    let url = Url::parse(url).unwrap().to_string();
    self.routes.lock().unwrap().insert(url, reply);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, url: &str) -> usize {
    let url = Url::parse(url).unwrap().to_string();
    self.calls().iter().filter(|c| **c == url).count()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());
    let reply = self.routes.lock().unwrap().get(&url).cloned();

    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Hang) => {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(eyre!("hung request to {} gave up", url))
      }
      Some(Reply::Fail) | None => Err(eyre!("network unreachable: {}", url)),
    }
  }
}

/// Deliverer recording what it sent, failing for chosen ids.
#[derive(Default)]
pub struct MockDeliverer {
  failing: Mutex<HashSet<i64>>,
  sent: Mutex<Vec<i64>>,
  gate: Option<Arc<Semaphore>>,
  entered: Arc<Notify>,
}

impl MockDeliverer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliveries block until `release` is called.
  pub fn gated() -> Self {
    Self {
      gate: Some(Arc::new(Semaphore::new(0))),
      ..Self::default()
    }
  }

  pub fn release(&self) {
    if let Some(gate) = &self.gate {
      gate.add_permits(1_000);
    }
  }

  /// Resolves once a delivery has started.
  pub async fn wait_entered(&self) {
    self.entered.notified().await;
  }

  pub fn fail_id(&self, id: i64) {
    self.failing.lock().unwrap().insert(id);
  }

  pub fn heal(&self) {
    self.failing.lock().unwrap().clear();
  }

  pub fn sent(&self) -> Vec<i64> {
    self.sent.lock().unwrap().clone()
  }
}

#[async_trait]
impl Deliverer for MockDeliverer {
  async fn deliver(&self, item: &OutboxItem) -> Result<()> {
    self.entered.notify_one();
    if let Some(gate) = &self.gate {
      gate.acquire().await.unwrap().forget();
    }

    self.sent.lock().unwrap().push(item.id);
    if self.failing.lock().unwrap().contains(&item.id) {
      Err(eyre!("delivery of item {} refused", item.id))
    } else {
      Ok(())
    }
  }
}
