//! Fan-out of state-change events to attached app instances.
//!
//! Delivery is best-effort: clients attached at broadcast time receive the
//! event, everyone else never sees it. Nothing is buffered or replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::outbox::OutboxKind;

/// Event broadcast to clients, serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
  ItemStored {
    id: i64,
    kind: OutboxKind,
    timestamp: DateTime<Utc>,
  },
  /// One item delivered; `synced` counts deliveries so far in this drain
  ItemSynced {
    id: i64,
    synced: usize,
    timestamp: DateTime<Utc>,
  },
  SyncComplete {
    count: usize,
    timestamp: DateTime<Utc>,
  },
  UpdateAvailable {
    version: String,
    timestamp: DateTime<Utc>,
  },
  CachesPurged {
    count: usize,
    timestamp: DateTime<Utc>,
  },
}

impl ClientEvent {
  pub fn item_stored(id: i64, kind: OutboxKind) -> Self {
    Self::ItemStored {
      id,
      kind,
      timestamp: Utc::now(),
    }
  }

  pub fn item_synced(id: i64, synced: usize) -> Self {
    Self::ItemSynced {
      id,
      synced,
      timestamp: Utc::now(),
    }
  }

  pub fn sync_complete(count: usize) -> Self {
    Self::SyncComplete {
      count,
      timestamp: Utc::now(),
    }
  }

  pub fn update_available(version: impl Into<String>) -> Self {
    Self::UpdateAvailable {
      version: version.into(),
      timestamp: Utc::now(),
    }
  }

  pub fn caches_purged(count: usize) -> Self {
    Self::CachesPurged {
      count,
      timestamp: Utc::now(),
    }
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::ItemStored { .. } => "ITEM_STORED",
      Self::ItemSynced { .. } => "ITEM_SYNCED",
      Self::SyncComplete { .. } => "SYNC_COMPLETE",
      Self::UpdateAvailable { .. } => "UPDATE_AVAILABLE",
      Self::CachesPurged { .. } => "CACHES_PURGED",
    }
  }
}

/// An attached app instance's end of the registry.
pub struct Client {
  id: u64,
  rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Client {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Receive the next event
  pub async fn recv(&mut self) -> Option<ClientEvent> {
    self.rx.recv().await
  }

  /// Take an already delivered event without waiting.
  pub fn try_recv(&mut self) -> Option<ClientEvent> {
    self.rx.try_recv().ok()
  }

  /// Drain every delivered event.
  pub fn drain(&mut self) -> Vec<ClientEvent> {
    std::iter::from_fn(|| self.try_recv()).collect()
  }
}

struct Attached {
  tx: mpsc::UnboundedSender<ClientEvent>,
  /// Version that controls this client, once claimed
  controller: Option<String>,
}

#[derive(Default)]
struct Registry {
  next_id: u64,
  clients: BTreeMap<u64, Attached>,
}

/// Registry of attached clients. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ClientRegistry {
  inner: Arc<Mutex<Registry>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  // A panic elsewhere must not stop notifications, so poisoning is ignored.
  fn registry(&self) -> MutexGuard<'_, Registry> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn attach(&self) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = self.registry();
    registry.next_id += 1;
    let id = registry.next_id;
    registry.clients.insert(
      id,
      Attached {
        tx,
        controller: None,
      },
    );
    Client { id, rx }
  }

  pub fn detach(&self, id: u64) -> bool {
    self.registry().clients.remove(&id).is_some()
  }

  pub fn len(&self) -> usize {
    self.registry().clients.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Make `version` the controller of every attached client.
  pub fn claim(&self, version: &str) -> usize {
    let mut registry = self.registry();
    for client in registry.clients.values_mut() {
      client.controller = Some(version.to_string());
    }
    registry.clients.len()
  }

  pub fn controller(&self, id: u64) -> Option<String> {
    self
      .registry()
      .clients
      .get(&id)
      .and_then(|c| c.controller.clone())
  }

  /// Send `event` to every attached client, pruning closed ones. Returns the
  /// number of clients reached.
  pub fn broadcast(&self, event: ClientEvent) -> usize {
    let mut registry = self.registry();
    registry
      .clients
      .retain(|_, client| client.tx.send(event.clone()).is_ok());
    let reached = registry.clients.len();
    debug!(event = event.type_name(), reached, "Broadcast");
    reached
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_broadcast_reaches_attached_clients() {
    let registry = ClientRegistry::new();
    let mut a = registry.attach();
    let mut b = registry.attach();

    assert_eq!(registry.broadcast(ClientEvent::sync_complete(2)), 2);

    assert!(matches!(
      a.try_recv(),
      Some(ClientEvent::SyncComplete { count: 2, .. })
    ));
    assert!(matches!(
      b.try_recv(),
      Some(ClientEvent::SyncComplete { count: 2, .. })
    ));
  }

  #[test]
  fn test_late_clients_get_no_replay() {
    let registry = ClientRegistry::new();
    assert_eq!(registry.broadcast(ClientEvent::update_available("v2")), 0);

    let mut late = registry.attach();
    assert!(late.try_recv().is_none());
  }

  #[test]
  fn test_closed_clients_are_pruned() {
    let registry = ClientRegistry::new();
    let _kept = registry.attach();
    let dropped = registry.attach();
    drop(dropped);

    assert_eq!(registry.broadcast(ClientEvent::caches_purged(1)), 1);
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn test_claim_sets_controller() {
    let registry = ClientRegistry::new();
    let a = registry.attach();
    let b = registry.attach();
    assert_eq!(registry.controller(a.id()), None);

    assert_eq!(registry.claim("v3"), 2);
    assert_eq!(registry.controller(a.id()).as_deref(), Some("v3"));
    assert_eq!(registry.controller(b.id()).as_deref(), Some("v3"));

    assert!(registry.detach(b.id()));
    assert_eq!(registry.controller(b.id()), None);
  }

  #[test]
  fn test_event_wire_format() {
    let event = ClientEvent::sync_complete(0);
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "SYNC_COMPLETE");
    assert_eq!(json["count"], 0);
    assert!(json["timestamp"].is_string());

    let stored = serde_json::to_value(ClientEvent::item_stored(7, OutboxKind::Emergency)).unwrap();
    assert_eq!(stored["type"], "ITEM_STORED");
    assert_eq!(stored["kind"], "emergency");
  }
}
