//! Sync coordinator: drains the outbox when a trigger fires.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::deliver::Deliverer;
use super::store::{OutboxItem, OutboxKind, OutboxStore};
use crate::config::{Config, RetryConfig};
use crate::notify::{ClientEvent, ClientRegistry};

/// What asked for a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Explicit request: every item, backoff ignored
  Now,
  /// Host sync tag, mapped in config to the kinds it drains
  Tag(String),
  /// Scheduled drain of every item whose backoff has elapsed
  Periodic,
}

/// Exponential backoff between automatic retries of one item. There is no
/// attempt cap: an item stays queued until delivered or purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn new(config: &RetryConfig) -> Self {
    Self {
      base_delay: Duration::from_secs(config.base_delay_secs),
      max_delay: Duration::from_secs(config.max_delay_secs),
    }
  }

  /// Wait required after `attempts` failures.
  pub fn delay(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  pub fn is_due(&self, item: &OutboxItem, now: DateTime<Utc>) -> bool {
    match item.last_attempt_at {
      None => true,
      Some(last) => {
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.delay(item.attempts)
      }
    }
  }
}

/// Which items one drain pass considers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DrainScope {
  /// None means every kind
  kinds: Option<BTreeSet<OutboxKind>>,
  honour_backoff: bool,
}

impl DrainScope {
  fn includes(&self, kind: OutboxKind) -> bool {
    self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
  }

  /// Widen to cover both scopes.
  fn merge(self, other: DrainScope) -> DrainScope {
    let kinds = match (self.kinds, other.kinds) {
      (Some(mut a), Some(b)) => {
        a.extend(b);
        Some(a)
      }
      _ => None,
    };
    DrainScope {
      kinds,
      honour_backoff: self.honour_backoff && other.honour_backoff,
    }
  }
}

/// Totals of one drain, summed over any coalesced follow-up passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Items delivered and removed
  pub synced: usize,
  /// Items whose delivery failed; they stay queued
  pub failed: Vec<i64>,
  /// Items skipped because of scope or backoff
  pub deferred: usize,
  /// Passes run (1 + coalesced follow-ups)
  pub passes: usize,
}

impl DrainReport {
  fn absorb(&mut self, other: DrainReport) {
    self.synced += other.synced;
    self.failed.extend(other.failed);
    self.deferred += other.deferred;
    self.passes += other.passes;
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another drain was running; it will run one more pass covering this trigger
  Coalesced,
}

#[derive(Default)]
struct DrainState {
  running: bool,
  follow_up: Option<DrainScope>,
}

/// Clears `running` if a drain ends early by error or cancellation.
struct RunningGuard<'a> {
  state: &'a Mutex<DrainState>,
  armed: bool,
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      state.running = false;
    }
  }
}

/// Sole owner of the outbox: appends items and drains them.
pub struct SyncCoordinator {
  outbox: Arc<dyn OutboxStore>,
  deliverer: Arc<dyn Deliverer>,
  clients: ClientRegistry,
  tags: BTreeMap<String, BTreeSet<OutboxKind>>,
  retry: RetryPolicy,
  concurrency: usize,
  timeout: Duration,
  state: Mutex<DrainState>,
}

impl SyncCoordinator {
  pub fn new(
    config: &Config,
    outbox: Arc<dyn OutboxStore>,
    deliverer: Arc<dyn Deliverer>,
    clients: ClientRegistry,
  ) -> Self {
    let tags = config
      .outbox
      .sync_tags
      .iter()
      .map(|(tag, kinds)| (tag.clone(), kinds.iter().copied().collect()))
      .collect();

    Self {
      outbox,
      deliverer,
      clients,
      tags,
      retry: RetryPolicy::new(&config.outbox.retry),
      concurrency: config.outbox.max_concurrent_deliveries.max(1),
      timeout: config.network_timeout(),
      state: Mutex::new(DrainState::default()),
    }
  }

  /// Queue a payload and tell clients it is stored.
  pub fn store(&self, kind: OutboxKind, payload: &Value) -> Result<OutboxItem> {
    let item = self.outbox.enqueue(kind, payload)?;
    info!(id = item.id, kind = %kind, "Stored outbox item");
    self
      .clients
      .broadcast(ClientEvent::item_stored(item.id, kind));
    Ok(item)
  }

  pub fn pending(&self) -> Result<Vec<OutboxItem>> {
    self.outbox.pending()
  }

  pub fn purge(&self) -> Result<usize> {
    let purged = self.outbox.purge()?;
    warn!(purged, "Purged outbox");
    Ok(purged)
  }

  fn scope(&self, trigger: &SyncTrigger) -> Result<DrainScope> {
    match trigger {
      SyncTrigger::Now => Ok(DrainScope {
        kinds: None,
        honour_backoff: false,
      }),
      SyncTrigger::Periodic => Ok(DrainScope {
        kinds: None,
        honour_backoff: true,
      }),
      SyncTrigger::Tag(tag) => {
        let kinds = self
          .tags
          .get(tag)
          .ok_or_else(|| eyre!("Unsupported sync tag '{}'", tag))?;
        Ok(DrainScope {
          kinds: Some(kinds.clone()),
          honour_backoff: true,
        })
      }
    }
  }

  /// Drain the outbox. Single flight: a trigger arriving while a drain runs
  /// returns `Coalesced` and the running drain makes one more pass for it.
  pub async fn drain(&self, trigger: SyncTrigger) -> Result<DrainOutcome> {
    let mut scope = self.scope(&trigger)?;

    {
      let mut state = self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      if state.running {
        let merged = match state.follow_up.take() {
          Some(pending) => pending.merge(scope),
          None => scope,
        };
        state.follow_up = Some(merged);
        debug!(?trigger, "Drain already running, coalescing");
        return Ok(DrainOutcome::Coalesced);
      }
      state.running = true;
    }
    let mut running = RunningGuard {
      state: &self.state,
      armed: true,
    };

    info!(?trigger, "Draining outbox");
    let mut report = DrainReport::default();
    loop {
      report.absorb(self.drain_pass(&scope).await?);

      let mut state = self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      match state.follow_up.take() {
        Some(next) => scope = next,
        None => {
          // Cleared under the lock so a concurrent trigger either sees
          // `running` and queues a follow-up, or starts its own drain.
          state.running = false;
          running.armed = false;
          break;
        }
      }
    }

    info!(
      synced = report.synced,
      failed = report.failed.len(),
      deferred = report.deferred,
      "Drain finished"
    );
    Ok(DrainOutcome::Completed(report))
  }

  /// One pass over the outbox: every eligible item is sent at most once, in
  /// insertion order. A failed item is requeued and the pass continues.
  async fn drain_pass(&self, scope: &DrainScope) -> Result<DrainReport> {
    let now = Utc::now();
    let (eligible, deferred): (Vec<_>, Vec<_>) =
      self.outbox.pending()?.into_iter().partition(|item| {
        scope.includes(item.kind) && (!scope.honour_backoff || self.retry.is_due(item, now))
      });

    let mut report = DrainReport {
      deferred: deferred.len(),
      passes: 1,
      ..DrainReport::default()
    };

    let deliverer = &self.deliverer;
    let timeout = self.timeout;
    let mut deliveries = stream::iter(eligible)
      .map(|item| async move {
        let result = match tokio::time::timeout(timeout, deliverer.deliver(&item)).await {
          Ok(result) => result,
          Err(_) => Err(eyre!("Delivery timed out after {:?}", timeout)),
        };
        (item, result)
      })
      .buffered(self.concurrency);

    while let Some((item, result)) = deliveries.next().await {
      match result {
        Ok(()) => {
          if let Err(e) = self.outbox.remove(item.id) {
            // Delivered but still queued: it will be re-sent with the same
            // idempotency key.
            warn!(id = item.id, error = %e, "Failed to remove delivered item");
          }
          report.synced += 1;
          debug!(id = item.id, synced = report.synced, "Delivered outbox item");
          self
            .clients
            .broadcast(ClientEvent::item_synced(item.id, report.synced));
        }
        Err(e) => {
          warn!(id = item.id, attempts = item.attempts + 1, error = %e, "Delivery failed, requeueing");
          if let Err(e) = self.outbox.record_failure(item.id, Utc::now()) {
            warn!(id = item.id, error = %e, "Failed to record delivery attempt");
          }
          report.failed.push(item.id);
        }
      }
    }

    self
      .clients
      .broadcast(ClientEvent::sync_complete(report.synced));
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::Client;
  use crate::outbox::SqliteOutbox;
  use crate::testing::MockDeliverer;
  use serde_json::json;
  use url::Url;

  struct Fixture {
    coordinator: Arc<SyncCoordinator>,
    outbox: Arc<SqliteOutbox>,
    deliverer: Arc<MockDeliverer>,
    client: Client,
  }

  fn config() -> Config {
    Config::new(Url::parse("https://saferoute.app").unwrap(), "v1")
  }

  fn fixture_with(deliverer: MockDeliverer) -> Fixture {
    fixture_with_config(config(), deliverer)
  }

  fn fixture_with_config(config: Config, deliverer: MockDeliverer) -> Fixture {
    let outbox = Arc::new(SqliteOutbox::open_in_memory().unwrap());
    let deliverer = Arc::new(deliverer);
    let clients = ClientRegistry::new();
    let client = clients.attach();
    let coordinator = Arc::new(SyncCoordinator::new(
      &config,
      outbox.clone(),
      deliverer.clone(),
      clients,
    ));
    Fixture {
      coordinator,
      outbox,
      deliverer,
      client,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(MockDeliverer::new())
  }

  fn completed(outcome: DrainOutcome) -> DrainReport {
    match outcome {
      DrainOutcome::Completed(report) => report,
      DrainOutcome::Coalesced => panic!("drain was coalesced"),
    }
  }

  fn sync_counts(events: &[ClientEvent]) -> Vec<usize> {
    events
      .iter()
      .filter_map(|e| match e {
        ClientEvent::SyncComplete { count, .. } => Some(*count),
        _ => None,
      })
      .collect()
  }

  #[tokio::test]
  async fn test_store_then_drain_empties_outbox() {
    let mut f = fixture();
    let item = f
      .coordinator
      .store(OutboxKind::Emergency, &json!({ "sos": true }))
      .unwrap();

    let report = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());

    assert_eq!(report.synced, 1);
    assert_eq!(f.outbox.count().unwrap(), 0);
    let events = f.client.drain();
    assert!(matches!(events[0], ClientEvent::ItemStored { id, .. } if id == item.id));
    assert!(matches!(events[1], ClientEvent::ItemSynced { id, synced: 1, .. } if id == item.id));
    assert_eq!(sync_counts(&events), vec![1]);
  }

  #[tokio::test]
  async fn test_second_drain_sends_nothing() {
    let mut f = fixture();
    f.coordinator
      .store(OutboxKind::Location, &json!({ "lat": 1.0 }))
      .unwrap();

    f.coordinator.drain(SyncTrigger::Now).await.unwrap();
    let second = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());

    assert_eq!(second.synced, 0);
    assert_eq!(f.deliverer.sent().len(), 1);
    assert_eq!(sync_counts(&f.client.drain()), vec![1, 0]);
  }

  #[tokio::test]
  async fn test_empty_drain_still_reports_zero() {
    let mut f = fixture();
    completed(f.coordinator.drain(SyncTrigger::Periodic).await.unwrap());
    assert_eq!(sync_counts(&f.client.drain()), vec![0]);
  }

  #[tokio::test]
  async fn test_partial_failure_is_isolated() {
    let mut f = fixture();
    let ids: Vec<i64> = (1..=3)
      .map(|n| {
        f.coordinator
          .store(OutboxKind::Emergency, &json!({ "n": n }))
          .unwrap()
          .id
      })
      .collect();
    f.deliverer.fail_id(ids[1]);

    let report = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());

    assert_eq!(f.deliverer.sent(), ids);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, vec![ids[1]]);
    let remaining = f.outbox.pending().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, ids[1]);
    assert_eq!(remaining[0].attempts, 1);
    assert!(remaining[0].last_attempt_at.is_some());
    assert_eq!(sync_counts(&f.client.drain()), vec![2]);
  }

  #[tokio::test]
  async fn test_drain_follows_insertion_order() {
    let f = fixture();
    let ids: Vec<i64> = (0..6)
      .map(|n| {
        let kind = if n % 2 == 0 {
          OutboxKind::Location
        } else {
          OutboxKind::Emergency
        };
        f.coordinator.store(kind, &json!(n)).unwrap().id
      })
      .collect();

    completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());
    assert_eq!(f.deliverer.sent(), ids);
  }

  #[tokio::test]
  async fn test_concurrent_deliveries_keep_insertion_order() {
    let mut config = config();
    config.outbox.max_concurrent_deliveries = 3;
    let mut f = fixture_with_config(config, MockDeliverer::new());
    let ids: Vec<i64> = (0..4)
      .map(|n| {
        f.coordinator
          .store(OutboxKind::Location, &json!({ "n": n }))
          .unwrap()
          .id
      })
      .collect();
    f.client.drain();
    f.deliverer.fail_id(ids[0]);

    let report = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());

    assert_eq!(report.synced, 3);
    assert_eq!(report.failed, vec![ids[0]]);
    let synced: Vec<i64> = f
      .client
      .drain()
      .iter()
      .filter_map(|e| match e {
        ClientEvent::ItemSynced { id, .. } => Some(*id),
        _ => None,
      })
      .collect();
    assert_eq!(synced, ids[1..].to_vec());
    let remaining: Vec<(i64, u32)> = f
      .outbox
      .pending()
      .unwrap()
      .iter()
      .map(|item| (item.id, item.attempts))
      .collect();
    assert_eq!(remaining, vec![(ids[0], 1)]);
  }

  #[tokio::test]
  async fn test_delivery_timeout_counts_as_failure() {
    let mut config = config();
    config.network_timeout_secs = 1;
    // Never released, so every delivery hangs until the timeout.
    let f = fixture_with_config(config, MockDeliverer::gated());
    let item = f
      .coordinator
      .store(OutboxKind::Emergency, &json!({ "sos": true }))
      .unwrap();

    let report = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());

    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, vec![item.id]);
    let pending = f.outbox.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_attempt_at.is_some());
  }

  #[tokio::test]
  async fn test_tag_drains_only_mapped_kinds() {
    let f = fixture();
    let sos = f
      .coordinator
      .store(OutboxKind::Emergency, &json!({ "sos": true }))
      .unwrap();
    let ping = f
      .coordinator
      .store(OutboxKind::Location, &json!({ "lat": 2.0 }))
      .unwrap();

    let report = completed(
      f.coordinator
        .drain(SyncTrigger::Tag("sync-emergency".into()))
        .await
        .unwrap(),
    );

    assert_eq!(report.synced, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(f.deliverer.sent(), vec![sos.id]);
    assert_eq!(f.outbox.pending().unwrap()[0].id, ping.id);
  }

  #[tokio::test]
  async fn test_unknown_tag_is_rejected() {
    let f = fixture();
    f.coordinator
      .store(OutboxKind::Emergency, &json!({}))
      .unwrap();

    let err = f
      .coordinator
      .drain(SyncTrigger::Tag("sync-weather".into()))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("sync-weather"));
    assert!(f.deliverer.sent().is_empty());
  }

  #[tokio::test]
  async fn test_backoff_applies_to_automatic_triggers_only() {
    let f = fixture();
    let item = f
      .coordinator
      .store(OutboxKind::Emergency, &json!({}))
      .unwrap();
    f.deliverer.fail_id(item.id);
    completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());
    f.deliverer.heal();

    // Default base delay is 5s, so the item is still backing off
    let periodic = completed(f.coordinator.drain(SyncTrigger::Periodic).await.unwrap());
    assert_eq!(periodic.synced, 0);
    assert_eq!(periodic.deferred, 1);

    let manual = completed(f.coordinator.drain(SyncTrigger::Now).await.unwrap());
    assert_eq!(manual.synced, 1);
    assert_eq!(f.deliverer.sent(), vec![item.id, item.id]);
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_coalesced() {
    let f = fixture_with(MockDeliverer::gated());
    let first = f
      .coordinator
      .store(OutboxKind::Emergency, &json!(1))
      .unwrap();

    let coordinator = f.coordinator.clone();
    let running = tokio::spawn(async move { coordinator.drain(SyncTrigger::Now).await });
    f.deliverer.wait_entered().await;

    let second = f
      .coordinator
      .store(OutboxKind::Location, &json!(2))
      .unwrap();
    let outcome = f.coordinator.drain(SyncTrigger::Now).await.unwrap();
    assert_eq!(outcome, DrainOutcome::Coalesced);

    f.deliverer.release();
    let report = completed(running.await.unwrap().unwrap());

    assert_eq!(report.passes, 2);
    assert_eq!(report.synced, 2);
    assert_eq!(f.deliverer.sent(), vec![first.id, second.id]);
    assert_eq!(f.outbox.count().unwrap(), 0);
  }

  #[test]
  fn test_retry_delay_grows_and_caps() {
    let policy = RetryPolicy {
      base_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(60),
    };
    assert_eq!(policy.delay(0), Duration::ZERO);
    assert_eq!(policy.delay(1), Duration::from_secs(5));
    assert_eq!(policy.delay(2), Duration::from_secs(10));
    assert_eq!(policy.delay(4), Duration::from_secs(40));
    assert_eq!(policy.delay(5), Duration::from_secs(60));
    assert_eq!(policy.delay(64), Duration::from_secs(60));
  }

  #[test]
  fn test_scope_merge_widens() {
    let emergency = DrainScope {
      kinds: Some(BTreeSet::from([OutboxKind::Emergency])),
      honour_backoff: true,
    };
    let location = DrainScope {
      kinds: Some(BTreeSet::from([OutboxKind::Location])),
      honour_backoff: true,
    };
    let merged = emergency.clone().merge(location);
    assert!(merged.includes(OutboxKind::Emergency) && merged.includes(OutboxKind::Location));
    assert!(merged.honour_backoff);

    let everything = emergency.merge(DrainScope {
      kinds: None,
      honour_backoff: false,
    });
    assert_eq!(everything.kinds, None);
    assert!(!everything.honour_backoff);
  }
}
