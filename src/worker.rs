//! The worker: owns every component and the install/activate state machine.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{
  ActivationReport, CacheStore, InstallReport, Intercept, LifecycleManager, SqliteCacheStore,
  StrategyResolver,
};
use crate::commands::ClientCommand;
use crate::config::Config;
use crate::http::{Request, Response};
use crate::notify::{ClientEvent, ClientRegistry};
use crate::outbox::{
  Deliverer, DrainOutcome, HttpDeliverer, OutboxItem, OutboxKind, OutboxStore, SqliteOutbox,
  SyncCoordinator, SyncTrigger,
};
use crate::push::{notification_from_push, Notification};
use crate::transport::{fetch_with_timeout, HttpTransport, Transport};

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; the host may retry it
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Result of a control message.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
  Stored(OutboxItem),
  /// Number of generations deleted
  Purged(usize),
  /// `None` when there was no installed version waiting
  Activated(Option<ActivationReport>),
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatus {
  pub name: String,
  pub entries: usize,
  pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
  pub version: String,
  pub state: WorkerState,
  pub generations: Vec<GenerationStatus>,
  pub pending: usize,
  pub clients: usize,
}

pub struct Worker {
  config: Config,
  state: Mutex<WorkerState>,
  store: Arc<dyn CacheStore>,
  lifecycle: LifecycleManager,
  resolver: StrategyResolver,
  sync: SyncCoordinator,
  clients: ClientRegistry,
  transport: Arc<dyn Transport>,
}

impl Worker {
  pub fn new(
    config: Config,
    store: Arc<dyn CacheStore>,
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    deliverer: Arc<dyn Deliverer>,
  ) -> Result<Self> {
    let clients = ClientRegistry::new();
    let lifecycle = LifecycleManager::new(&config, store.clone())?;
    let resolver = StrategyResolver::new(&config, store.clone(), transport.clone())?;
    let sync = SyncCoordinator::new(&config, outbox, deliverer, clients.clone());

    Ok(Self {
      config,
      state: Mutex::new(WorkerState::Parsed),
      store,
      lifecycle,
      resolver,
      sync,
      clients,
      transport,
    })
  }

  /// Wire the production stores and network clients from `config`.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.database_path()?;
    let store = Arc::new(SqliteCacheStore::open(&path)?);
    let outbox = Arc::new(SqliteOutbox::open(&path)?);
    let transport = HttpTransport::new(config.origin.clone())?;
    let deliverer = Arc::new(HttpDeliverer::new(&config, transport.client().clone())?);

    let worker = Self::new(config, store, outbox, Arc::new(transport), deliverer)?;
    worker.restore()?;
    Ok(worker)
  }

  /// Pick up where an earlier process left off. A version whose static
  /// generation exists is `Activated` if its activation was recorded, and
  /// otherwise still `Installed` and waiting.
  pub fn restore(&self) -> Result<WorkerState> {
    let mut state = self.lock_state()?;
    if *state == WorkerState::Parsed && self.lifecycle.is_installed()? {
      let restored = if self.lifecycle.is_active()? {
        WorkerState::Activated
      } else {
        WorkerState::Installed
      };
      debug!(version = %self.config.version, state = %restored, "Restored worker");
      *state = restored;
    }
    Ok(*state)
  }

  fn lock_state(&self) -> Result<MutexGuard<'_, WorkerState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, next: WorkerState) -> Result<()> {
    let mut state = self.lock_state()?;
    let from = *state;
    info!(%from, to = %next, version = %self.config.version, "Worker state change");
    *state = next;
    Ok(())
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(*self.lock_state()?)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  /// Pre-cache the app shell. On failure nothing is written; an already
  /// installed or activated worker keeps its state, any other becomes
  /// `Redundant`.
  pub async fn install(&self) -> Result<InstallReport> {
    let previous = self.state()?;
    self.set_state(WorkerState::Installing)?;

    let report = match self.lifecycle.install(self.transport.as_ref()).await {
      Ok(report) => report,
      Err(e) => {
        warn!(error = %e, "Install failed");
        let fallback = match previous {
          WorkerState::Installed | WorkerState::Activated => previous,
          _ => WorkerState::Redundant,
        };
        self.set_state(fallback)?;
        return Err(e);
      }
    };
    self.set_state(WorkerState::Installed)?;

    if report.superseded {
      self
        .clients
        .broadcast(ClientEvent::update_available(self.config.version.clone()));
    }

    if self.config.skip_waiting {
      self.activate()?;
    }
    Ok(report)
  }

  /// Delete superseded generations and take control of attached clients.
  pub fn activate(&self) -> Result<ActivationReport> {
    let previous = self.state()?;
    if !matches!(previous, WorkerState::Installed | WorkerState::Activated) {
      return Err(eyre!("Cannot activate a {} worker", previous));
    }

    self.set_state(WorkerState::Activating)?;
    let report = match self.lifecycle.activate() {
      Ok(report) => report,
      Err(e) => {
        self.set_state(previous)?;
        return Err(e);
      }
    };

    let claimed = self.clients.claim(&self.config.version);
    self.set_state(WorkerState::Activated)?;
    info!(
      kept = report.kept.len(),
      deleted = report.deleted.len(),
      claimed,
      "Activated"
    );
    Ok(report)
  }

  /// Activate now if an installed version is waiting.
  pub fn skip_waiting(&self) -> Result<Option<ActivationReport>> {
    match self.state()? {
      WorkerState::Installed => self.activate().map(Some),
      state => {
        debug!(%state, "Nothing waiting to activate");
        Ok(None)
      }
    }
  }

  /// Intercept a request. Until activation every request passes through.
  pub async fn fetch(&self, request: Request) -> Intercept {
    match self.state() {
      Ok(WorkerState::Activated) => self.resolver.handle(request).await,
      _ => Intercept::PassThrough(request),
    }
  }

  /// Produce the response the host would see, performing pass-through
  /// requests itself.
  pub async fn respond(&self, request: Request) -> Response {
    match self.fetch(request).await {
      Intercept::Respond(served) => served.response,
      Intercept::PassThrough(request) => self.pass_through(&request).await,
    }
  }

  /// Perform a request the worker declined to intercept. A network failure
  /// becomes the synthesized offline response.
  pub async fn pass_through(&self, request: &Request) -> Response {
    fetch_with_timeout(
      self.transport.as_ref(),
      request,
      self.config.network_timeout(),
    )
    .await
    .unwrap_or_else(|e| {
      warn!(url = %request.url, error = %e, "Pass-through request failed");
      Response::offline()
    })
  }

  /// Parse and run a `{"type": ...}` control message. Malformed or unknown
  /// messages fail with a `CommandError`.
  pub fn handle_message(&self, message: &Value) -> Result<CommandOutcome> {
    let command = ClientCommand::from_message(message)?;
    self.dispatch(command)
  }

  pub fn dispatch(&self, command: ClientCommand) -> Result<CommandOutcome> {
    match command {
      ClientCommand::StoreItem { kind, payload } => {
        Ok(CommandOutcome::Stored(self.store(kind, &payload)?))
      }
      ClientCommand::PurgeCaches => {
        let purged = self.lifecycle.purge()?;
        self.clients.broadcast(ClientEvent::caches_purged(purged));
        Ok(CommandOutcome::Purged(purged))
      }
      ClientCommand::SkipWaiting => Ok(CommandOutcome::Activated(self.skip_waiting()?)),
    }
  }

  pub fn store(&self, kind: OutboxKind, payload: &Value) -> Result<OutboxItem> {
    self.sync.store(kind, payload)
  }

  pub fn pending(&self) -> Result<Vec<OutboxItem>> {
    self.sync.pending()
  }

  pub fn purge_outbox(&self) -> Result<usize> {
    self.sync.purge()
  }

  pub async fn sync(&self, trigger: SyncTrigger) -> Result<DrainOutcome> {
    self.sync.drain(trigger).await
  }

  pub fn push(&self, payload: Option<&[u8]>) -> Notification {
    let notification = notification_from_push(payload);
    info!(title = %notification.title, tag = ?notification.tag, "Push received");
    notification
  }

  pub fn status(&self) -> Result<WorkerStatus> {
    let current = self.lifecycle.generations().current();
    let generations = self
      .store
      .generations()?
      .into_iter()
      .map(|name| {
        Ok(GenerationStatus {
          entries: self.store.entry_count(&name)?,
          current: current.contains(&name),
          name,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(WorkerStatus {
      version: self.config.version.clone(),
      state: self.state()?,
      generations,
      pending: self.sync.pending()?.len(),
      clients: self.clients.len(),
    })
  }
}
