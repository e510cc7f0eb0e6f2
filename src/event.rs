//! Host event loop: turns install/activate/fetch/message/sync/push events
//! into worker calls.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::http::{Request, Response};
use crate::outbox::{DrainOutcome, SyncTrigger};
use crate::push::Notification;
use crate::worker::Worker;

/// Events the host delivers to the worker
#[derive(Debug)]
pub enum HostEvent {
  Install,
  Activate,
  /// Intercepted request; the response goes back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Response>,
  },
  /// Control message posted by an app instance
  Message(Value),
  Sync(SyncTrigger),
  Push {
    payload: Option<Vec<u8>>,
    reply: Option<oneshot::Sender<Notification>>,
  },
  /// Periodic sync timer
  Tick,
}

/// Channel of host events, optionally fed by a periodic tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<HostEvent>,
  rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventHandler {
  /// Create a new event handler. With a `tick_rate`, a `Tick` is sent on
  /// that interval, the first one after a full interval.
  pub fn new(tick_rate: Option<Duration>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    if let Some(period) = tick_rate {
      let ticks = tx.clone();
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
          interval.tick().await;
          if ticks.send(HostEvent::Tick).is_err() {
            break;
          }
        }
      });
    }

    Self { tx, rx }
  }

  /// Handle for delivering events into the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<HostEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}

/// Dispatch events until `shutdown` resolves, one task per event. In-flight
/// tasks are awaited before returning.
pub async fn run<F>(worker: Arc<Worker>, mut events: EventHandler, shutdown: F)
where
  F: Future<Output = ()>,
{
  tokio::pin!(shutdown);
  let mut tasks = JoinSet::new();

  loop {
    tokio::select! {
      _ = &mut shutdown => {
        info!(in_flight = tasks.len(), "Shutting down event loop");
        break;
      }
      Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
        if let Err(e) = joined {
          warn!(error = %e, "Event task failed");
        }
      }
      event = events.next() => {
        let Some(event) = event else { break };
        let worker = worker.clone();
        tasks.spawn(async move { dispatch(&worker, event).await });
      }
    }
  }

  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      warn!(error = %e, "Event task failed");
    }
  }
}

async fn dispatch(worker: &Worker, event: HostEvent) {
  match event {
    HostEvent::Install => {
      if let Err(e) = worker.install().await {
        warn!(error = %e, "Install event failed");
      }
    }
    HostEvent::Activate => {
      if let Err(e) = worker.activate() {
        warn!(error = %e, "Activate event failed");
      }
    }
    HostEvent::Fetch { request, reply } => {
      let response = worker.respond(request).await;
      if reply.send(response).is_err() {
        debug!("Fetch requester went away");
      }
    }
    HostEvent::Message(message) => match worker.handle_message(&message) {
      Ok(outcome) => debug!(?outcome, "Handled message"),
      Err(e) => warn!(error = %e, "Rejected message"),
    },
    HostEvent::Sync(trigger) => drain(worker, trigger).await,
    HostEvent::Tick => drain(worker, SyncTrigger::Periodic).await,
    HostEvent::Push { payload, reply } => {
      let notification = worker.push(payload.as_deref());
      if let Some(reply) = reply {
        let _ = reply.send(notification);
      }
    }
  }
}

async fn drain(worker: &Worker, trigger: SyncTrigger) {
  match worker.sync(trigger).await {
    Ok(DrainOutcome::Completed(report)) => {
      debug!(synced = report.synced, failed = report.failed.len(), "Sync event done")
    }
    Ok(DrainOutcome::Coalesced) => debug!("Sync event coalesced into running drain"),
    Err(e) => warn!(error = %e, "Sync event failed"),
  }
}
