//! Durable outbox for safety-critical payloads captured while offline.
//!
//! Items are appended by the app, drained by the sync coordinator on
//! reconnect or schedule, and removed only after confirmed delivery.

mod deliver;
mod store;
mod sync;

pub use deliver::{idempotency_key, Deliverer, HttpDeliverer};
pub use store::{OutboxItem, OutboxKind, OutboxStore, SqliteOutbox};
pub use sync::{DrainOutcome, DrainReport, RetryPolicy, SyncCoordinator, SyncTrigger};
