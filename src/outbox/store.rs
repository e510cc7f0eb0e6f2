//! Outbox storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::cache::{format_datetime, parse_datetime};
use crate::db;

/// What an outbox item carries; selects its delivery endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxKind {
  /// SOS report
  Emergency,
  /// Location ping
  Location,
}

impl OutboxKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Emergency => "emergency",
      Self::Location => "location",
    }
  }
}

impl fmt::Display for OutboxKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OutboxKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "emergency" => Ok(Self::Emergency),
      "location" => Ok(Self::Location),
      other => Err(eyre!("Unknown outbox item kind '{}'", other)),
    }
  }
}

/// One queued payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxItem {
  /// Monotonic id; enumeration order is ascending id
  pub id: i64,
  pub kind: OutboxKind,
  pub payload: Value,
  pub stored_at: DateTime<Utc>,
  /// Failed delivery attempts so far
  pub attempts: u32,
  pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Trait for outbox storage backends.
///
/// Each call is a single statement, so a terminated process never leaves a
/// partially recorded item.
pub trait OutboxStore: Send + Sync {
  /// Append an item.
  fn enqueue(&self, kind: OutboxKind, payload: &Value) -> Result<OutboxItem>;

  /// All pending items in insertion order.
  fn pending(&self) -> Result<Vec<OutboxItem>>;

  /// Bump the attempt count after a failed delivery.
  fn record_failure(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

  /// Remove a delivered item. Returns false if it was already gone.
  fn remove(&self, id: i64) -> Result<bool>;

  fn count(&self) -> Result<usize>;

  /// Drop every item. Only on explicit user request.
  fn purge(&self) -> Result<usize>;
}

/// SQLite-based outbox.
pub struct SqliteOutbox {
  conn: Mutex<Connection>,
}

impl SqliteOutbox {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::new(db::open(path)?))
  }

  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::new(db::open_in_memory()?))
  }

  pub fn new(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

type ItemRow = (i64, String, String, String, u32, Option<String>);

fn decode_item(row: ItemRow) -> Result<OutboxItem> {
  let (id, kind, payload, stored_at, attempts, last_attempt_at) = row;
  Ok(OutboxItem {
    id,
    kind: kind.parse()?,
    payload: serde_json::from_str(&payload)
      .map_err(|e| eyre!("Failed to deserialize outbox item {}: {}", id, e))?,
    stored_at: parse_datetime(&stored_at)?,
    attempts,
    last_attempt_at: last_attempt_at.as_deref().map(parse_datetime).transpose()?,
  })
}

impl OutboxStore for SqliteOutbox {
  fn enqueue(&self, kind: OutboxKind, payload: &Value) -> Result<OutboxItem> {
    let conn = self.lock()?;
    let stored_at = Utc::now();
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO outbox (kind, payload, stored_at, attempts) VALUES (?, ?, ?, 0)",
        params![kind.as_str(), data, format_datetime(&stored_at)],
      )
      .map_err(|e| eyre!("Failed to store outbox item: {}", e))?;

    Ok(OutboxItem {
      id: conn.last_insert_rowid(),
      kind,
      payload: payload.clone(),
      stored_at,
      attempts: 0,
      last_attempt_at: None,
    })
  }

  fn pending(&self) -> Result<Vec<OutboxItem>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, stored_at, attempts, last_attempt_at
         FROM outbox ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<rusqlite::Result<Vec<ItemRow>>>()
      .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

    rows.into_iter().map(decode_item).collect()
  }

  fn record_failure(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "UPDATE outbox SET attempts = attempts + 1, last_attempt_at = ? WHERE id = ?",
        params![format_datetime(&at), id],
      )
      .map_err(|e| eyre!("Failed to record attempt for outbox item {}: {}", id, e))?;

    Ok(())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM outbox WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove outbox item {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn count(&self) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count outbox items: {}", e))?;

    Ok(count as usize)
  }

  fn purge(&self) -> Result<usize> {
    let conn = self.lock()?;

    let purged = conn
      .execute("DELETE FROM outbox", [])
      .map_err(|e| eyre!("Failed to purge outbox: {}", e))?;

    Ok(purged)
  }
}
