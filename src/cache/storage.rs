//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, RequestIdentity};
use crate::db;
use crate::http::{Headers, Response, ResponseKind};

/// Trait for cache storage backends.
///
/// Every mutating call is atomic: a reader never observes a half-written
/// entry or a half-deleted generation.
pub trait CacheStore: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, name: &str) -> Result<()>;

  /// Names of all existing generations.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything in it. Returns false if it did not exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Store (or overwrite) one entry, creating the generation if needed.
  fn put(&self, generation: &str, entry: &CacheEntry) -> Result<()>;

  /// Store a batch of entries in a single transaction.
  fn put_all(&self, generation: &str, entries: &[CacheEntry]) -> Result<()>;

  /// Look up an entry in one generation.
  fn lookup(&self, generation: &str, identity: &RequestIdentity) -> Result<Option<CacheEntry>>;

  /// Most recently stored entry for `identity` among `generations`.
  fn lookup_latest(
    &self,
    generations: &[String],
    identity: &RequestIdentity,
  ) -> Result<Option<CacheEntry>>;

  /// Number of entries in a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;

  /// Record `version` as the activated one, replacing any earlier record.
  fn set_active_version(&self, version: &str) -> Result<()>;

  /// The version that last completed activation, if any.
  fn active_version(&self) -> Result<Option<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

impl SqliteCacheStore {
  /// Open the cache tables in the database at `path`.
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

const ENTRY_COLUMNS: &str = "method, url, status, kind, headers, body, stored_at";

/// Raw column values of a `cache_entries` row.
type EntryRow = (String, String, i64, String, String, Vec<u8>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn decode_row(identity: &RequestIdentity, row: EntryRow) -> Result<CacheEntry> {
  let (_method, _url, status, kind, headers, body, stored_at) = row;

  let status = u16::try_from(status)
    .ok()
    .and_then(|s| StatusCode::from_u16(s).ok())
    .ok_or_else(|| eyre!("Invalid cached status code {}", status))?;
  let kind =
    ResponseKind::parse(&kind).ok_or_else(|| eyre!("Invalid cached response kind '{}'", kind))?;
  let headers: Headers = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CacheEntry {
    identity: identity.clone(),
    response: Response {
      status,
      kind,
      headers,
      body,
    },
    stored_at: parse_datetime(&stored_at)?,
  })
}

fn insert_entry(conn: &Connection, generation: &str, entry: &CacheEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, identity_key, method, url, status, kind, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        generation,
        entry.identity.cache_key(),
        entry.identity.method(),
        entry.identity.url(),
        entry.response.status.as_u16(),
        entry.response.kind.as_str(),
        headers,
        entry.response.body,
        format_datetime(&entry.stored_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  Ok(())
}

fn ensure_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)",
      params![name, format_datetime(&Utc::now())],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", name, e))?;
  Ok(())
}

impl CacheStore for SqliteCacheStore {
  fn open_generation(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_generation(&conn, name)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let deleted = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn put(&self, generation: &str, entry: &CacheEntry) -> Result<()> {
    self.put_all(generation, std::slice::from_ref(entry))
  }

  fn put_all(&self, generation: &str, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, generation)?;
    for entry in entries {
      insert_entry(&tx, generation, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, generation: &str, identity: &RequestIdentity) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries WHERE generation = ? AND identity_key = ?",
          ENTRY_COLUMNS
        ),
        params![generation, identity.cache_key()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(|row| decode_row(identity, row)).transpose()
  }

  fn lookup_latest(
    &self,
    generations: &[String],
    identity: &RequestIdentity,
  ) -> Result<Option<CacheEntry>> {
    if generations.is_empty() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let placeholders = vec!["?"; generations.len()].join(", ");
    let sql = format!(
      "SELECT {} FROM cache_entries
       WHERE identity_key = ? AND generation IN ({})
       ORDER BY stored_at DESC
       LIMIT 1",
      ENTRY_COLUMNS, placeholders
    );

    let key = identity.cache_key();
    let values = std::iter::once(key.as_str()).chain(generations.iter().map(String::as_str));

    let row = conn
      .query_row(&sql, params_from_iter(values), read_row)
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(|row| decode_row(identity, row)).transpose()
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count as usize)
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO active_version (id, version, activated_at) VALUES (1, ?, ?)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version,
                                       activated_at = excluded.activated_at",
        params![version, format_datetime(&Utc::now())],
      )
      .map_err(|e| eyre!("Failed to record active version {}: {}", version, e))?;

    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    conn
      .query_row("SELECT version FROM active_version WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by `format_datetime`.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
